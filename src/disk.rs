//! Disk normalization for VM and block-volume migrations.
//!
//! qcow2 and vmdk images are converted to raw with `qemu-img` before the
//! transfer; block devices and raw images pass through untouched. Whatever
//! the result, it is exposed to the transfer step only through a read-only
//! bind mount so the remote side never sees a mutating source.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::command_run::{render_command, CommandRunner};
use crate::error::{MigrateError, Result};
use crate::mounts::MountOps;
use crate::source::SourceDescriptor;
use crate::tree::MountRecord;

/// External image converter.
pub const CONVERTER: &str = "qemu-img";

/// Conversion output, inside the session's temporary root.
pub const CONVERTED_IMAGE: &str = "converted-raw-image.img";

/// Read-only bind target for the image, inside the temporary root.
pub const IMAGE_MOUNT: &str = "root.img";

/// Whether `path` can be opened for direct I/O. Any failure, including a
/// missing file, counts as unsupported.
pub fn supports_direct_io(path: &Path) -> bool {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
        .is_ok()
}

/// Arguments for `nice`, which runs the converter at the lowest priority.
pub fn converter_args(
    format: &str,
    source: &Path,
    dest: &Path,
    source_direct: bool,
    dest_direct: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-n19", CONVERTER, "convert", "-f", format, "-O", "raw"]
        .iter()
        .map(OsString::from)
        .collect();
    args.extend(["-p", "-t", "writeback"].map(OsString::from));
    if source_direct {
        args.extend(["-T", "none"].map(OsString::from));
    }
    if dest_direct {
        args.extend(["-t", "none"].map(OsString::from));
    }
    args.push(source.as_os_str().to_owned());
    args.push(dest.as_os_str().to_owned());
    args
}

/// Convert the source to raw if needed and return the path to transfer.
///
/// The conversion output is pushed onto `scratch` before the converter
/// runs so a partial image is removed with the rest of the session.
pub fn normalize(
    source: &SourceDescriptor,
    temp_root: &Path,
    runner: &dyn CommandRunner,
    scratch: &mut Vec<PathBuf>,
) -> Result<PathBuf> {
    let Some(format) = source.kind().converter_format() else {
        tracing::debug!("{} is {}, no conversion needed", source.path().display(), source.kind());
        return Ok(source.path().to_path_buf());
    };

    if runner.lookup(CONVERTER).is_none() {
        return Err(MigrateError::ToolNotFound(CONVERTER.to_string()));
    }

    let dest = temp_root.join(CONVERTED_IMAGE);
    let source_direct = supports_direct_io(source.path());
    let dest_direct = supports_direct_io(&dest);
    tracing::debug!("direct I/O: source={source_direct} destination={dest_direct}");

    let args = converter_args(format, source.path(), &dest, source_direct, dest_direct);
    tracing::info!("converting image {} to raw format before importing", source.path().display());
    scratch.push(dest.clone());
    let exit = runner
        .run("nice", &args)
        .map_err(|e| MigrateError::Conversion {
            path: source.path().to_path_buf(),
            reason: format!("failed to run {}: {e}", render_command("nice", &args)),
        })?;
    if !exit.is_success() {
        return Err(MigrateError::Conversion {
            path: source.path().to_path_buf(),
            reason: exit.to_string(),
        });
    }
    Ok(dest)
}

/// Bind-mount `image` read-only at `<temp_root>/root.img` and return that
/// path.
pub fn mount_image(
    image: &Path,
    temp_root: &Path,
    mounts: &dyn MountOps,
    active: &mut Vec<MountRecord>,
) -> Result<PathBuf> {
    let target = temp_root.join(IMAGE_MOUNT);
    fs::write(&target, b"")
        .map_err(|e| MigrateError::io(format!("failed to create {}", target.display()), e))?;

    if let Err(e) = mounts.bind(image, &target) {
        let _ = fs::remove_file(&target);
        return Err(MigrateError::mount(image, e));
    }
    active.push(MountRecord {
        target: target.clone(),
        created: vec![target.clone()],
    });

    mounts
        .remount_readonly(&target)
        .map_err(|e| MigrateError::mount(image, e))?;
    tracing::debug!("mounted {} read-only at {}", image.display(), target.display());
    Ok(target)
}
