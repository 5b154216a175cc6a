//! Source resolution: classify a path as a block device, a virtual-disk
//! image, a raw image, or a directory tree.
//!
//! Image formats are detected from their content, never from the file
//! extension. Anything that is a regular file but not a recognised image is
//! treated as raw; positively identifying a raw image would require parsing
//! partition tables.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, Result};
use crate::request::TargetKind;

/// QCOW2 magic bytes: "QFI\xfb".
const QCOW2_MAGIC: [u8; 4] = [0x51, 0x46, 0x49, 0xfb];

/// VMDK sparse extent magic: "KDMV".
const VMDK_SPARSE_MAGIC: [u8; 4] = *b"KDMV";

/// First line of a monolithic VMDK text descriptor.
const VMDK_DESCRIPTOR_MAGIC: &[u8] = b"# Disk DescriptorFile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    BlockDevice,
    Qcow2Image,
    VmdkImage,
    RawImage,
    Directory,
}

impl SourceKind {
    /// Human-readable format label shown to the user.
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::BlockDevice => "Block device",
            SourceKind::Qcow2Image => "qcow2",
            SourceKind::VmdkImage => "vmdk",
            SourceKind::RawImage => "raw",
            SourceKind::Directory => "directory",
        }
    }

    /// Whether the image must be converted to raw before transfer.
    pub fn needs_conversion(self) -> bool {
        matches!(self, SourceKind::Qcow2Image | SourceKind::VmdkImage)
    }

    /// The converter's input format name, for kinds that need conversion.
    pub fn converter_format(self) -> Option<&'static str> {
        match self {
            SourceKind::Qcow2Image => Some("qcow2"),
            SourceKind::VmdkImage => Some("vmdk"),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified source path. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    path: PathBuf,
    kind: SourceKind,
}

impl SourceDescriptor {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn format_label(&self) -> &'static str {
        self.kind.label()
    }

    /// Check that this source can feed a migration of the given kind:
    /// filesystem targets need a directory, disk targets need anything else.
    pub fn check_target(&self, target: TargetKind) -> Result<()> {
        let is_dir = self.kind == SourceKind::Directory;
        if target.is_filesystem() && !is_dir {
            return Err(MigrateError::UnsupportedSource {
                path: self.path.clone(),
                reason: format!("a {target} needs a root filesystem directory, found {}", self.kind),
            });
        }
        if !target.is_filesystem() && is_dir {
            return Err(MigrateError::UnsupportedSource {
                path: self.path.clone(),
                reason: format!("a {target} needs a disk, partition or image file, found a directory"),
            });
        }
        Ok(())
    }
}

/// Inspect `path` and classify it. Read-only.
pub fn resolve(path: &Path) -> Result<SourceDescriptor> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MigrateError::NotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(MigrateError::io(format!("failed to stat {}", path.display()), e));
        }
    };

    let file_type = meta.file_type();
    let kind = if file_type.is_block_device() {
        SourceKind::BlockDevice
    } else if file_type.is_dir() {
        SourceKind::Directory
    } else {
        sniff_image(path)
    };

    tracing::debug!("resolved {} as {kind}", path.display());
    Ok(SourceDescriptor {
        path: path.to_path_buf(),
        kind,
    })
}

fn sniff_image(path: &Path) -> SourceKind {
    let Ok(mut file) = File::open(path) else {
        return SourceKind::RawImage;
    };
    let mut head = [0u8; 32];
    let mut n = 0;
    // Short reads are possible on special files; fill what we can.
    while n < head.len() {
        match file.read(&mut head[n..]) {
            Ok(0) | Err(_) => break,
            Ok(read) => n += read,
        }
    }
    detect_magic(&head[..n])
}

fn detect_magic(head: &[u8]) -> SourceKind {
    if head.starts_with(&QCOW2_MAGIC) {
        SourceKind::Qcow2Image
    } else if head.starts_with(&VMDK_SPARSE_MAGIC) || head.starts_with(VMDK_DESCRIPTOR_MAGIC) {
        SourceKind::VmdkImage
    } else {
        SourceKind::RawImage
    }
}
