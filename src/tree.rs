//! Source tree assembly for filesystem migrations.
//!
//! All source paths (the primary root filesystem and any additional mounts)
//! are sorted before planning. Sorting is what guarantees that a mount at
//! `/a` is established before one at `/a/b`; a later shallow mount would
//! otherwise hide the nested one. Do not replace it with request order.
//!
//! No mount point is ever created through another entry's bind mount: that
//! would write into the source data. Directories are only created in the
//! unbound tree root.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, Result};
use crate::mounts::MountOps;

/// One planned bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    /// Mount point relative to the tree root; empty for the root itself.
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    entries: Vec<MountEntry>,
}

impl MountPlan {
    /// Sort `paths` lexicographically and derive a mount point for each.
    ///
    /// When every later path lies below the first one, the first path is
    /// bound onto the tree root and the others keep their position
    /// relative to it (`/` then `/home` puts `/home` at `home`). Otherwise
    /// nothing is bound onto the root and every path keeps its absolute
    /// layout under it (`/data/a` at `data/a`).
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Result<Self> {
        let mut paths: Vec<PathBuf> = paths.into_iter().collect();
        if paths.is_empty() {
            return Err(MigrateError::InvalidPlan("no source paths".to_string()));
        }
        for path in &paths {
            if !path.is_absolute() {
                return Err(MigrateError::InvalidPlan(format!(
                    "source path is not absolute: {}",
                    path.display()
                )));
            }
        }
        paths.sort_by(|a, b| a.as_os_str().as_bytes().cmp(b.as_os_str().as_bytes()));

        let prefix = if paths[1..].iter().all(|p| p.starts_with(&paths[0])) {
            paths[0].clone()
        } else {
            PathBuf::from("/")
        };
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(paths.len());
        for source in paths {
            let mount_point = source
                .strip_prefix(&prefix)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| source.clone());
            if !seen.insert(mount_point.clone()) {
                return Err(MigrateError::InvalidPlan(format!(
                    "{} collides with another mount at {}",
                    source.display(),
                    if mount_point.as_os_str().is_empty() {
                        "the root".to_string()
                    } else {
                        mount_point.display().to_string()
                    }
                )));
            }
            entries.push(MountEntry {
                source,
                mount_point,
            });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the first source is bound onto the tree root itself.
    pub fn binds_root(&self) -> bool {
        self.entries
            .first()
            .is_some_and(|e| e.mount_point.as_os_str().is_empty())
    }

    /// Index of the closest earlier entry whose mount contains entry `idx`.
    fn enclosing(&self, idx: usize) -> Option<usize> {
        let point = &self.entries[idx].mount_point;
        (0..idx)
            .rev()
            .find(|&i| point.starts_with(&self.entries[i].mount_point))
    }
}

/// An active mount and the paths created to hold it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub target: PathBuf,
    /// Created directories and placeholder files, outermost first.
    pub created: Vec<PathBuf>,
}

/// Bind-mount every plan entry beneath `root`, then make each mount
/// read-only.
///
/// A mount point that falls inside an earlier entry's mount must already
/// exist in that entry's source; it is never created there. Each
/// successful mount is pushed onto `active` as soon as it exists, so a
/// failure part-way leaves an accurate record for the caller's cleanup.
pub fn build(
    root: &Path,
    plan: &MountPlan,
    mounts: &dyn MountOps,
    active: &mut Vec<MountRecord>,
) -> Result<()> {
    let first = active.len();
    for (idx, entry) in plan.entries().iter().enumerate() {
        let target = if entry.mount_point.as_os_str().is_empty() {
            root.to_path_buf()
        } else {
            root.join(&entry.mount_point)
        };
        let created = match plan.enclosing(idx) {
            Some(parent) => {
                check_existing_target(&entry.source, &target, &plan.entries()[parent].source)
                    .map_err(|e| MigrateError::mount(&entry.source, e))?;
                Vec::new()
            }
            None => prepare_target(&entry.source, &target)
                .map_err(|e| MigrateError::mount(&entry.source, e))?,
        };
        if let Err(e) = mounts.bind(&entry.source, &target) {
            // The placeholders belong to no mount yet; drop them here.
            remove_created(&created);
            return Err(MigrateError::mount(&entry.source, e));
        }
        tracing::debug!("mounted {} at {}", entry.source.display(), target.display());
        active.push(MountRecord { target, created });
    }

    for (entry, record) in plan.entries().iter().zip(&active[first..]) {
        mounts
            .remount_readonly(&record.target)
            .map_err(|e| MigrateError::mount(&entry.source, e))?;
    }
    Ok(())
}

/// A mount point inside `parent`'s mount has to be provided by the parent
/// source itself.
fn check_existing_target(source: &Path, target: &Path, parent: &Path) -> io::Result<()> {
    let meta = match fs::metadata(target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mount point does not exist in {}", parent.display()),
            ));
        }
        Err(e) => return Err(e),
    };
    if meta.is_dir() != source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "mount point in {} has the wrong file type",
                parent.display()
            ),
        ));
    }
    Ok(())
}

/// Make sure `target` exists with the right type for `source`, returning
/// whatever had to be created. Only called for targets outside every bind
/// mount.
fn prepare_target(source: &Path, target: &Path) -> io::Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    if target.exists() {
        return Ok(created);
    }

    let mut missing: Vec<&Path> = target
        .ancestors()
        .skip(1)
        .take_while(|p| !p.exists())
        .collect();
    missing.reverse();
    for dir in missing {
        fs::create_dir(dir)?;
        created.push(dir.to_path_buf());
    }

    if source.is_dir() {
        fs::create_dir(target)?;
    } else {
        fs::write(target, b"")?;
    }
    created.push(target.to_path_buf());
    Ok(created)
}

/// Remove created mount points, innermost first. Best-effort.
pub(crate) fn remove_created(created: &[PathBuf]) {
    for path in created.iter().rev() {
        let result = if path.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        if let Err(e) = result {
            tracing::warn!("failed to remove {}: {e}", path.display());
        }
    }
}
