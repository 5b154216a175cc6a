use std::path::PathBuf;

use anyhow::{bail, Result};

/// Check that the tool runs with root privileges. Namespace and mount
/// operations need them, so this is a startup failure, not a pipeline one.
pub fn check_privileged() -> Result<()> {
    if !crate::is_privileged() {
        bail!("vmigrate must be run as root; run with sudo");
    }
    Ok(())
}

/// Find a program in PATH, returning its full path.
pub fn find_program(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
        bail!("{name} not found");
    }
    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':') {
        let candidate = PathBuf::from(dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!("{name} not found in PATH")
}

/// Check that all required external programs are available.
///
/// `programs` is a slice of `(binary_name, package_hint)` pairs.
pub fn check_dependencies(programs: &[(&str, &str)]) -> Result<()> {
    for (name, hint) in programs {
        match find_program(name) {
            Ok(path) => tracing::debug!("found {name}: {}", path.display()),
            Err(_) => bail!("unable to find required command {name:?}; install it with: {hint}"),
        }
    }
    Ok(())
}
