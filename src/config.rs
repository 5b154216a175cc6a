//! Internal API for managing vmigrate configuration.
//!
//! Handles loading, saving, and resolving the configuration file
//! (default: `~/.config/vmigrate/vmigraterc`, TOML format). Provides the
//! [`Config`] struct and functions for reading/writing it to disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::transfer::{self, TransferOptions};

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the remote host's REST API.
    #[serde(default = "default_remote_url")]
    pub remote_url: String,

    #[serde(default = "default_transfer_tool")]
    pub transfer_tool: String,

    /// Extra transfer tool arguments, split with shell quoting rules.
    #[serde(default)]
    pub rsync_args: String,

    /// Where the session's temporary root is created.
    #[serde(default = "default_tmpdir")]
    pub tmpdir: PathBuf,

    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_remote_url() -> String {
    "https://127.0.0.1:8443".to_string()
}

fn default_transfer_tool() -> String {
    "rsync".to_string()
}

fn default_tmpdir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_url: default_remote_url(),
            transfer_tool: default_transfer_tool(),
            rsync_args: String::new(),
            tmpdir: default_tmpdir(),
            cancel_grace_secs: default_cancel_grace_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Config {
    pub fn display(&self) {
        println!("remote_url = {}", self.remote_url);
        println!("transfer_tool = {}", self.transfer_tool);
        println!("rsync_args = {}", self.rsync_args);
        println!("tmpdir = {}", self.tmpdir.display());
        println!("cancel_grace_secs = {}", self.cancel_grace_secs);
        println!("poll_interval_ms = {}", self.poll_interval_ms);
    }

    /// Validate and apply one `config set` assignment.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "remote_url" => {
                if !value.starts_with("https://") && !value.starts_with("http://") {
                    bail!("remote_url must be an http:// or https:// URL: {value}");
                }
                self.remote_url = value.trim_end_matches('/').to_string();
            }
            "transfer_tool" => {
                if value.is_empty() {
                    bail!("transfer_tool cannot be empty");
                }
                self.transfer_tool = value.to_string();
            }
            "rsync_args" => {
                if transfer::split_extra_args(value).is_none() {
                    bail!("rsync_args has unbalanced quotes: {value}");
                }
                self.rsync_args = value.to_string();
            }
            "tmpdir" => {
                let path = PathBuf::from(value);
                if !path.is_absolute() {
                    bail!("tmpdir must be an absolute path: {value}");
                }
                self.tmpdir = path;
            }
            "cancel_grace_secs" => {
                self.cancel_grace_secs = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("cancel_grace_secs must be a non-negative integer (seconds)"))?;
            }
            "poll_interval_ms" => {
                let ms: u64 = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("poll_interval_ms must be a positive integer (milliseconds)"))?;
                if ms == 0 {
                    bail!("poll_interval_ms must be greater than 0");
                }
                self.poll_interval_ms = ms;
            }
            _ => bail!("unknown config key: {key}"),
        }
        Ok(())
    }

    /// Transfer settings, with `override_args` (from the command line)
    /// replacing the configured extra arguments.
    pub fn transfer_options(&self, override_args: Option<&str>) -> Result<TransferOptions> {
        let raw = override_args.unwrap_or(&self.rsync_args);
        let extra_args = transfer::split_extra_args(raw)
            .with_context(|| format!("invalid transfer tool arguments: {raw}"))?;
        Ok(TransferOptions {
            tool: self.transfer_tool.clone(),
            extra_args,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        })
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

fn sudo_user_config_path() -> Option<PathBuf> {
    let su = crate::sudo_user()?;
    Some(su.home.join(".config").join("vmigrate").join("vmigraterc"))
}

pub fn config_path() -> Result<PathBuf> {
    // When running under sudo, prefer the invoking user's config if it exists.
    if let Some(path) = sudo_user_config_path() {
        if path.exists() {
            return Ok(path);
        }
    }
    let base = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else {
        let home = std::env::var("HOME").context("HOME not set")?;
        PathBuf::from(home).join(".config")
    };
    Ok(base.join("vmigrate").join("vmigraterc"))
}

pub fn resolve_path(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(p) => Ok(p.to_path_buf()),
        None => config_path(),
    }
}

pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = resolve_path(path)?;
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

pub fn save(config: &Config, path: Option<&Path>) -> Result<()> {
    let path = resolve_path(path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let contents = toml::to_string(config).context("failed to serialize config")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::testing::ENV_LOCK;

    struct TempConfig {
        dir: PathBuf,
        _guard: std::sync::MutexGuard<'static, ()>,
    }

    impl TempConfig {
        fn new() -> Self {
            let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            let dir = std::env::temp_dir().join(format!(
                "vmigrate-test-{}-{:?}",
                std::process::id(),
                std::thread::current().id()
            ));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();
            std::env::set_var("XDG_CONFIG_HOME", &dir);
            std::env::remove_var("SUDO_USER");
            Self {
                dir,
                _guard: guard,
            }
        }
    }

    impl Drop for TempConfig {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
            std::env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.remote_url, "https://127.0.0.1:8443");
        assert_eq!(config.transfer_tool, "rsync");
        assert_eq!(config.tmpdir, PathBuf::from("/tmp"));
        assert_eq!(config.cancel_grace_secs, 10);
    }

    #[test]
    fn test_load_missing_file() {
        let _tmp = TempConfig::new();
        let config = load(None).unwrap();
        assert_eq!(config.poll_interval_ms, 500);
    }

    #[test]
    fn test_save_and_load() {
        let _tmp = TempConfig::new();
        let mut config = Config::default();
        config.set("remote_url", "https://lxd.example:8443/").unwrap();
        config.set("transfer_tool", "/usr/local/bin/rsync").unwrap();
        save(&config, None).unwrap();
        let loaded = load(None).unwrap();
        assert_eq!(loaded.remote_url, "https://lxd.example:8443");
        assert_eq!(loaded.transfer_tool, "/usr/local/bin/rsync");
    }

    #[test]
    fn test_load_partial_config() {
        let _tmp = TempConfig::new();
        let path = config_path().unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        // Missing keys get defaults.
        fs::write(&path, "tmpdir = \"/var/tmp\"\n").unwrap();
        let config = load(None).unwrap();
        assert_eq!(config.tmpdir, PathBuf::from("/var/tmp"));
        assert_eq!(config.transfer_tool, "rsync");
    }

    #[test]
    fn test_explicit_path() {
        let dir = std::env::temp_dir().join(format!("vmigrate-test-explicit-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("custom-vmigraterc");

        // Load from non-existent explicit path returns default.
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.cancel_grace_secs, 10);

        let config = Config {
            cancel_grace_secs: 3,
            ..Config::default()
        };
        save(&config, Some(&path)).unwrap();
        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.cancel_grace_secs, 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("remote_url", "lxd.example").is_err());
        assert!(config.set("tmpdir", "relative/dir").is_err());
        assert!(config.set("poll_interval_ms", "0").is_err());
        assert!(config.set("cancel_grace_secs", "-1").is_err());
        assert!(config.set("rsync_args", "--exclude 'open").is_err());
        let err = config.set("datadir", "/var/lib").unwrap_err();
        assert!(err.to_string().contains("unknown config key"));
    }

    #[test]
    fn test_no_client_identity_is_stored() {
        // The tool never holds on to a host credential it could revoke.
        let mut config = Config::default();
        let err = config.set("client_fingerprint", "abc123").unwrap_err();
        assert!(err.to_string().contains("unknown config key"), "unexpected error: {err}");

        let _tmp = TempConfig::new();
        let path = config_path().unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "client_fingerprint = \"abc123\"\ntmpdir = \"/var/tmp\"\n").unwrap();
        let config = load(None).unwrap();
        assert_eq!(config.tmpdir, PathBuf::from("/var/tmp"));
        save(&config, None).unwrap();
        assert!(!fs::read_to_string(&path).unwrap().contains("client_fingerprint"));
    }

    #[test]
    fn test_transfer_options() {
        let mut config = Config::default();
        config.set("rsync_args", "--bwlimit=10m").unwrap();
        config.set("poll_interval_ms", "250").unwrap();

        let opts = config.transfer_options(None).unwrap();
        assert_eq!(opts.tool, "rsync");
        assert_eq!(opts.extra_args, ["--bwlimit=10m"]);
        assert_eq!(opts.poll_interval, Duration::from_millis(250));

        let opts = config.transfer_options(Some("--exclude 'a b' -v")).unwrap();
        assert_eq!(opts.extra_args, ["--exclude", "a b", "-v"]);
        assert!(config.transfer_options(Some("'open")).is_err());
    }

    #[test]
    fn test_config_path_xdg() {
        let _tmp = TempConfig::new();
        let path = config_path().unwrap();
        assert!(path.ends_with("vmigrate/vmigraterc"));
    }

    #[test]
    fn test_sudo_user_config_path_unset() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::remove_var("SUDO_USER");
        assert!(sudo_user_config_path().is_none());
    }
}
