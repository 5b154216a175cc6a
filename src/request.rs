//! The migration request: what to create on the remote host and from which
//! local source.
//!
//! A request is read from a TOML file, validated once, and then handed to
//! the session controller. The pipeline never re-validates user choices,
//! only filesystem and OS preconditions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::remote::{CreateSpec, InstanceSpec, MigrationSource, VolumeSpec};
use crate::validate_name;

/// What the migration creates on the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// System container built from a root filesystem tree
    Container,
    /// Virtual machine built from a disk or image
    Vm,
    /// Custom storage volume filled from a directory
    VolumeFilesystem,
    /// Custom storage volume filled from a disk or image
    VolumeBlock,
}

impl TargetKind {
    /// Whether the source is a directory tree (as opposed to a disk).
    pub fn is_filesystem(self) -> bool {
        matches!(self, TargetKind::Container | TargetKind::VolumeFilesystem)
    }

    pub fn is_instance(self) -> bool {
        matches!(self, TargetKind::Container | TargetKind::Vm)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetKind::Container => "container",
            TargetKind::Vm => "virtual machine",
            TargetKind::VolumeFilesystem => "custom volume (filesystem)",
            TargetKind::VolumeBlock => "custom volume (block)",
        })
    }
}

fn default_project() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationRequest {
    pub kind: TargetKind,

    /// Primary source: a root filesystem, disk, partition, or image file.
    pub source: PathBuf,

    /// Additional filesystem mounts (containers only).
    #[serde(default)]
    pub mounts: Vec<PathBuf>,

    pub name: String,

    #[serde(default = "default_project")]
    pub project: String,

    /// Storage pool. Optional for instances, required for volumes.
    #[serde(default)]
    pub pool: Option<String>,

    /// Root disk size for instances (e.g. "20GiB").
    #[serde(default)]
    pub size: Option<String>,

    /// Parent network for a bridged eth0 (instances only).
    #[serde(default)]
    pub network: Option<String>,

    /// Profiles to apply; unset means the server default.
    #[serde(default)]
    pub profiles: Option<Vec<String>>,

    #[serde(default = "default_true")]
    pub uefi: bool,

    #[serde(default = "default_true")]
    pub secure_boot: bool,

    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl MigrationRequest {
    /// Parse a request without validating it.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse migration request")
    }

    /// Read and validate a request file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let request = Self::parse(&content).with_context(|| format!("in {}", path.display()))?;
        request.validate()?;
        Ok(request)
    }

    /// Check the request's internal consistency and that every source path
    /// exists.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_instance() {
            validate_name(&self.name)?;
        } else if self.name.is_empty() || self.name.contains('/') {
            bail!("invalid volume name: {:?}", self.name);
        }
        if self.project.is_empty() {
            bail!("project cannot be empty");
        }
        if self.kind != TargetKind::Container && !self.mounts.is_empty() {
            bail!("additional mounts are only supported when migrating to a container");
        }
        if !self.kind.is_instance() {
            if self.pool.is_none() {
                bail!("a storage pool is required when creating a custom volume");
            }
            if self.network.is_some() || self.size.is_some() || self.profiles.is_some() {
                bail!("network, size and profiles only apply to instances");
            }
        }
        if self.size.is_some() && self.pool.is_none() {
            bail!("size requires a storage pool");
        }
        for entry in self.config.keys() {
            if entry.is_empty() {
                bail!("config keys cannot be empty");
            }
        }
        for path in self.source_paths() {
            if !path.is_absolute() {
                bail!("source paths must be absolute: {}", path.display());
            }
            if !path.exists() {
                bail!("path does not exist: {}", path.display());
            }
        }
        Ok(())
    }

    /// The primary source followed by the additional mounts, in request
    /// order. Sorting for the mount plan happens in [`crate::tree::MountPlan`].
    pub fn source_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(self.mounts.len() + 1);
        paths.push(self.source.clone());
        paths.extend(self.mounts.iter().cloned());
        paths
    }

    /// Build the remote creation parameters.
    pub fn create_spec(&self, architecture: &str) -> CreateSpec {
        let source = MigrationSource::push();
        match self.kind {
            TargetKind::Container | TargetKind::Vm => {
                let mut config = self.config.clone();
                if self.kind == TargetKind::Vm && matches!(architecture, "x86_64" | "aarch64") {
                    if !self.uefi {
                        config.insert("security.csm".into(), "true".into());
                        config.insert("security.secureboot".into(), "false".into());
                    } else if !self.secure_boot {
                        config.insert("security.secureboot".into(), "false".into());
                    }
                }

                let mut devices = BTreeMap::new();
                if let Some(pool) = &self.pool {
                    let mut root = BTreeMap::from([
                        ("type".to_string(), "disk".to_string()),
                        ("pool".to_string(), pool.clone()),
                        ("path".to_string(), "/".to_string()),
                    ]);
                    if let Some(size) = &self.size {
                        root.insert("size".into(), size.clone());
                    }
                    devices.insert("root".to_string(), root);
                }
                if let Some(network) = &self.network {
                    devices.insert(
                        "eth0".to_string(),
                        BTreeMap::from([
                            ("type".to_string(), "nic".to_string()),
                            ("nictype".to_string(), "bridged".to_string()),
                            ("parent".to_string(), network.clone()),
                            ("name".to_string(), "eth0".to_string()),
                        ]),
                    );
                }

                CreateSpec::Instance {
                    project: self.project.clone(),
                    spec: InstanceSpec {
                        name: self.name.clone(),
                        instance_type: if self.kind == TargetKind::Vm {
                            "virtual-machine".into()
                        } else {
                            "container".into()
                        },
                        architecture: architecture.to_string(),
                        profiles: self.profiles.clone(),
                        config,
                        devices,
                        source,
                    },
                }
            }
            TargetKind::VolumeFilesystem | TargetKind::VolumeBlock => CreateSpec::Volume {
                project: self.project.clone(),
                pool: self.pool.clone().unwrap_or_default(),
                spec: VolumeSpec {
                    name: self.name.clone(),
                    volume_type: "custom".into(),
                    content_type: if self.kind == TargetKind::VolumeFilesystem {
                        "filesystem".into()
                    } else {
                        "block".into()
                    },
                    source,
                },
            },
        }
    }

    /// Render the summary printed before a migration starts.
    pub fn summary(&self, source_format: Option<&str>) -> Result<String> {
        #[derive(Serialize)]
        struct Summary<'a> {
            name: &'a str,
            project: &'a str,
            #[serde(rename = "type")]
            kind: String,
            source: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            source_format: Option<&'a str>,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            mounts: Vec<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            profiles: Option<&'a [String]>,
            #[serde(skip_serializing_if = "Option::is_none")]
            storage_pool: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            storage_size: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            network: Option<&'a str>,
            #[serde(skip_serializing_if = "is_empty_map")]
            config: &'a BTreeMap<String, String>,
        }

        fn is_empty_map(map: &&BTreeMap<String, String>) -> bool {
            map.is_empty()
        }

        let summary = Summary {
            name: &self.name,
            project: &self.project,
            kind: self.kind.to_string(),
            source: self.source.display().to_string(),
            source_format,
            mounts: self.mounts.iter().map(|m| m.display().to_string()).collect(),
            profiles: self.profiles.as_deref(),
            storage_pool: self.pool.as_deref(),
            storage_size: self.size.as_deref(),
            network: self.network.as_deref(),
            config: &self.config,
        };
        toml::to_string(&summary).context("failed to render the migration summary")
    }
}

/// The host architecture in the remote host's naming scheme.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86" => "i686",
        "arm" => "armv7l",
        "powerpc64" => "ppc64le",
        other => other,
    }
}
