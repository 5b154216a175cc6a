//! Session controller: runs one migration end to end.
//!
//! State machine:
//!
//! ```text
//! Initializing -> SandboxReady -> SourceAssembled -> RemoteResourceCreated
//!     -> Transferring -> Committed
//! ```
//!
//! Any failure ends in `RolledBack`. Once the remote resource exists, a
//! failure deletes it (through the [`Reverter`]) before the error is
//! returned. Local cleanup runs on every exit path: mounts are detached in
//! reverse order and only paths the session created are removed. Nothing
//! is ever removed recursively, since a recursive delete could reach
//! through a live bind mount into the source data.

use std::fmt;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cancel::CancelToken;
use crate::command_run::CommandRunner;
use crate::disk;
use crate::error::{MigrateError, Result};
use crate::mounts::{self, MountOps};
use crate::progress::ProgressObserver;
use crate::remote::{RemoteApi, ResourceId};
use crate::request::MigrationRequest;
use crate::sandbox::Sandbox;
use crate::source::SourceDescriptor;
use crate::transfer::{self, TransferOptions, TransferTarget};
use crate::tree::{self, MountPlan, MountRecord};

/// Tree root for filesystem migrations, inside the temporary root.
pub const ROOTFS_DIR: &str = "rootfs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    SandboxReady,
    SourceAssembled,
    RemoteResourceCreated,
    Transferring,
    Committed,
    RolledBack,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initializing => "initializing",
            SessionState::SandboxReady => "sandbox ready",
            SessionState::SourceAssembled => "source assembled",
            SessionState::RemoteResourceCreated => "remote resource created",
            SessionState::Transferring => "transferring",
            SessionState::Committed => "committed",
            SessionState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// The step a session was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Sandbox,
    Assemble,
    CreateRemote,
    Transfer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Prepare => "checking the source",
            Stage::Sandbox => "entering a private mount namespace",
            Stage::Assemble => "assembling the source",
            Stage::CreateRemote => "creating the remote resource",
            Stage::Transfer => "transferring data",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct SessionFailure {
    pub stage: Stage,
    pub error: MigrateError,
    /// Whether a created remote resource was deleted again.
    pub rolled_back: bool,
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "migration failed while {}: {}", self.stage, self.error)?;
        if self.rolled_back {
            f.write_str(" (remote resource removed)")?;
        }
        Ok(())
    }
}

impl std::error::Error for SessionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

type RevertAction<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Scoped rollback actions.
///
/// Actions run in reverse registration order when the scope is reverted or
/// dropped, unless [`Reverter::commit`] was called first.
#[derive(Default)]
pub struct Reverter<'a> {
    actions: Vec<(String, RevertAction<'a>)>,
}

impl<'a> Reverter<'a> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    pub fn add(&mut self, description: impl Into<String>, action: impl FnOnce() -> Result<()> + 'a) {
        self.actions.push((description.into(), Box::new(action)));
    }

    /// Keep everything; the registered actions will never run.
    pub fn commit(&mut self) {
        self.actions.clear();
    }

    /// Run the registered actions now and return how many ran. Failures
    /// are logged, never propagated.
    pub fn revert(&mut self) -> usize {
        let mut ran = 0;
        while let Some((description, action)) = self.actions.pop() {
            tracing::info!("reverting: {description}");
            if let Err(e) = action() {
                tracing::warn!("failed to {description}: {e}");
            }
            ran += 1;
        }
        ran
    }
}

impl Drop for Reverter<'_> {
    fn drop(&mut self) {
        self.revert();
    }
}

/// Capabilities a session drives.
pub struct SessionDeps<'a> {
    pub sandbox: &'a dyn Sandbox,
    pub mounts: &'a dyn MountOps,
    pub runner: &'a dyn CommandRunner,
    pub remote: &'a dyn RemoteApi,
    pub observer: &'a dyn ProgressObserver,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Parent directory of the temporary root.
    pub tmpdir: PathBuf,
    pub transfer: TransferOptions,
    /// Architecture sent with instance creation.
    pub architecture: String,
}

pub struct Session<'a> {
    deps: SessionDeps<'a>,
    options: SessionOptions,
    state: SessionState,
    temp_root: Option<PathBuf>,
    rootfs: Option<PathBuf>,
    active: Vec<MountRecord>,
    scratch: Vec<PathBuf>,
}

fn at(stage: Stage) -> impl FnOnce(MigrateError) -> (Stage, MigrateError) {
    move |error| (stage, error)
}

impl<'a> Session<'a> {
    pub fn new(deps: SessionDeps<'a>, options: SessionOptions) -> Self {
        Self {
            deps,
            options,
            state: SessionState::Initializing,
            temp_root: None,
            rootfs: None,
            active: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the migration. Local cleanup has finished by the time this
    /// returns, whatever the outcome.
    pub fn run(
        mut self,
        request: &MigrationRequest,
        source: &SourceDescriptor,
    ) -> std::result::Result<ResourceId, SessionFailure> {
        let mut reverter = Reverter::new();
        let result = self.execute(request, source, &mut reverter);
        let outcome = match result {
            Ok(id) => {
                reverter.commit();
                self.transition(SessionState::Committed);
                Ok(id)
            }
            Err((stage, error)) => {
                if error.is_cancelled() {
                    tracing::warn!("migration cancelled while {stage}");
                }
                let rolled_back = reverter.revert() > 0;
                self.transition(SessionState::RolledBack);
                Err(SessionFailure {
                    stage,
                    error,
                    rolled_back,
                })
            }
        };
        self.cleanup();
        outcome
    }

    fn transition(&mut self, state: SessionState) {
        tracing::debug!("session: {} -> {state}", self.state);
        self.state = state;
    }

    fn execute(
        &mut self,
        request: &MigrationRequest,
        source: &SourceDescriptor,
        reverter: &mut Reverter<'a>,
    ) -> std::result::Result<ResourceId, (Stage, MigrateError)> {
        let cancel = self.deps.cancel.clone();
        source.check_target(request.kind).map_err(at(Stage::Prepare))?;
        cancel.check().map_err(at(Stage::Prepare))?;

        self.deps.sandbox.enter().map_err(at(Stage::Sandbox))?;
        self.transition(SessionState::SandboxReady);

        let target = self.assemble(request, source).map_err(at(Stage::Assemble))?;
        self.transition(SessionState::SourceAssembled);

        cancel.check().map_err(at(Stage::CreateRemote))?;
        let spec = request.create_spec(&self.options.architecture);
        tracing::info!("creating {} on the remote host", spec.resource_id());
        let (id, mut operation) = self
            .deps
            .remote
            .create(&spec)
            .map_err(at(Stage::CreateRemote))?;
        let remote = self.deps.remote;
        let created = id.clone();
        reverter.add(format!("delete {created}"), move || remote.delete(&created));
        self.transition(SessionState::RemoteResourceCreated);

        self.transition(SessionState::Transferring);
        transfer::run(
            &target,
            operation.as_mut(),
            self.deps.runner,
            self.deps.observer,
            &cancel,
            &self.options.transfer,
        )
        .map_err(at(Stage::Transfer))?;
        Ok(id)
    }

    fn assemble(
        &mut self,
        request: &MigrationRequest,
        source: &SourceDescriptor,
    ) -> Result<TransferTarget> {
        let temp_root = create_temp_root(&self.options.tmpdir)?;
        self.temp_root = Some(temp_root.clone());

        if request.kind.is_filesystem() {
            let rootfs = temp_root.join(ROOTFS_DIR);
            fs::create_dir(&rootfs).map_err(|e| {
                MigrateError::io(format!("failed to create {}", rootfs.display()), e)
            })?;
            self.rootfs = Some(rootfs.clone());

            let plan = MountPlan::new(request.source_paths())?;
            tracing::info!("mounting {} source path(s)", plan.len());
            tree::build(&rootfs, &plan, self.deps.mounts, &mut self.active)?;
            Ok(TransferTarget::Tree(rootfs))
        } else {
            let image = disk::normalize(source, &temp_root, self.deps.runner, &mut self.scratch)?;
            let mounted = disk::mount_image(&image, &temp_root, self.deps.mounts, &mut self.active)?;
            Ok(TransferTarget::Image(mounted))
        }
    }

    /// Undo every local side effect. Safe to call more than once.
    pub fn cleanup(&mut self) {
        while let Some(record) = self.active.pop() {
            match self.deps.mounts.unmount(&record.target) {
                Ok(()) => tracing::debug!("unmounted {}", record.target.display()),
                Err(e) if mounts::is_not_mounted(&e) => {
                    tracing::debug!("{} was not mounted", record.target.display());
                }
                Err(e) => {
                    // Still mounted: leave its mount point alone.
                    tracing::warn!("failed to unmount {}: {e}", record.target.display());
                    continue;
                }
            }
            tree::remove_created(&record.created);
        }

        for path in self.scratch.drain(..).rev() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("failed to remove {}: {e}", path.display()),
            }
        }

        for dir in [self.rootfs.take(), self.temp_root.take()].into_iter().flatten() {
            if let Err(e) = fs::remove_dir(&dir) {
                tracing::warn!("failed to remove {}: {e}", dir.display());
            }
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Create a fresh `vmigrate_mount_<pid>_<nanos>` directory under `parent`.
/// An existing directory is never reused.
fn create_temp_root(parent: &Path) -> Result<PathBuf> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let path = parent.join(format!("vmigrate_mount_{}_{nanos}", std::process::id()));
    DirBuilder::new()
        .mode(0o700)
        .create(&path)
        .map_err(|e| MigrateError::io(format!("failed to create {}", path.display()), e))?;
    tracing::debug!("created temporary root {}", path.display());
    Ok(path)
}
