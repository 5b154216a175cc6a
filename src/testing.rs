//! Fakes for the injected capabilities, used by unit tests across the
//! crate. Nothing here touches mounts, namespaces or the network.

use std::collections::{HashSet, VecDeque};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cancel::CancelToken;
use crate::command_run::{CommandRunner, RunningTool, ToolExit};
use crate::error::{MigrateError, Result};
use crate::mounts::MountOps;
use crate::progress::ProgressObserver;
use crate::remote::{CreateSpec, Operation, OperationStatus, RemoteApi, ResourceId};
use crate::sandbox::{HostSandbox, Sandbox};

/// Serializes tests that modify process environment variables.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

/// Scratch directory under the system temp dir, removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(suffix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "vmigrate-test-{}-{}-{suffix}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Run `f` on a fresh thread inside its own private mount namespace, the
/// way a session runs. Skipped (returns false) without root, or when the
/// kernel refuses the namespace.
pub fn with_private_namespace<F>(f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    if !crate::is_privileged() {
        eprintln!("skipping: requires root");
        return false;
    }
    let handle = std::thread::spawn(move || {
        if let Err(e) = HostSandbox.enter() {
            eprintln!("skipping: {e}");
            return false;
        }
        f();
        true
    });
    match handle.join() {
        Ok(ran) => ran,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Mount points at or below `dir` in the calling thread's namespace.
pub fn mount_points_under(dir: &Path) -> Vec<PathBuf> {
    fs::read_to_string("/proc/thread-self/mountinfo")
        .unwrap()
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(field.replace("\\040", " ")))
        .filter(|p| p.starts_with(dir))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Bind(PathBuf, PathBuf),
    RemountReadonly(PathBuf),
    Unmount(PathBuf),
}

/// Records mount calls and tracks which targets are currently mounted.
#[derive(Default)]
pub struct RecordingMounts {
    calls: Mutex<Vec<MountCall>>,
    mounted: Mutex<Vec<PathBuf>>,
    fail_bind: Option<PathBuf>,
    fail_unmount: Option<PathBuf>,
}

impl RecordingMounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make binding `source` fail with EPERM.
    pub fn fail_bind_of(mut self, source: PathBuf) -> Self {
        self.fail_bind = Some(source);
        self
    }

    /// Make unmounting `target` fail with EBUSY.
    pub fn fail_unmount_of(mut self, target: PathBuf) -> Self {
        self.fail_unmount = Some(target);
        self
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mounted_count(&self) -> usize {
        self.mounted.lock().unwrap().len()
    }
}

impl MountOps for RecordingMounts {
    fn bind(&self, source: &Path, target: &Path) -> io::Result<()> {
        if self.fail_bind.as_deref() == Some(source) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        self.calls
            .lock()
            .unwrap()
            .push(MountCall::Bind(source.to_path_buf(), target.to_path_buf()));
        self.mounted.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }

    fn remount_readonly(&self, target: &Path) -> io::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(MountCall::RemountReadonly(target.to_path_buf()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        if self.fail_unmount.as_deref() == Some(target) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.calls
            .lock()
            .unwrap()
            .push(MountCall::Unmount(target.to_path_buf()));
        let mut mounted = self.mounted.lock().unwrap();
        match mounted.iter().rposition(|p| p == target) {
            Some(idx) => {
                mounted.remove(idx);
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }
}

/// Counts namespace entries; optionally refuses like an unprivileged
/// caller would.
#[derive(Default)]
pub struct FakeSandbox {
    entered: AtomicUsize,
    refuse: bool,
}

impl FakeSandbox {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

impl Sandbox for FakeSandbox {
    fn enter(&self) -> Result<()> {
        if self.refuse {
            return Err(MigrateError::Privilege(
                "failed to unshare mount namespace: Operation not permitted".into(),
            ));
        }
        self.entered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records invocations instead of executing anything.
///
/// `run` returns the configured exit. Spawned tools report "still running"
/// for the configured number of polls, then exit with the tool exit.
pub struct FakeRunner {
    missing: HashSet<String>,
    run_exit: ToolExit,
    tool_exit: ToolExit,
    tool_polls: usize,
    cancel_on_exit: Option<CancelToken>,
    runs: Mutex<Vec<(String, Vec<OsString>)>>,
    spawns: Mutex<Vec<(String, Vec<OsString>)>>,
    killed: Arc<AtomicBool>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            missing: HashSet::new(),
            run_exit: ToolExit::success(),
            tool_exit: ToolExit::success(),
            tool_polls: 0,
            cancel_on_exit: None,
            runs: Mutex::new(Vec::new()),
            spawns: Mutex::new(Vec::new()),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn without_program(mut self, program: &str) -> Self {
        self.missing.insert(program.to_string());
        self
    }

    pub fn with_exit(mut self, exit: ToolExit) -> Self {
        self.run_exit = exit;
        self
    }

    pub fn with_tool_exit(mut self, exit: ToolExit) -> Self {
        self.tool_exit = exit;
        self
    }

    pub fn with_tool_polls(mut self, polls: usize) -> Self {
        self.tool_polls = polls;
        self
    }

    /// Cancel `token` as the spawned tool exits, as a terminal interrupt
    /// would.
    pub fn cancel_on_tool_exit(mut self, token: CancelToken) -> Self {
        self.cancel_on_exit = Some(token);
        self
    }

    pub fn runs(&self) -> Vec<(String, Vec<OsString>)> {
        self.runs.lock().unwrap().clone()
    }

    pub fn spawns(&self) -> Vec<(String, Vec<OsString>)> {
        self.spawns.lock().unwrap().clone()
    }

    pub fn tool_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl CommandRunner for FakeRunner {
    fn lookup(&self, program: &str) -> Option<PathBuf> {
        if self.missing.contains(program) {
            return None;
        }
        Some(Path::new("/usr/bin").join(program))
    }

    fn run(&self, program: &str, args: &[OsString]) -> io::Result<ToolExit> {
        self.runs
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        Ok(self.run_exit.clone())
    }

    fn spawn(&self, program: &str, args: &[OsString]) -> io::Result<Box<dyn RunningTool>> {
        self.spawns
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        Ok(Box::new(FakeTool {
            polls_left: self.tool_polls,
            exit: self.tool_exit.clone(),
            cancel_on_exit: self.cancel_on_exit.clone(),
            killed: Arc::clone(&self.killed),
        }))
    }
}

struct FakeTool {
    polls_left: usize,
    exit: ToolExit,
    cancel_on_exit: Option<CancelToken>,
    killed: Arc<AtomicBool>,
}

impl RunningTool for FakeTool {
    fn try_finish(&mut self) -> io::Result<Option<ToolExit>> {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return Ok(None);
        }
        if let Some(token) = self.cancel_on_exit.take() {
            token.cancel();
        }
        Ok(Some(self.exit.clone()))
    }

    fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

/// Replays scripted statuses; the last one repeats once the script runs
/// out.
pub struct FakeOperation {
    script: VecDeque<OperationStatus>,
    last: OperationStatus,
    polls: usize,
    cancel_on_poll: Option<CancelToken>,
}

impl FakeOperation {
    pub fn new(script: Vec<OperationStatus>) -> Self {
        Self {
            script: script.into(),
            last: OperationStatus::Running { progress: None },
            polls: 0,
            cancel_on_poll: None,
        }
    }

    /// Cancel `token` on the first poll, as an interrupt mid-transfer would.
    pub fn cancel_on_poll(mut self, token: CancelToken) -> Self {
        self.cancel_on_poll = Some(token);
        self
    }

    pub fn polls(&self) -> usize {
        self.polls
    }
}

impl Operation for FakeOperation {
    fn id(&self) -> &str {
        "fake-op"
    }

    fn data_endpoint(&self) -> &str {
        "wss://remote.test:8443/1.0/operations/fake-op/websocket?secret=fs"
    }

    fn poll(&mut self) -> Result<OperationStatus> {
        self.polls += 1;
        if let Some(token) = self.cancel_on_poll.take() {
            token.cancel();
        }
        if let Some(status) = self.script.pop_front() {
            self.last = status;
        }
        Ok(self.last.clone())
    }
}

/// Remote host double that hands out [`FakeOperation`]s.
pub struct FakeRemote {
    script: Vec<OperationStatus>,
    create_error: Option<String>,
    cancel_on_poll: Option<CancelToken>,
    created: Mutex<Vec<CreateSpec>>,
    deleted: Mutex<Vec<ResourceId>>,
}

impl FakeRemote {
    pub fn new(script: Vec<OperationStatus>) -> Self {
        Self {
            script,
            create_error: None,
            cancel_on_poll: None,
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Operations that succeed on the first poll.
    pub fn succeeding() -> Self {
        Self::new(vec![OperationStatus::Succeeded])
    }

    pub fn failing_create(mut self, message: &str) -> Self {
        self.create_error = Some(message.to_string());
        self
    }

    pub fn cancel_on_poll(mut self, token: CancelToken) -> Self {
        self.cancel_on_poll = Some(token);
        self
    }

    pub fn created(&self) -> Vec<CreateSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<ResourceId> {
        self.deleted.lock().unwrap().clone()
    }
}

impl RemoteApi for FakeRemote {
    fn create(&self, spec: &CreateSpec) -> Result<(ResourceId, Box<dyn Operation>)> {
        if let Some(message) = &self.create_error {
            return Err(MigrateError::RemoteOperation(message.clone()));
        }
        self.created.lock().unwrap().push(spec.clone());
        let mut op = FakeOperation::new(self.script.clone());
        if let Some(token) = &self.cancel_on_poll {
            op = op.cancel_on_poll(token.clone());
        }
        Ok((spec.resource_id(), Box::new(op)))
    }

    fn delete(&self, id: &ResourceId) -> Result<()> {
        self.deleted.lock().unwrap().push(id.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    updates: Mutex<Vec<String>>,
    finished: AtomicBool,
}

impl RecordingObserver {
    pub fn updates(&self) -> Vec<String> {
        self.updates.lock().unwrap().clone()
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl ProgressObserver for RecordingObserver {
    fn update(&self, message: &str) {
        self.updates.lock().unwrap().push(message.to_string());
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}
