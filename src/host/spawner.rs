//! Worker spawning - the "spawn worker, obtain a handle" primitive.
//!
//! A spawner turns an entry reference into a running worker and reports its
//! lifecycle as [`WorkerEvent`]s: `Spawned` once the worker is up, then
//! exactly one `Exited(code)`. An exit before `Spawned` is a startup failure.
//!
//! Two spawners ship with the crate:
//! - [`LocalSpawner`] runs registered worker functions on tokio tasks
//! - [`ProcessSpawner`] runs an executable and links it over stdio

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::ipc::{BridgeRole, LinkBridge};
use crate::port::{parent_link, ChildHandle};
use crate::types::{Error, HandlerError, Result, SpawnOptions, TransportConfig};
use crate::worker::WorkerDispatcher;

/// Environment flag set on every worker process.
pub const ENV_IN_CHILD_PROCESS: &str = "UPM_IN_CHILD_PROCESS";
/// Environment variable carrying the worker's service name.
pub const ENV_SERVICE_NAME: &str = "UPM_SERVICE_NAME";

/// Exit code reported for a worker stopped through [`WorkerControl::kill`].
pub const KILLED_EXIT_CODE: i32 = 137;
/// Exit code reported for a local worker whose startup step failed.
pub const STARTUP_FAILURE_EXIT_CODE: i32 = 1;

/// Lifecycle notifications from a spawned worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker is up.
    Spawned,
    /// The worker is gone, with this exit code.
    Exited(i32),
}

/// Termination handle for a spawned worker.
pub trait WorkerControl: Send + Sync + fmt::Debug {
    /// Request termination. The exit is reported as a [`WorkerEvent`].
    fn kill(&self) -> Result<()>;

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// A running worker as handed to the host.
#[derive(Debug)]
pub struct SpawnedWorker {
    /// Host side of the worker's primary link.
    pub port: ChildHandle,
    pub control: Box<dyn WorkerControl>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Starts workers from entry references.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, entry: &str, options: &SpawnOptions) -> Result<SpawnedWorker>;
}

/// Reports one exit, whichever path gets there first.
#[derive(Debug, Clone)]
struct ExitReporter {
    events: mpsc::UnboundedSender<WorkerEvent>,
    exited: Arc<AtomicBool>,
}

impl ExitReporter {
    fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            events,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawned(&self) {
        let _ = self.events.send(WorkerEvent::Spawned);
    }

    /// Returns false if an exit was already reported.
    fn exited(&self, code: i32) -> bool {
        if self.exited.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.events.send(WorkerEvent::Exited(code));
        true
    }
}

// =============================================================================
// Local spawner
// =============================================================================

/// Synchronous startup step of a local worker: registers its handlers.
pub type LocalEntry =
    Arc<dyn Fn(&WorkerDispatcher, &SpawnOptions) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// Runs registered worker entries in-process, one tokio task per worker.
#[derive(Clone, Default)]
pub struct LocalSpawner {
    entries: Arc<RwLock<HashMap<String, LocalEntry>>>,
}

impl fmt::Debug for LocalSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("LocalSpawner")
            .field("entries", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LocalSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `setup` as the worker behind `entry`.
    pub fn register<F>(&self, entry: impl Into<String>, setup: F) -> &Self
    where
        F: Fn(&WorkerDispatcher, &SpawnOptions) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(entry.into(), Arc::new(setup));
        self
    }

    fn entry(&self, entry: &str) -> Option<LocalEntry> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(entry)
            .cloned()
    }
}

#[derive(Debug)]
struct LocalControl {
    task: AbortHandle,
    reporter: ExitReporter,
}

impl WorkerControl for LocalControl {
    fn kill(&self) -> Result<()> {
        if self.reporter.exited(KILLED_EXIT_CODE) {
            self.task.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerSpawner for LocalSpawner {
    async fn spawn(&self, entry: &str, options: &SpawnOptions) -> Result<SpawnedWorker> {
        let setup = self
            .entry(entry)
            .ok_or_else(|| Error::spawn(format!("no local worker registered for entry {}", entry)))?;

        let (child, parent) = parent_link();
        let (events_tx, events) = mpsc::unbounded_channel();
        let reporter = ExitReporter::new(events_tx);
        let options = options.clone();
        let name = options.service_name.clone().unwrap_or_else(|| entry.to_string());

        let task_reporter = reporter.clone();
        let task = tokio::spawn(async move {
            let dispatcher = WorkerDispatcher::new();
            if let Err(err) = setup(&dispatcher, &options) {
                tracing::error!(service = %name, error = %err, "local worker failed to start");
                task_reporter.exited(STARTUP_FAILURE_EXIT_CODE);
                return;
            }
            task_reporter.spawned();

            let code = match dispatcher.serve(parent).await {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(service = %name, error = %err, "local worker failed");
                    1
                }
            };
            task_reporter.exited(code);
        });

        tracing::debug!(entry, "spawned local worker");
        Ok(SpawnedWorker {
            port: child,
            control: Box::new(LocalControl {
                task: task.abort_handle(),
                reporter,
            }),
            events,
        })
    }
}

// =============================================================================
// Process spawner
// =============================================================================

/// Runs worker executables, linked to the host over the child's stdio.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner {
    transport: TransportConfig,
}

impl ProcessSpawner {
    pub fn new(transport: TransportConfig) -> Self {
        Self { transport }
    }

    /// Command line for `entry`: inspect flag, then the caller's args.
    pub fn command(&self, entry: &str, options: &SpawnOptions) -> Command {
        let mut command = Command::new(entry);
        if let Some(inspect) = &options.inspect {
            command.arg(inspect.to_flag());
        }
        command
            .args(&options.args)
            .envs(&options.env)
            .env(ENV_IN_CHILD_PROCESS, "true")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(name) = &options.service_name {
            command.env(ENV_SERVICE_NAME, name);
        }
        command
    }
}

#[derive(Debug)]
struct ProcessControl {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl WorkerControl for ProcessControl {
    fn kill(&self) -> Result<()> {
        self.kill.cancel();
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, entry: &str, options: &SpawnOptions) -> Result<SpawnedWorker> {
        let mut process = self.command(entry, options).spawn().map_err(|err| {
            tracing::error!(entry, error = %err, "unable to spawn worker process");
            Error::spawn(format!("{}: {}", entry, err))
        })?;

        let (Some(stdin), Some(stdout)) = (process.stdin.take(), process.stdout.take()) else {
            let _ = process.start_kill();
            return Err(Error::spawn(format!("{}: stdio was not captured", entry)));
        };

        let pid = process.id();
        let (child, far) = parent_link();
        LinkBridge::new(far, self.transport.clone(), BridgeRole::Host).spawn(stdout, stdin);

        let (events_tx, events) = mpsc::unbounded_channel();
        let reporter = ExitReporter::new(events_tx);
        reporter.spawned();

        let kill = CancellationToken::new();
        let kill_requested = kill.clone();
        let entry_name = entry.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = process.wait() => status,
                _ = kill_requested.cancelled() => {
                    if let Err(err) = process.start_kill() {
                        tracing::warn!(entry = %entry_name, error = %err, "kill signal failed");
                    }
                    process.wait().await
                }
            };
            let code = match status {
                Ok(status) => exit_code(status),
                Err(err) => {
                    tracing::error!(entry = %entry_name, error = %err, "lost track of worker process");
                    -1
                }
            };
            tracing::info!(entry = %entry_name, code, "worker process exited");
            reporter.exited(code);
        });

        tracing::info!(entry, pid = ?pid, "spawned worker process");
        Ok(SpawnedWorker {
            port: child,
            control: Box::new(ProcessControl { pid, kill }),
            events,
        })
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
