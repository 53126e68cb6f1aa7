//! Supervision of the server process: launch, readiness detection, and termination.
//!
//! A [`ServerSupervisor`] manages at most one live server process. Its state
//! moves `NotStarted -> Starting -> Running -> Stopping -> Stopped`, or straight
//! from `Starting` to `Stopped` when the launch fails. Every transition happens
//! under one mutex. The matching `Started` or `Stopped` event is published on
//! the supervisor's [`EventBus`] after the lock is released, so handlers see
//! the new state and may call back into the supervisor.
#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::{
    collections::HashMap,
    fs, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        mpsc::{self, Receiver, Sender},
    },
    thread,
    time::Duration,
};

use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    acquire::BinaryAcquirer,
    config::ManagerConfig,
    constants::{
        BASE_DIR_FLAG, NODE_NAME_FLAG, OUTPUT_DRAIN_TIMEOUT, SPAWN_BUSY_DELAY,
        SPAWN_BUSY_RETRIES,
    },
    error::ManagerError,
    events::{EventBus, ExitInfo, LifecycleEvent, SubscriptionId},
    logs::{for_each_line, spawn_stderr_forwarder},
};

/// Lifecycle state of the managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ServerState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ServerState {
    /// Whether a process may currently exist for this supervisor.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

/// Result of work scheduled on a background thread.
#[must_use = "call `wait` to observe the outcome"]
pub struct Pending<T> {
    worker: &'static str,
    receiver: Receiver<Result<T, ManagerError>>,
}

impl<T> Pending<T> {
    fn channel(worker: &'static str) -> (Sender<Result<T, ManagerError>>, Self) {
        let (sender, receiver) = mpsc::channel();
        (sender, Self { worker, receiver })
    }

    /// Blocks until the background work reports its outcome.
    pub fn wait(self) -> Result<T, ManagerError> {
        let worker = self.worker;
        self.receiver
            .recv()
            .map_err(|_| ManagerError::WorkerPanicked(worker))?
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ServerState,
    pid: Option<u32>,
    last_exit: Option<ExitInfo>,
    /// Bumped by every accepted `start()`, so output from an earlier process
    /// cannot mark a later one ready.
    launch: u64,
    /// Transitions whose event is still being delivered to subscribers.
    announcing: usize,
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
    events: EventBus,
}

impl Shared {
    fn new(events: EventBus) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::NotStarted,
                pid: None,
                last_exit: None,
                launch: 0,
                announcing: 0,
            }),
            changed: Condvar::new(),
            events,
        }
    }

    /// Lock for background threads and accessors, which cannot report poisoning.
    /// Every update is a plain field assignment, so the data stays consistent.
    fn guard(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, apply: impl FnOnce(&mut Lifecycle) -> bool) -> bool {
        let changed = apply(&mut self.guard());
        if changed {
            self.changed.notify_all();
        }
        changed
    }

    fn record_pid(&self, pid: u32) {
        self.update(|lifecycle| {
            lifecycle.pid = Some(pid);
            true
        });
    }

    /// Moves launch `launch` from `Starting` to `Running`. The caller must
    /// follow a `true` result with [`Self::announce`].
    fn mark_running(&self, launch: u64) -> bool {
        self.update(|lifecycle| {
            if lifecycle.launch != launch || lifecycle.state != ServerState::Starting {
                return false;
            }
            lifecycle.state = ServerState::Running;
            lifecycle.announcing += 1;
            true
        })
    }

    fn abort_start(&self) {
        self.update(|lifecycle| {
            lifecycle.state = ServerState::Stopped;
            lifecycle.pid = None;
            true
        });
    }

    /// Records the exit of the current process. The caller must follow with
    /// [`Self::announce`].
    fn mark_exited(&self, exit: ExitInfo) {
        self.update(|lifecycle| {
            lifecycle.state = ServerState::Stopped;
            lifecycle.pid = None;
            lifecycle.last_exit = Some(exit);
            lifecycle.announcing += 1;
            true
        });
    }

    /// Publishes the event for a transition that has already been applied.
    /// Runs without the lifecycle lock, so handlers may query or drive the supervisor.
    fn announce(&self, event: LifecycleEvent) {
        self.events.publish(event);
        self.update(|lifecycle| {
            lifecycle.announcing = lifecycle.announcing.saturating_sub(1);
            true
        });
    }

    /// Waits until the process `pid` has been reaped and its `Stopped` event
    /// delivered. Returns `false` on timeout.
    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let guard = self.guard();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |lifecycle| {
                lifecycle.pid == Some(pid) || lifecycle.announcing > 0
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.pid != Some(pid)
    }
}

#[derive(Debug)]
struct LaunchPlan {
    label: String,
    base_directory: PathBuf,
    node_name: String,
    environment: HashMap<String, String>,
    readiness_marker: String,
}

/// Owns the single server instance for one install location.
#[derive(Clone)]
pub struct ServerSupervisor {
    shared: Arc<Shared>,
    acquirer: BinaryAcquirer,
    launch: Arc<LaunchPlan>,
    stop_timeout: Duration,
    kill_timeout: Duration,
}

impl ServerSupervisor {
    /// Creates a supervisor that fetches releases from the configured feed.
    pub fn new(config: &ManagerConfig) -> Result<Self, ManagerError> {
        Self::with_acquirer(config, BinaryAcquirer::from_config(config)?)
    }

    /// Creates a supervisor with an explicit binary acquirer.
    pub fn with_acquirer(
        config: &ManagerConfig,
        acquirer: BinaryAcquirer,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(EventBus::new())),
            acquirer,
            launch: Arc::new(LaunchPlan {
                label: config.binary_name.clone(),
                base_directory: config.base_directory.clone(),
                node_name: config.node_name.clone(),
                environment: config.merged_environment(),
                readiness_marker: config.readiness_marker.clone(),
            }),
            stop_timeout: config.stop_timeout()?,
            kill_timeout: config.kill_timeout()?,
        })
    }

    /// Bus carrying this supervisor's `Started`/`Stopped` events.
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Shorthand for subscribing to [`Self::events`].
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(handler)
    }

    pub fn state(&self) -> ServerState {
        self.shared.guard().state
    }

    /// PID of the live server process, if one has been spawned.
    pub fn pid(&self) -> Option<u32> {
        self.shared.guard().pid
    }

    /// Exit details of the most recent process.
    pub fn last_exit(&self) -> Option<ExitInfo> {
        self.shared.guard().last_exit
    }

    /// Blocks until `accept` holds for the current state and any event for it
    /// has been delivered, or until `timeout` passes. Returns the state observed
    /// last. Calling this from an event handler waits for the full timeout.
    pub fn wait_for_state(
        &self,
        timeout: Duration,
        accept: impl Fn(ServerState) -> bool,
    ) -> ServerState {
        let guard = self.shared.guard();
        let (guard, _) = self
            .shared
            .changed
            .wait_timeout_while(guard, timeout, |lifecycle| {
                !accept(lifecycle.state) || lifecycle.announcing > 0
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.state
    }

    /// Schedules a launch of the server.
    ///
    /// Returns [`ManagerError::AlreadyRunning`] without side effects while an
    /// instance is starting, running, or stopping. Otherwise the binary is
    /// acquired and spawned on a background thread; the returned [`Pending`]
    /// yields the child's PID or the acquisition/spawn error.
    pub fn start(&self) -> Result<Pending<u32>, ManagerError> {
        let launch = {
            let mut lifecycle = self.shared.lifecycle.lock()?;
            if lifecycle.state.is_active() {
                info!(
                    "'{}' is already {}; only one instance can run at a time",
                    self.launch.label, lifecycle.state
                );
                return Err(ManagerError::AlreadyRunning);
            }
            lifecycle.state = ServerState::Starting;
            lifecycle.pid = None;
            lifecycle.launch += 1;
            lifecycle.launch
        };
        self.shared.changed.notify_all();

        let (sender, pending) = Pending::channel("start");
        let worker = self.clone();
        // The thread lives as long as the child and reaps it.
        let spawned = thread::Builder::new()
            .name(format!("{}-server", self.launch.label))
            .spawn(move || worker.run_server(launch, sender));

        if let Err(err) = spawned {
            self.shared.abort_start();
            return Err(ManagerError::WorkerUnavailable(err));
        }
        Ok(pending)
    }

    /// Schedules termination of the running server.
    ///
    /// Sends a graceful termination request, escalates to a forced kill after
    /// the stop timeout, and logs if the process still survives. The returned
    /// [`Pending`] yields the exit details, or `None` when there was nothing to
    /// stop or termination could not be confirmed.
    pub fn stop(&self) -> Result<Pending<Option<ExitInfo>>, ManagerError> {
        enum Plan {
            Terminate(u32),
            Await(u32),
            Nothing,
        }

        let plan = {
            let mut lifecycle = self.shared.lifecycle.lock()?;
            match (lifecycle.state, lifecycle.pid) {
                (ServerState::Starting | ServerState::Running, Some(pid)) => {
                    lifecycle.state = ServerState::Stopping;
                    Plan::Terminate(pid)
                }
                (ServerState::Stopping, Some(pid)) => Plan::Await(pid),
                (ServerState::Starting, None) => {
                    warn!(
                        "'{}' is still being fetched; it cannot be stopped before it launches",
                        self.launch.label
                    );
                    Plan::Nothing
                }
                (state, _) => {
                    debug!("'{}' is {state}; nothing to stop", self.launch.label);
                    Plan::Nothing
                }
            }
        };
        self.shared.changed.notify_all();

        let (sender, pending) = Pending::channel("stop");
        let worker = self.clone();
        thread::Builder::new()
            .name(format!("{}-stop", self.launch.label))
            .spawn(move || {
                let outcome = match plan {
                    Plan::Terminate(pid) => worker.terminate(pid),
                    Plan::Await(pid) => worker
                        .shared
                        .wait_for_exit(pid, worker.stop_timeout + worker.kill_timeout)
                        .then(|| worker.last_exit())
                        .flatten(),
                    Plan::Nothing => None,
                };
                let _ = sender.send(Ok(outcome));
            })
            .map_err(ManagerError::WorkerUnavailable)?;

        Ok(pending)
    }

    fn run_server(&self, launch: u64, sender: Sender<Result<u32, ManagerError>>) {
        let launched = panic::catch_unwind(AssertUnwindSafe(|| {
            self.acquirer
                .ensure_binary()
                .and_then(|binary| self.spawn_server(&binary.program))
        }))
        .unwrap_or_else(|_| Err(ManagerError::WorkerPanicked("start")));

        let (mut child, stdout) = match launched {
            Ok(parts) => parts,
            Err(err) => {
                error!("Failed to start '{}': {err}", self.launch.label);
                self.shared.abort_start();
                let _ = sender.send(Err(err));
                return;
            }
        };

        let pid = child.id();
        // The caller may have dropped its handle; the server keeps running regardless.
        let _ = sender.send(Ok(pid));

        // Serialises this process's announcements so `Started` never follows `Stopped`.
        let turn = Arc::new(Mutex::new(()));
        let mut drained = None;
        if let Some(stdout) = stdout {
            let scanner = self.clone();
            let turn = Arc::clone(&turn);
            let (done, finished) = mpsc::channel::<()>();
            let spawned = thread::Builder::new()
                .name(format!("{}-stdout", self.launch.label))
                .spawn(move || {
                    scanner.scan_output(launch, stdout, &turn);
                    let _ = done.send(());
                });
            match spawned {
                Ok(_) => drained = Some(finished),
                Err(err) => error!(
                    "Cannot watch output of '{}' (PID {pid}); readiness will not be detected: {err}",
                    self.launch.label
                ),
            }
        }

        let exit = match child.wait() {
            Ok(status) => ExitInfo {
                exit_code: status.code(),
                #[cfg(unix)]
                signal: status.signal(),
                #[cfg(not(unix))]
                signal: None,
            },
            Err(err) => {
                error!("Failed to reap '{}' (PID {pid}): {err}", self.launch.label);
                ExitInfo::default()
            }
        };

        info!(
            "'{}' (PID {pid}) terminated (exit code {:?}, signal {:?})",
            self.launch.label, exit.exit_code, exit.signal
        );
        // Lines written just before exit may still carry the readiness marker.
        if let Some(finished) = drained
            && finished.recv_timeout(OUTPUT_DRAIN_TIMEOUT).is_err()
        {
            debug!(
                "Output of '{}' is still open after exit; announcing anyway",
                self.launch.label
            );
        }
        let _turn = turn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.shared.mark_exited(exit);
        self.shared.announce(LifecycleEvent::Stopped(exit));
    }

    fn scan_output(&self, launch: u64, stdout: ChildStdout, turn: &Mutex<()>) {
        let marker = self.launch.readiness_marker.as_str();
        let mut announced = false;

        // Descendants may keep the pipe open after the server exits.
        for_each_line(stdout, |line| {
            info!(target: "server", "{line}");
            if announced || !line.contains(marker) {
                return;
            }
            announced = true;
            let _turn = turn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !self.shared.mark_running(launch) {
                debug!("Readiness reported while {}; not announcing", self.state());
                return;
            }
            info!("'{}' is ready", self.launch.label);
            self.shared.announce(LifecycleEvent::Started);
        });
    }

    fn spawn_server(&self, program: &Path) -> Result<(Child, Option<ChildStdout>), ManagerError> {
        let plan = &self.launch;
        let spawn_err = |source: io::Error| ManagerError::SpawnFailed {
            binary: program.display().to_string(),
            source,
        };

        fs::create_dir_all(&plan.base_directory).map_err(spawn_err)?;
        let base_directory = std::path::absolute(&plan.base_directory).map_err(spawn_err)?;
        // Bare names go through PATH; anything with a directory must survive `current_dir`.
        let program = if program.components().count() > 1 {
            std::path::absolute(program).map_err(spawn_err)?
        } else {
            program.to_path_buf()
        };

        let mut cmd = Command::new(&program);
        cmd.arg(BASE_DIR_FLAG)
            .arg(&base_directory)
            .arg(NODE_NAME_FLAG)
            .arg(&plan.node_name)
            .current_dir(&base_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if !plan.environment.is_empty() {
            let keys: Vec<_> = plan.environment.keys().collect();
            debug!("Setting environment variables: {:?}", keys);
            cmd.envs(&plan.environment);
        }

        #[cfg(unix)]
        isolate_process_group(&mut cmd);

        debug!("Executing command: {cmd:?}");
        let mut child = spawn_when_not_busy(&mut cmd).map_err(spawn_err)?;

        let pid = child.id();
        self.shared.record_pid(pid);
        info!("'{}' started with PID {pid}", plan.label);

        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_forwarder(&plan.label, stderr);
        }
        let stdout = child.stdout.take();
        Ok((child, stdout))
    }

    fn terminate(&self, pid: u32) -> Option<ExitInfo> {
        let label = &self.launch.label;
        info!("Stopping '{label}' (PID {pid})");

        if let Err(err) = signal_server(pid, Termination::Graceful) {
            debug!("Termination request for '{label}' (PID {pid}) failed: {err}");
        }
        if self.shared.wait_for_exit(pid, self.stop_timeout) {
            return self.last_exit();
        }

        warn!(
            "'{label}' did not exit within {:?} after termination request; forcing",
            self.stop_timeout
        );
        if self.pid() == Some(pid)
            && let Err(err) = signal_server(pid, Termination::Forced)
        {
            error!("Failed to forcefully terminate '{label}' (PID {pid}): {err}");
        }
        if self.shared.wait_for_exit(pid, self.kill_timeout) {
            return self.last_exit();
        }

        error!(
            "'{label}' (PID {pid}) still running {:?} after forced termination",
            self.kill_timeout
        );
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

/// Signals the server's process group, or the server alone if it shares ours.
#[cfg(unix)]
fn signal_server(pid: u32, termination: Termination) -> io::Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, kill, killpg},
        unistd::{Pid, getpgid, getpgrp},
    };

    fn nix_error_to_io(err: Errno) -> io::Error {
        io::Error::from_raw_os_error(err as i32)
    }

    let signal = match termination {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    let target = Pid::from_raw(pid as i32);

    match getpgid(Some(target)) {
        Ok(group) if group != getpgrp() => match killpg(group, signal) {
            Ok(()) => {
                debug!("Sent {signal} to process group {group}");
                Ok(())
            }
            Err(err) => {
                debug!("Signalling process group {group} failed ({err}); signalling PID {pid}");
                kill(target, signal).map_err(nix_error_to_io)
            }
        },
        _ => kill(target, signal).map_err(nix_error_to_io),
    }
}

#[cfg(not(unix))]
fn signal_server(pid: u32, termination: Termination) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot deliver {termination:?} termination to PID {pid} on this platform"),
    ))
}

/// Puts the child in its own process group so the whole tree can be signalled,
/// and on Linux asks the kernel to terminate it if the launching thread dies.
#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        });
    }
}

/// Spawns `cmd`, retrying briefly while a just-installed binary is still
/// open for writing in a concurrently forked process (`ETXTBSY`).
fn spawn_when_not_busy(cmd: &mut Command) -> io::Result<Child> {
    let mut attempt = 0;
    loop {
        match cmd.spawn() {
            Err(err) if is_text_busy(&err) && attempt < SPAWN_BUSY_RETRIES => {
                attempt += 1;
                debug!("Binary busy on spawn attempt {attempt}; retrying");
                thread::sleep(SPAWN_BUSY_DELAY);
            }
            result => return result,
        }
    }
}

#[cfg(unix)]
fn is_text_busy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_busy(_err: &io::Error) -> bool {
    false
}
