use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::relay::PeerLifecycle;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// How to launch the autonomous-control process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub restart_delay: Duration,
    pub stop_grace: Duration,
}

/// Lifecycle of the single supervised process.
#[derive(Debug)]
enum ProcessState {
    NotRunning,
    Running {
        pid: Option<u32>,
        generation: u64,
        stop_tx: oneshot::Sender<()>,
    },
    /// Interrupt sent, waiting for exit. `restart` is set when a start
    /// request arrives before the old process is gone.
    Stopping { generation: u64, restart: bool },
}

struct Inner {
    config: SupervisorConfig,
    state: Mutex<ProcessState>,
    generation: AtomicU64,
    spawns: AtomicU64,
    peers: Arc<AtomicUsize>,
    exited: Notify,
}

/// Owns the autonomous-control process. `start` and `stop` are idempotent
/// and safe to call concurrently; at most one process exists at a time.
#[derive(Clone)]
pub struct AiSupervisor {
    inner: Arc<Inner>,
}

impl AiSupervisor {
    /// `peers` is the relay's live peer count, consulted before crash restarts.
    pub fn new(config: SupervisorConfig, peers: Arc<AtomicUsize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ProcessState::NotRunning),
                generation: AtomicU64::new(0),
                spawns: AtomicU64::new(0),
                peers,
                exited: Notify::new(),
            }),
        }
    }

    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut state = self.inner.lock();
        match &mut *state {
            ProcessState::Running { .. } => {
                debug!("controller already running");
                Ok(())
            }
            ProcessState::Stopping { restart, .. } => {
                debug!("controller stopping, restart deferred until exit");
                *restart = true;
                Ok(())
            }
            ProcessState::NotRunning => Inner::spawn_locked(&self.inner, &mut state),
        }
    }

    pub fn stop(&self) {
        let mut state = self.inner.lock();
        match std::mem::replace(&mut *state, ProcessState::NotRunning) {
            ProcessState::NotRunning => {}
            ProcessState::Stopping { generation, .. } => {
                *state = ProcessState::Stopping {
                    generation,
                    restart: false,
                };
            }
            ProcessState::Running {
                pid,
                generation,
                stop_tx,
            } => {
                info!(?pid, "stopping controller");
                if let Some(pid) = pid {
                    if let Err(e) = send_interrupt(pid) {
                        warn!(error = %e, "interrupt failed, escalating after grace period");
                    }
                }
                // Arms the grace timer in the exit watcher.
                let _ = stop_tx.send(());
                *state = ProcessState::Stopping {
                    generation,
                    restart: false,
                };
            }
        }
    }

    /// Stop the controller and wait for it to exit, so that it gets the
    /// full interrupt grace period before the runtime goes away.
    pub async fn shutdown(&self) {
        self.stop();
        let idle = async {
            loop {
                let exited = self.inner.exited.notified();
                tokio::pin!(exited);
                exited.as_mut().enable();
                if self.is_idle() {
                    return;
                }
                exited.await;
            }
        };
        // The exit watcher kills at the end of the grace period; allow it to reap.
        let limit = self.inner.config.stop_grace + Duration::from_secs(1);
        if tokio::time::timeout(limit, idle).await.is_err() {
            warn!("controller still shutting down, giving up on it");
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.lock(), ProcessState::Running { .. })
    }

    /// True when no process exists and none is shutting down.
    pub fn is_idle(&self) -> bool {
        matches!(*self.inner.lock(), ProcessState::NotRunning)
    }

    /// Total processes spawned over the supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawns.load(Ordering::Relaxed)
    }

    pub fn pid(&self) -> Option<u32> {
        match *self.inner.lock() {
            ProcessState::Running { pid, .. } => pid,
            _ => None,
        }
    }
}

impl PeerLifecycle for AiSupervisor {
    fn first_peer_joined(&self) {
        info!("first relay peer connected, starting controller");
        if let Err(e) = self.start() {
            error!(error = %e, "controller start failed");
        }
    }

    fn last_peer_left(&self) {
        info!("no relay peers left, stopping controller");
        self.stop();
    }

    fn is_running(&self) -> bool {
        AiSupervisor::is_running(self)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        // State transitions never panic mid-update, so a poisoned lock still
        // holds a consistent value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_locked(this: &Arc<Self>, state: &mut ProcessState) -> Result<(), SupervisorError> {
        let cfg = &this.config;
        let mut child = Command::new(&cfg.program)
            .args(&cfg.args)
            .envs(cfg.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: cfg.program.clone(),
                source,
            })?;

        let pid = child.id();
        let generation = this.generation.fetch_add(1, Ordering::Relaxed) + 1;
        this.spawns.fetch_add(1, Ordering::Relaxed);
        info!(?pid, generation, program = %cfg.program, "controller started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        info!(process = "controller", "{}", line.trim());
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(process = "controller", "{}", line.trim());
                }
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(watch_exit(Arc::clone(this), child, generation, stop_rx));

        *state = ProcessState::Running {
            pid,
            generation,
            stop_tx,
        };
        Ok(())
    }

    fn on_exit(this: &Arc<Self>, generation: u64, status: std::io::Result<ExitStatus>) {
        let mut state = this.lock();
        let (current, restart) = match &*state {
            ProcessState::Running { generation, .. } => (Some(*generation), None),
            ProcessState::Stopping {
                generation,
                restart,
            } => (Some(*generation), Some(*restart)),
            ProcessState::NotRunning => (None, None),
        };
        if current != Some(generation) {
            debug!(generation, "ignoring exit of superseded controller");
            return;
        }

        *state = ProcessState::NotRunning;
        this.exited.notify_waiters();
        match restart {
            None => {
                warn!(generation, ?status, "controller exited unexpectedly");
                drop(state);
                if this.peers.load(Ordering::SeqCst) > 0 {
                    Inner::schedule_restart(this);
                }
            }
            Some(restart) => {
                info!(generation, ?status, "controller stopped");
                if restart {
                    if let Err(e) = Inner::spawn_locked(this, &mut state) {
                        error!(error = %e, "deferred controller start failed");
                    }
                }
            }
        }
    }

    fn schedule_restart(this: &Arc<Self>) {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.restart_delay).await;
            let mut state = inner.lock();
            if !matches!(*state, ProcessState::NotRunning) {
                return;
            }
            if inner.peers.load(Ordering::SeqCst) == 0 {
                debug!("peers gone before restart, leaving controller stopped");
                return;
            }
            info!("restarting controller for connected peers");
            if let Err(e) = Inner::spawn_locked(&inner, &mut state) {
                error!(error = %e, "controller restart failed");
            }
        });
    }
}

async fn watch_exit(
    inner: Arc<Inner>,
    mut child: Child,
    generation: u64,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut stop_rx => None,
    };
    let status = match exited {
        Some(status) => status,
        None => match tokio::time::timeout(inner.config.stop_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(generation, "controller ignored interrupt, killing");
                if let Err(e) = child.kill().await {
                    error!(generation, error = %e, "failed to kill controller");
                }
                child.wait().await
            }
        },
    };
    Inner::on_exit(&inner, generation, status);
}

#[cfg(unix)]
fn send_interrupt(pid: u32) -> Result<(), SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| SupervisorError::Signal {
        pid,
        reason: "pid out of range".into(),
    })?;
    match kill(Pid::from_raw(raw), Signal::SIGINT) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

/// Without POSIX signals the exit watcher's grace timer performs the kill.
#[cfg(not(unix))]
fn send_interrupt(_pid: u32) -> Result<(), SupervisorError> {
    Ok(())
}
