use crate::sandbox::guest::{ComponentCompiler, GuestRuntime};
use crate::sandbox::ipc::{ChannelEndpoint, FrameReceiver, FrameSender, IpcChannel, IpcError};
use crate::sandbox::{GuestConfig, IsolationConfig, GUEST_CONFIG_ENV};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Child program that speaks the guest protocol on stdin/stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestProgram {
    pub executable_path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// Where the isolated context runs.
#[derive(Clone)]
pub enum IsolationBackend {
    /// Dedicated OS thread with its own single-threaded runtime.
    Thread(Arc<dyn ComponentCompiler>),
    /// Separate process with a cleared environment and no network: it runs in
    /// its own user and network namespaces, so only a loopback device exists.
    Process(GuestProgram),
}

#[derive(Debug, Clone, Default)]
pub struct IsolationStats {
    pub pid: Option<u32>,
    pub start_time: Option<Instant>,
    pub exit_code: Option<i32>,
}

enum GuestHandle {
    Thread(std::thread::JoinHandle<()>),
    Process {
        child: Child,
        pumps: Vec<JoinHandle<()>>,
    },
}

/// Supervisor end of one isolated context.
pub struct IsolationHandle {
    instance_id: String,
    sender: FrameSender,
    receiver: FrameReceiver,
    guest: GuestHandle,
    stats: IsolationStats,
    teardown_grace: Duration,
}

pub struct IsolationHost;

impl IsolationHost {
    /// Starts a guest. The content policy is checked before anything is spawned.
    pub fn create(
        instance_id: &str,
        isolation: &IsolationConfig,
        guest: &GuestConfig,
        backend: IsolationBackend,
    ) -> Result<IsolationHandle, ProcessError> {
        guest.policy.validate().map_err(ProcessError::Policy)?;

        let (host_side, guest_side) = IpcChannel::pair(isolation.max_frame_bytes);
        let (guest, pid) = match backend {
            IsolationBackend::Thread(compiler) => {
                let handle = Self::spawn_thread(instance_id, compiler, guest.clone(), guest_side)?;
                (GuestHandle::Thread(handle), None)
            }
            IsolationBackend::Process(program) => Self::spawn_process(&program, guest, guest_side)?,
        };

        let (sender, receiver) = host_side.split();
        info!(instance_id, ?pid, "isolated context created");

        Ok(IsolationHandle {
            instance_id: instance_id.to_string(),
            sender,
            receiver,
            guest,
            stats: IsolationStats {
                pid,
                start_time: Some(Instant::now()),
                exit_code: None,
            },
            teardown_grace: Duration::from_millis(isolation.teardown_grace_ms),
        })
    }

    fn spawn_thread(
        instance_id: &str,
        compiler: Arc<dyn ComponentCompiler>,
        config: GuestConfig,
        endpoint: ChannelEndpoint,
    ) -> Result<std::thread::JoinHandle<()>, ProcessError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        std::thread::Builder::new()
            .name(format!("sandbox-guest-{instance_id}"))
            .spawn(move || {
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, GuestRuntime::run(compiler, config, endpoint));
            })
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))
    }

    fn spawn_process(
        program: &GuestProgram,
        config: &GuestConfig,
        endpoint: ChannelEndpoint,
    ) -> Result<(GuestHandle, Option<u32>), ProcessError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ProcessError::SpawnFailed("process backend needs a tokio runtime".into()))?;
        let handed_down = config
            .to_env_value()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        let mut command = Command::new(&program.executable_path);
        command
            .args(&program.arguments)
            .env_clear()
            .env(GUEST_CONFIG_ENV, handed_down)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &program.working_directory {
            command.current_dir(dir);
        }
        confine_network(&mut command)?;

        let mut child = {
            let _guard = runtime.enter();
            command.spawn().map_err(|e| match e.raw_os_error() {
                Some(code) if CONFINEMENT_ERRNOS.contains(&code) => ProcessError::ConfinementUnavailable(
                    format!("cannot create network namespace for guest: {e}"),
                ),
                _ => ProcessError::SpawnFailed(e.to_string()),
            })?
        };
        let pid = child.id();

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("guest stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("guest stdout not piped".into()))?;

        let (to_host, mut from_host) = endpoint.split();

        let writer = runtime.spawn(async move {
            while let Some(frame) = from_host.recv().await {
                if stdin.write_all(frame.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
            debug!("guest stdin closed");
        });

        let reader = runtime.spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = to_host.send(line) {
                    warn!(error = %e, "dropping guest frame");
                    if matches!(e, IpcError::ChannelClosed) {
                        break;
                    }
                }
            }
            debug!("guest stdout closed");
        });

        Ok((
            GuestHandle::Process {
                child,
                pumps: vec![writer, reader],
            },
            pid,
        ))
    }
}

/// Errors `unshare` reports when namespaces are disabled or exhausted.
#[cfg(target_os = "linux")]
const CONFINEMENT_ERRNOS: [i32; 3] = [
    nix::errno::Errno::EPERM as i32,
    nix::errno::Errno::EINVAL as i32,
    nix::errno::Errno::ENOSPC as i32,
];
#[cfg(not(target_os = "linux"))]
const CONFINEMENT_ERRNOS: [i32; 0] = [];

/// Moves the child into fresh user and network namespaces between fork and
/// exec. If that fails the spawn fails and no guest runs.
#[cfg(target_os = "linux")]
fn confine_network(command: &mut Command) -> Result<(), ProcessError> {
    use nix::sched::{unshare, CloneFlags};

    // SAFETY: the hook runs in the forked child before exec and only issues
    // the unshare syscall, which is async-signal-safe.
    unsafe {
        command.pre_exec(|| {
            unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET).map_err(std::io::Error::from)
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn confine_network(_command: &mut Command) -> Result<(), ProcessError> {
    Err(ProcessError::ConfinementUnavailable(
        "process guests need Linux network namespaces".into(),
    ))
}

impl IsolationHandle {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn send(&self, frame: String) -> Result<(), IpcError> {
        self.sender.send(frame)
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn stats(&self) -> IsolationStats {
        self.stats.clone()
    }

    /// Closes the link and waits for the guest to drain and exit.
    pub async fn teardown(self) -> Result<IsolationStats, ProcessError> {
        let IsolationHandle {
            instance_id,
            sender,
            mut receiver,
            guest,
            mut stats,
            teardown_grace,
        } = self;

        drop(sender);
        receiver.close();

        let result = match guest {
            GuestHandle::Thread(handle) => {
                let join = tokio::task::spawn_blocking(move || handle.join());
                match tokio::time::timeout(teardown_grace, join).await {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(_))) => Err(ProcessError::TerminationFailed("guest thread panicked".into())),
                    Ok(Err(e)) => Err(ProcessError::WaitFailed(e.to_string())),
                    Err(_) => {
                        warn!(instance_id, "guest thread did not exit in time, detaching");
                        Ok(())
                    }
                }
            }
            GuestHandle::Process { mut child, pumps } => {
                let exit = match tokio::time::timeout(teardown_grace, child.wait()).await {
                    Ok(waited) => waited.map_err(|e| ProcessError::WaitFailed(e.to_string())),
                    Err(_) => {
                        warn!(instance_id, "guest process did not exit in time, killing");
                        child
                            .kill()
                            .await
                            .map_err(|e| ProcessError::TerminationFailed(e.to_string()))?;
                        child
                            .wait()
                            .await
                            .map_err(|e| ProcessError::WaitFailed(e.to_string()))
                    }
                };
                for pump in pumps {
                    pump.abort();
                }
                exit.map(|status| {
                    stats.exit_code = status.code();
                })
            }
        };

        info!(instance_id, "isolated context torn down");
        result.map(|()| stats)
    }
}

#[cfg(test)]
impl IsolationHandle {
    /// Handle whose guest side is driven by the caller through the other
    /// endpoint of `host_side`'s pair.
    pub(crate) fn for_endpoint(instance_id: &str, host_side: ChannelEndpoint) -> Self {
        let (sender, receiver) = host_side.split();
        IsolationHandle {
            instance_id: instance_id.to_string(),
            sender,
            receiver,
            guest: GuestHandle::Thread(std::thread::spawn(|| {})),
            stats: IsolationStats::default(),
            teardown_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn guest: {0}")]
    SpawnFailed(String),
    #[error("Guest termination failed: {0}")]
    TerminationFailed(String),
    #[error("Failed to wait for guest: {0}")]
    WaitFailed(String),
    #[error("Network confinement unavailable: {0}")]
    ConfinementUnavailable(String),
    #[error(transparent)]
    Policy(#[from] crate::sandbox::security::PolicyError),
}
