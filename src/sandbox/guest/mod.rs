//! Runs inside the isolated context. Receives host frames, drives the
//! component render state machine and owns the interception layer.

pub mod intercept;

pub use intercept::*;

use crate::sandbox::ipc::{
    decode_host, encode, ChannelEndpoint, ErrorPayload, ErrorPhase, FrameSender, GuestMessage,
    HostMessage, IpcChannel,
};
use crate::sandbox::GuestConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A compiled component. Lives on the guest thread only.
#[async_trait(?Send)]
pub trait Component {
    async fn mount(&mut self, props: &Value, globals: &SandboxGlobals) -> Result<(), ComponentError>;

    /// Applies new props to an already mounted component.
    async fn update(&mut self, props: &Value, globals: &SandboxGlobals) -> Result<(), ComponentError>;
}

/// Turns opaque component source into a [`Component`].
pub trait ComponentCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Box<dyn Component>, ComponentError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ComponentError {
    pub message: String,
    pub stack: Option<String>,
    pub phase: ErrorPhase,
}

impl ComponentError {
    pub fn compile(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            phase: ErrorPhase::Compile,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            phase: ErrorPhase::Runtime,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<CapabilityError> for ComponentError {
    fn from(err: CapabilityError) -> Self {
        ComponentError::runtime(err.to_string())
    }
}

impl From<ComponentError> for ErrorPayload {
    fn from(err: ComponentError) -> Self {
        ErrorPayload {
            message: err.message,
            stack: err.stack,
            phase: Some(err.phase),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestState {
    Constructing,
    Ready,
    Rendering,
    Mounted,
    Errored,
}

type SharedComponent = Rc<Mutex<Box<dyn Component>>>;

struct RenderState {
    state: Cell<GuestState>,
    generation: Cell<u64>,
    mounted: RefCell<Option<SharedComponent>>,
}

/// Guest-side event loop. Must run inside a [`tokio::task::LocalSet`].
pub struct GuestRuntime {
    compiler: Arc<dyn ComponentCompiler>,
    link: FrameSender,
    calls: Rc<CallRegistry>,
    globals: Rc<SandboxGlobals>,
    render: Rc<RenderState>,
    tasks: JoinSet<()>,
    shutdown_grace: Duration,
}

impl GuestRuntime {
    pub fn new(compiler: Arc<dyn ComponentCompiler>, config: &GuestConfig, link: FrameSender) -> Self {
        let calls = Rc::new(CallRegistry::new(
            link.clone(),
            Duration::from_millis(config.call_timeout_ms),
        ));
        let globals = Rc::new(SandboxGlobals::new(Rc::clone(&calls), config.policy.clone()));

        Self {
            compiler,
            link,
            calls,
            globals,
            render: Rc::new(RenderState {
                state: Cell::new(GuestState::Constructing),
                generation: Cell::new(0),
                mounted: RefCell::new(None),
            }),
            tasks: JoinSet::new(),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }

    pub fn state(&self) -> GuestState {
        self.render.state.get()
    }

    /// Serves frames from `endpoint` until the supervisor closes the link.
    pub async fn run(
        compiler: Arc<dyn ComponentCompiler>,
        config: GuestConfig,
        endpoint: ChannelEndpoint,
    ) {
        let (link, mut frames) = endpoint.split();
        let mut runtime = GuestRuntime::new(compiler, &config, link);

        runtime.render.state.set(GuestState::Ready);
        runtime.emit(&GuestMessage::Ready);
        info!("guest ready");

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => runtime.handle_frame(&frame),
                    None => break,
                },
                Some(joined) = runtime.tasks.join_next(), if !runtime.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            runtime.render.mounted.borrow_mut().take();
                            runtime.fail(ComponentError::runtime("component panicked"));
                        }
                    }
                }
            }
        }

        runtime.shutdown().await;
    }

    pub fn handle_frame(&mut self, frame: &str) {
        match decode_host(frame) {
            Ok(HostMessage::Render { code, props }) => self.render(&code, props),
            Ok(HostMessage::UpdateProps { props }) => self.update_props(props),
            Ok(HostMessage::CapabilityResponse { id, result, error }) => {
                let outcome = match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                self.calls.resolve(&id, outcome);
            }
            Err(e) => warn!(error = %e, "dropping malformed host frame"),
        }
    }

    fn render(&mut self, code: &str, props: Value) {
        let generation = self.render.generation.get() + 1;
        self.render.generation.set(generation);
        self.render.state.set(GuestState::Rendering);
        self.render.mounted.borrow_mut().take();

        let component = match self.compiler.compile(code) {
            Ok(component) => Rc::new(Mutex::new(component)),
            Err(e) => {
                debug!(generation, error = %e, "component failed to compile");
                self.fail(e);
                return;
            }
        };

        let render = Rc::clone(&self.render);
        let globals = Rc::clone(&self.globals);
        let link = self.link.clone();
        self.tasks.spawn_local(async move {
            let outcome = {
                let mut guard = component.lock().await;
                guard.mount(&props, &globals).await
            };

            if render.generation.get() != generation {
                debug!(generation, "render superseded");
                return;
            }
            match outcome {
                Ok(()) => {
                    render.state.set(GuestState::Mounted);
                    *render.mounted.borrow_mut() = Some(component);
                    send(&link, &GuestMessage::Rendered);
                }
                Err(e) => {
                    render.state.set(GuestState::Errored);
                    send(&link, &GuestMessage::Error { error: e.into() });
                }
            }
        });
    }

    fn update_props(&mut self, props: Value) {
        let Some(component) = self.render.mounted.borrow().clone() else {
            debug!("updateProps before mount ignored");
            return;
        };
        let generation = self.render.generation.get();

        let render = Rc::clone(&self.render);
        let globals = Rc::clone(&self.globals);
        let link = self.link.clone();
        self.tasks.spawn_local(async move {
            let outcome = {
                let mut guard = component.lock().await;
                guard.update(&props, &globals).await
            };
            if let Err(e) = outcome {
                if render.generation.get() == generation {
                    render.state.set(GuestState::Errored);
                    render.mounted.borrow_mut().take();
                    send(&link, &GuestMessage::Error { error: e.into() });
                }
            }
        });
    }

    fn fail(&self, err: ComponentError) {
        self.render.state.set(GuestState::Errored);
        self.emit(&GuestMessage::Error { error: err.into() });
    }

    fn emit(&self, message: &GuestMessage) {
        send(&self.link, message);
    }

    async fn shutdown(mut self) {
        let rejected = self.calls.destroy_all();
        debug!(rejected, "link closed, rejected pending capability calls");

        let drain = async { while self.tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!("component tasks still running after grace period, aborting");
            self.tasks.abort_all();
        }
        self.render.mounted.borrow_mut().take();
        info!("guest stopped");
    }
}

fn send(link: &FrameSender, message: &GuestMessage) {
    match encode(message) {
        Ok(frame) => {
            if let Err(e) = link.send(frame) {
                debug!(error = %e, "guest frame not delivered");
            }
        }
        Err(e) => error!(error = %e, "failed to encode guest frame"),
    }
}

/// Entry point for a child-process guest: newline-delimited JSON frames on
/// stdin/stdout. Runs under the config the isolation host handed down in
/// [`crate::sandbox::GUEST_CONFIG_ENV`] and blocks until stdin closes.
pub fn serve_stdio(compiler: Arc<dyn ComponentCompiler>) -> std::io::Result<()> {
    let config = GuestConfig::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    info!(bundles = config.policy.runtime_bundles.len(), "guest config received");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let (host_side, guest_side) = IpcChannel::pair(config.max_frame_bytes);
        let (to_guest, mut from_guest) = host_side.split();

        let reader = tokio::task::spawn_local(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if to_guest.send(line).is_err() {
                    break;
                }
            }
        });

        let writer = tokio::task::spawn_local(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(frame) = from_guest.recv().await {
                if stdout.write_all(frame.as_bytes()).await.is_err()
                    || stdout.write_all(b"\n").await.is_err()
                    || stdout.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let grace = Duration::from_millis(config.shutdown_grace_ms);
        GuestRuntime::run(compiler, config, guest_side).await;
        reader.abort();
        let _ = tokio::time::timeout(grace, writer).await;
    });

    Ok(())
}
