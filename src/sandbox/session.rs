use super::broker::{BrokerError, CapabilityBroker, HostFacilities, PermissionPrompter};
use super::guest::GuestState;
use super::ipc::{
    decode_guest, encode, salvage_request_id, typed_request, ErrorPayload, GuestMessage, HostMessage,
    IpcError,
};
use super::permissions::{AuditEvent, Capability, DecisionAuditor, PermissionRule, RuleStore};
use super::process::{IsolationBackend, IsolationHandle, IsolationHost};
use super::{SandboxConfig, SandboxError};
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub type ErrorCallback = Arc<dyn Fn(&ErrorPayload) + Send + Sync>;
pub type RenderedCallback = Arc<dyn Fn() + Send + Sync>;

/// How an embedder configures one sandbox.
#[derive(Clone, Default)]
pub struct SessionOptions {
    pub initial_props: Value,
    pub enabled_capabilities: Vec<Capability>,
    pub preset_rules: Vec<PermissionRule>,
    pub on_error: Option<ErrorCallback>,
    pub on_rendered: Option<RenderedCallback>,
}

impl SessionOptions {
    pub fn enable(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.enabled_capabilities.extend(capabilities);
        self
    }

    pub fn with_rule(mut self, rule: PermissionRule) -> Self {
        self.preset_rules.push(rule);
        self
    }

    pub fn with_props(mut self, props: Value) -> Self {
        self.initial_props = props;
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&ErrorPayload) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_rendered(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_rendered = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyReport {
    /// Capability requests that never got an answer: broker tasks that were
    /// aborted plus request frames still queued on the link.
    pub rejected_requests: usize,
}

enum SessionCommand {
    Render(String),
    UpdateProps(Value),
    Destroy(oneshot::Sender<DestroyReport>),
}

/// Supervisor side of one sandbox: owns the isolated context and its broker.
pub struct SandboxSession {
    instance_id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<GuestState>,
    rules: Arc<RuleStore>,
    auditor: Arc<DecisionAuditor>,
    supervisor: JoinHandle<()>,
}

impl SandboxSession {
    /// Creates the isolated context and starts supervising it. Needs a tokio runtime.
    pub fn start(
        instance_id: &str,
        backend: IsolationBackend,
        options: SessionOptions,
        prompter: Arc<dyn PermissionPrompter>,
        facilities: &HostFacilities,
        config: &SandboxConfig,
    ) -> Result<Self, SandboxError> {
        let rules = Arc::new(RuleStore::with_rules(options.preset_rules.iter().cloned()));
        let broker = Arc::new(CapabilityBroker::new(
            instance_id,
            options.enabled_capabilities.iter().copied(),
            Arc::clone(&rules),
            prompter,
            facilities,
            &config.broker,
        )?);
        let auditor = Arc::clone(broker.auditor());

        let link = IsolationHost::create(instance_id, &config.isolation, &config.guest, backend)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(GuestState::Constructing);

        let supervisor = Supervisor {
            instance_id: instance_id.to_string(),
            link,
            link_open: true,
            broker,
            state: state_tx,
            props: options.initial_props,
            props_dirty: false,
            queued_render: None,
            inflight: JoinSet::new(),
            on_error: options.on_error,
            on_rendered: options.on_rendered,
        };
        let supervisor = tokio::spawn(supervisor.run(command_rx));

        info!(instance_id, "sandbox session started");
        Ok(Self {
            instance_id: instance_id.to_string(),
            commands,
            state,
            rules,
            auditor,
            supervisor,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Renders `code` with the current props. Queued until the guest is ready.
    pub fn render(&self, code: impl Into<String>) -> Result<(), SandboxError> {
        self.send(SessionCommand::Render(code.into()))
    }

    pub fn update_props(&self, props: Value) -> Result<(), SandboxError> {
        self.send(SessionCommand::UpdateProps(props))
    }

    pub fn state(&self) -> GuestState {
        *self.state.borrow()
    }

    /// Watch channel following the mirrored guest state.
    pub fn state_changes(&self) -> watch::Receiver<GuestState> {
        self.state.clone()
    }

    pub fn rules(&self) -> Vec<PermissionRule> {
        self.rules.snapshot()
    }

    pub fn audit(&self, limit: usize) -> Vec<AuditEvent> {
        self.auditor.recent(limit)
    }

    /// Tears down the isolated context and aborts in-flight capability work.
    pub async fn destroy(self) -> Result<DestroyReport, SandboxError> {
        let (reply, report) = oneshot::channel();
        self.send(SessionCommand::Destroy(reply))?;
        let report = report.await.map_err(|_| SandboxError::SessionClosed)?;
        if let Err(e) = self.supervisor.await {
            warn!(instance_id = %self.instance_id, error = %e, "supervisor task ended abnormally");
        }
        Ok(report)
    }

    fn send(&self, command: SessionCommand) -> Result<(), SandboxError> {
        self.commands
            .send(command)
            .map_err(|_| SandboxError::SessionClosed)
    }
}

type Settled = (String, Result<Value, BrokerError>);

struct Supervisor {
    instance_id: String,
    link: IsolationHandle,
    link_open: bool,
    broker: Arc<CapabilityBroker>,
    state: watch::Sender<GuestState>,
    props: Value,
    props_dirty: bool,
    queued_render: Option<String>,
    inflight: JoinSet<Settled>,
    on_error: Option<ErrorCallback>,
    on_rendered: Option<RenderedCallback>,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Render(code)) => self.render(code),
                    Some(SessionCommand::UpdateProps(props)) => self.update_props(props),
                    Some(SessionCommand::Destroy(reply)) => {
                        let report = self.shutdown().await;
                        let _ = reply.send(report);
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                frame = self.link.recv(), if self.link_open => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => self.link_lost(),
                },
                Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    match joined {
                        Ok((id, outcome)) => self.respond(&id, outcome.map_err(|e| e.to_string())),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => error!(instance_id = %self.instance_id, error = %e, "capability task failed"),
                    }
                }
            }
        }
    }

    fn state(&self) -> GuestState {
        *self.state.borrow()
    }

    fn set_state(&self, state: GuestState) {
        self.state.send_replace(state);
    }

    fn render(&mut self, code: String) {
        if matches!(self.state(), GuestState::Constructing) {
            debug!(instance_id = %self.instance_id, "guest not ready, queueing render");
            self.queued_render = Some(code);
            return;
        }
        self.props_dirty = false;
        self.set_state(GuestState::Rendering);
        self.send(&HostMessage::Render {
            code,
            props: self.props.clone(),
        });
    }

    fn update_props(&mut self, props: Value) {
        self.props = props;
        match self.state() {
            GuestState::Mounted => self.send(&HostMessage::UpdateProps {
                props: self.props.clone(),
            }),
            GuestState::Rendering => self.props_dirty = true,
            _ => {}
        }
    }

    fn handle_frame(&mut self, frame: &str) {
        let message = match decode_guest(frame) {
            Ok(message) => message,
            Err(e) => {
                match salvage_request_id(frame) {
                    Some(id) => {
                        warn!(instance_id = %self.instance_id, request_id = %id, error = %e, "unsupported capability request");
                        self.respond(&id, Err(format!("Unsupported capability request: {e}")));
                    }
                    None => warn!(instance_id = %self.instance_id, error = %e, "dropping malformed guest frame"),
                }
                return;
            }
        };

        match message {
            GuestMessage::Ready => {
                self.set_state(GuestState::Ready);
                debug!(instance_id = %self.instance_id, "guest ready");
                if let Some(code) = self.queued_render.take() {
                    self.render(code);
                }
            }
            GuestMessage::Rendered => {
                self.set_state(GuestState::Mounted);
                if let Some(callback) = &self.on_rendered {
                    callback();
                }
                if std::mem::take(&mut self.props_dirty) {
                    self.send(&HostMessage::UpdateProps {
                        props: self.props.clone(),
                    });
                }
            }
            GuestMessage::Error { error } => {
                warn!(instance_id = %self.instance_id, message = %error.message, phase = ?error.phase, "component error");
                self.set_state(GuestState::Errored);
                if let Some(callback) = &self.on_error {
                    callback(&error);
                }
            }
            GuestMessage::CapabilityRequest {
                id,
                capability,
                details,
            } => match typed_request(id.clone(), capability, details) {
                Ok(request) => {
                    let broker = Arc::clone(&self.broker);
                    self.inflight.spawn(async move {
                        let outcome = broker.handle_request(&request).await;
                        (request.id, outcome)
                    });
                }
                Err(e) => self.respond(&id, Err(e.to_string())),
            },
        }
    }

    fn link_lost(&mut self) {
        self.link_open = false;
        error!(instance_id = %self.instance_id, "isolated context exited unexpectedly");
        self.set_state(GuestState::Errored);
        if let Some(callback) = &self.on_error {
            callback(&ErrorPayload {
                message: "Isolated context exited".to_string(),
                stack: None,
                phase: None,
            });
        }
    }

    fn respond(&self, id: &str, outcome: Result<Value, String>) {
        if !self.link_open {
            return;
        }
        let sent = encode(&HostMessage::response(id, outcome)).and_then(|frame| self.link.send(frame));
        match sent {
            Ok(()) => {}
            Err(IpcError::FrameTooLarge { size, limit }) => {
                warn!(instance_id = %self.instance_id, request_id = %id, size, limit, "capability response too large");
                self.send(&HostMessage::response(
                    id,
                    Err(format!("Response of {size} bytes exceeds frame limit of {limit} bytes")),
                ));
            }
            Err(e) => {
                warn!(instance_id = %self.instance_id, request_id = %id, error = %e, "failed to send capability response")
            }
        }
    }

    fn send(&self, message: &HostMessage) {
        if !self.link_open {
            return;
        }
        let sent = encode(message).and_then(|frame| self.link.send(frame));
        if let Err(e) = sent {
            warn!(instance_id = %self.instance_id, error = %e, "failed to send host frame");
        }
    }

    async fn shutdown(mut self) -> DestroyReport {
        let mut rejected_requests = self.inflight.len();
        self.inflight.abort_all();
        while self.inflight.join_next().await.is_some() {}

        // Requests the guest already sent but nobody picked up yet are
        // rejected on the guest side too.
        while let Some(Some(frame)) = self.link.recv().now_or_never() {
            let queued_request = match decode_guest(&frame) {
                Ok(message) => matches!(message, GuestMessage::CapabilityRequest { .. }),
                Err(_) => salvage_request_id(&frame).is_some(),
            };
            if queued_request {
                rejected_requests += 1;
            }
        }

        if let Err(e) = self.link.teardown().await {
            warn!(instance_id = %self.instance_id, error = %e, "teardown failed");
        }
        info!(instance_id = %self.instance_id, rejected_requests, "sandbox session destroyed");
        DestroyReport { rejected_requests }
    }
}
