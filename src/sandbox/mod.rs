pub mod broker;
pub mod guest;
pub mod ipc;
pub mod permissions;
pub mod process;
pub mod security;
pub mod session;

use crate::editing::EditConfig;
use futures::future::join_all;
use broker::{BrokerError, HostFacilities, PermissionPrompter};
use guest::GuestState;
use permissions::PermissionRule;
use process::IsolationBackend;
use security::ContentPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use session::{DestroyReport, SandboxSession, SessionOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub type SessionId = u32;

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub max_frame_bytes: usize,
    /// How long teardown waits for the guest to exit before giving up on it.
    pub teardown_grace_ms: u64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: ipc::DEFAULT_MAX_FRAME_BYTES,
            teardown_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub prompt_timeout_ms: u64,
    pub network_timeout_ms: u64,
    pub user_agent: String,
    pub audit_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            prompt_timeout_ms: 120_000,
            network_timeout_ms: 30_000,
            user_agent: concat!("component-sandbox/", env!("CARGO_PKG_VERSION")).to_string(),
            audit_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    pub call_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_frame_bytes: usize,
    pub policy: ContentPolicy,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 120_000,
            shutdown_grace_ms: 500,
            max_frame_bytes: ipc::DEFAULT_MAX_FRAME_BYTES,
            policy: ContentPolicy::locked_down(),
        }
    }
}

/// Environment variable carrying the guest config into a child-process guest.
pub const GUEST_CONFIG_ENV: &str = "COMPONENT_SANDBOX_GUEST_CONFIG";

impl GuestConfig {
    /// Single-line JSON form handed to a child guest.
    pub fn to_env_value(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_env_value(value: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(value)?;
        if config.call_timeout_ms == 0 || config.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "guest call_timeout_ms and max_frame_bytes must be positive".into(),
            ));
        }
        config
            .policy
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    /// Reads the config the isolation host passed down. A guest started any
    /// other way has no policy to run under and is refused.
    pub fn from_env() -> Result<Self, ConfigError> {
        let value = std::env::var(GUEST_CONFIG_ENV).map_err(|_| {
            ConfigError::Invalid(format!("{GUEST_CONFIG_ENV} is not set by the isolation host"))
        })?;
        Self::from_env_value(&value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_sessions: usize,
    pub isolation: IsolationConfig,
    pub broker: BrokerConfig,
    pub guest: GuestConfig,
    pub edit: EditConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            isolation: IsolationConfig::default(),
            broker: BrokerConfig::default(),
            guest: GuestConfig::default(),
            edit: EditConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be at least 1".into()));
        }
        if self.isolation.max_frame_bytes == 0 || self.guest.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be positive".into()));
        }
        let timeouts = [
            ("broker.prompt_timeout_ms", self.broker.prompt_timeout_ms),
            ("broker.network_timeout_ms", self.broker.network_timeout_ms),
            ("guest.call_timeout_ms", self.guest.call_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        self.guest
            .policy
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Owns every live sandbox session in the process.
pub struct SandboxManager {
    sessions: Arc<RwLock<HashMap<SessionId, SandboxSession>>>,
    config: SandboxConfig,
    facilities: HostFacilities,
}

impl SandboxManager {
    pub fn new() -> Result<Self, SandboxError> {
        Self::with_config(SandboxConfig::default())
    }

    pub fn with_config(config: SandboxConfig) -> Result<Self, SandboxError> {
        config.validate()?;
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
            facilities: HostFacilities::default(),
        })
    }

    /// Replaces the storage and clipboard every new session executes against.
    pub fn with_facilities(mut self, facilities: HostFacilities) -> Self {
        self.facilities = facilities;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub async fn create_session(
        &self,
        backend: IsolationBackend,
        options: SessionOptions,
        prompter: Arc<dyn PermissionPrompter>,
    ) -> Result<SessionId, SandboxError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.max_sessions {
            return Err(SandboxError::ResourceExhausted(
                "Maximum session count reached".into(),
            ));
        }

        let session_id = Self::generate_session_id();
        let instance_id = format!("sandbox-{session_id}");
        let session = SandboxSession::start(
            &instance_id,
            backend,
            options,
            prompter,
            &self.facilities,
            &self.config,
        )?;
        sessions.insert(session_id, session);

        info!("Created sandbox session: {}", session_id);
        Ok(session_id)
    }

    pub async fn render(&self, session_id: SessionId, code: &str) -> Result<(), SandboxError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session_id)
            .ok_or(SandboxError::SessionNotFound(session_id))?
            .render(code)
    }

    pub async fn update_props(&self, session_id: SessionId, props: Value) -> Result<(), SandboxError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session_id)
            .ok_or(SandboxError::SessionNotFound(session_id))?
            .update_props(props)
    }

    pub async fn session_state(&self, session_id: SessionId) -> Result<GuestState, SandboxError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session_id)
            .map(SandboxSession::state)
            .ok_or(SandboxError::SessionNotFound(session_id))
    }

    pub async fn session_rules(&self, session_id: SessionId) -> Result<Vec<PermissionRule>, SandboxError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session_id)
            .map(SandboxSession::rules)
            .ok_or(SandboxError::SessionNotFound(session_id))
    }

    pub async fn terminate_session(&self, session_id: SessionId) -> Result<DestroyReport, SandboxError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(&session_id)
                .ok_or(SandboxError::SessionNotFound(session_id))?
        };

        let report = session.destroy().await?;
        info!(
            "Terminated sandbox session {} ({} requests rejected)",
            session_id, report.rejected_requests
        );
        Ok(report)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn force_cleanup(&self) {
        let session_ids: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions.keys().copied().collect()
        };

        let results = join_all(
            session_ids
                .iter()
                .map(|session_id| self.terminate_session(*session_id)),
        )
        .await;
        for (session_id, result) in session_ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to cleanup session {}: {}", session_id, e);
            }
        }
    }

    fn generate_session_id() -> SessionId {
        NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Isolation error: {0}")]
    Process(#[from] process::ProcessError),

    #[error("IPC error: {0}")]
    Ipc(#[from] ipc::IpcError),

    #[error("Content policy error: {0}")]
    Policy(#[from] security::PolicyError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session closed")]
    SessionClosed,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}
