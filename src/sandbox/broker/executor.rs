use crate::sandbox::permissions::{
    cookie_name, AccessOperation, CapabilityDetails, ClipboardDetails, CookieDetails,
    NetworkDetails, StorageDetails, StorageOperation,
};
use crate::sandbox::BrokerConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

/// Characters escaped in the instance id so no namespace is a prefix of another.
const NAMESPACE_ESCAPES: &AsciiSet = &CONTROLS.add(b':').add(b'%');

/// Storage key prefix for one instance: `sandbox:<instance>:`.
pub fn storage_namespace(instance_id: &str) -> String {
    format!("sandbox:{}:", utf8_percent_encode(instance_id, NAMESPACE_ESCAPES))
}

/// Host-level key/value store shared by every broker in the process.
pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
    /// Removes every key starting with `prefix` and returns how many went.
    fn remove_prefix(&self, prefix: &str) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, String>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueBackend for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn remove_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
pub trait ClipboardProvider: Send + Sync {
    async fn read_text(&self) -> Result<String, ExecutionError>;
    async fn write_text(&self, text: &str) -> Result<(), ExecutionError>;
}

/// Process-local clipboard. Used when no system clipboard is wired up.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    contents: RwLock<String>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            contents: RwLock::new(text.into()),
        }
    }
}

#[async_trait]
impl ClipboardProvider for MemoryClipboard {
    async fn read_text(&self) -> Result<String, ExecutionError> {
        Ok(self.contents.read().clone())
    }

    async fn write_text(&self, text: &str) -> Result<(), ExecutionError> {
        *self.contents.write() = text.to_string();
        Ok(())
    }
}

/// Clipboard backed by platform commands such as `pbpaste`/`pbcopy`.
#[derive(Debug, Clone)]
pub struct CommandClipboard {
    read_command: Vec<String>,
    write_command: Vec<String>,
}

impl CommandClipboard {
    pub fn new(read_command: Vec<String>, write_command: Vec<String>) -> Self {
        Self {
            read_command,
            write_command,
        }
    }

    pub fn detect() -> Self {
        fn argv(parts: &[&str]) -> Vec<String> {
            parts.iter().map(|p| p.to_string()).collect()
        }

        if cfg!(target_os = "macos") {
            Self::new(argv(&["pbpaste"]), argv(&["pbcopy"]))
        } else if cfg!(target_os = "windows") {
            Self::new(
                argv(&["powershell", "-NoProfile", "-Command", "Get-Clipboard"]),
                argv(&["clip"]),
            )
        } else if std::env::var_os("WAYLAND_DISPLAY").is_some() {
            Self::new(argv(&["wl-paste", "--no-newline"]), argv(&["wl-copy"]))
        } else {
            Self::new(
                argv(&["xclip", "-selection", "clipboard", "-o"]),
                argv(&["xclip", "-selection", "clipboard"]),
            )
        }
    }

    fn command(argv: &[String]) -> Result<Command, ExecutionError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecutionError::Clipboard("clipboard command not configured".into()))?;
        let mut command = Command::new(program);
        command.args(args).stderr(Stdio::null()).kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl ClipboardProvider for CommandClipboard {
    async fn read_text(&self) -> Result<String, ExecutionError> {
        let output = Self::command(&self.read_command)?
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExecutionError::Clipboard(e.to_string()))?;

        if !output.status.success() {
            return Err(ExecutionError::Clipboard(format!(
                "{} exited with {}",
                self.read_command.join(" "),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn write_text(&self, text: &str) -> Result<(), ExecutionError> {
        let mut child = Self::command(&self.write_command)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| ExecutionError::Clipboard(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| ExecutionError::Clipboard(e.to_string()))?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExecutionError::Clipboard(e.to_string()))?;
        if !status.success() {
            return Err(ExecutionError::Clipboard(format!(
                "{} exited with {}",
                self.write_command.join(" "),
                status
            )));
        }
        Ok(())
    }
}

/// Cookie assignments keyed by name, in first-insertion order.
#[derive(Debug, Default)]
pub struct CookieJar {
    entries: Mutex<Vec<(String, String)>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the raw assignment, replacing any earlier one with the same name.
    pub fn write(&self, assignment: &str) {
        let assignment = assignment.trim();
        let Some(name) = cookie_name(assignment) else {
            return;
        };

        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = assignment.to_string(),
            None => entries.push((name, assignment.to_string())),
        }
    }

    pub fn read(&self) -> String {
        self.entries
            .lock()
            .iter()
            .map(|(_, assignment)| assignment.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Host resources brokers execute against. Cloning shares the underlying stores.
#[derive(Clone)]
pub struct HostFacilities {
    pub storage: Arc<dyn KeyValueBackend>,
    pub clipboard: Arc<dyn ClipboardProvider>,
}

impl Default for HostFacilities {
    fn default() -> Self {
        Self {
            storage: Arc::new(MemoryKeyValueStore::new()),
            clipboard: Arc::new(MemoryClipboard::new()),
        }
    }
}

/// Performs approved capability requests with real host facilities.
pub struct CapabilityExecutor {
    client: Client,
    network_timeout: Duration,
    storage: Arc<dyn KeyValueBackend>,
    namespace: String,
    clipboard: Arc<dyn ClipboardProvider>,
    cookies: CookieJar,
}

impl CapabilityExecutor {
    pub fn new(
        instance_id: &str,
        facilities: &HostFacilities,
        config: &BrokerConfig,
    ) -> Result<Self, ExecutionError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| ExecutionError::Network(e.to_string()))?;

        Ok(Self {
            client,
            network_timeout: Duration::from_millis(config.network_timeout_ms),
            storage: Arc::clone(&facilities.storage),
            namespace: storage_namespace(instance_id),
            clipboard: Arc::clone(&facilities.clipboard),
            cookies: CookieJar::new(),
        })
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn execute(&self, details: &CapabilityDetails) -> Result<Value, ExecutionError> {
        match details {
            CapabilityDetails::Network(d) => self.execute_network(d).await,
            CapabilityDetails::KeyValueStorage(d) => Ok(self.execute_storage(d)),
            CapabilityDetails::Clipboard(d) => self.execute_clipboard(d).await,
            CapabilityDetails::Cookies(d) => Ok(self.execute_cookies(d)),
        }
    }

    async fn execute_network(&self, details: &NetworkDetails) -> Result<Value, ExecutionError> {
        let url = Url::parse(&details.url)
            .map_err(|e| ExecutionError::InvalidRequest(format!("invalid url {}: {e}", details.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExecutionError::UnsupportedScheme(url.scheme().to_string()));
        }

        let method = reqwest::Method::from_bytes(details.method().as_bytes())
            .map_err(|_| ExecutionError::InvalidRequest(format!("invalid method {}", details.method())))?;

        let mut request = self.client.request(method, url);
        for (name, value) in &details.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &details.body {
            request = request.body(body.clone());
        }

        debug!(url = %details.url, "executing network request");
        let response = timeout(self.network_timeout, request.send())
            .await
            .map_err(|_| ExecutionError::Timeout(self.network_timeout))?
            .map_err(|e| ExecutionError::Network(e.to_string()))?;

        let status = response.status();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            let name = name.as_str().to_ascii_lowercase();
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            match headers.get_mut(&name) {
                Some(Value::String(existing)) => {
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
                _ => {
                    headers.insert(name, Value::String(value));
                }
            }
        }

        let body = timeout(self.network_timeout, response.text())
            .await
            .map_err(|_| ExecutionError::Timeout(self.network_timeout))?
            .map_err(|e| ExecutionError::Network(e.to_string()))?;

        Ok(json!({
            "status": status.as_u16(),
            "statusText": status.canonical_reason().unwrap_or(""),
            "headers": headers,
            "body": body,
        }))
    }

    fn execute_storage(&self, details: &StorageDetails) -> Value {
        let key = format!("{}{}", self.namespace, details.key.as_deref().unwrap_or(""));
        match details.operation {
            StorageOperation::Get => json!({ "value": self.storage.get(&key) }),
            StorageOperation::Set => {
                self.storage
                    .set(&key, details.value.clone().unwrap_or_default());
                json!({ "success": true })
            }
            StorageOperation::Remove => {
                self.storage.remove(&key);
                json!({ "success": true })
            }
            StorageOperation::Clear => {
                let removed = self.storage.remove_prefix(&self.namespace);
                debug!(namespace = %self.namespace, removed, "cleared sandbox storage");
                json!({ "success": true })
            }
        }
    }

    async fn execute_clipboard(&self, details: &ClipboardDetails) -> Result<Value, ExecutionError> {
        match details.operation {
            AccessOperation::Read => {
                let text = self.clipboard.read_text().await?;
                Ok(json!({ "text": text }))
            }
            AccessOperation::Write => {
                self.clipboard
                    .write_text(details.text.as_deref().unwrap_or(""))
                    .await?;
                Ok(json!({ "success": true }))
            }
        }
    }

    fn execute_cookies(&self, details: &CookieDetails) -> Value {
        match details.operation {
            AccessOperation::Read => json!({ "value": self.cookies.read() }),
            AccessOperation::Write => {
                self.cookies.write(details.value.as_deref().unwrap_or(""));
                json!({ "success": true })
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Clipboard error: {0}")]
    Clipboard(String),
}
