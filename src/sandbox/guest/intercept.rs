use crate::sandbox::ipc::{encode, FrameSender, GuestMessage};
use crate::sandbox::permissions::{
    AccessOperation, CapabilityDetails, CapabilityRequest, ClipboardDetails, CookieDetails,
    NetworkDetails, StorageDetails, StorageOperation,
};
use crate::sandbox::security::ContentPolicy;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

type CallResult = Result<Value, CapabilityError>;

/// Outstanding capability calls of one guest, keyed by request id.
pub struct CallRegistry {
    link: FrameSender,
    pending: RefCell<HashMap<String, oneshot::Sender<CallResult>>>,
    timeout: Duration,
    destroyed: Cell<bool>,
}

impl CallRegistry {
    pub fn new(link: FrameSender, timeout: Duration) -> Self {
        Self {
            link,
            pending: RefCell::new(HashMap::new()),
            timeout,
            destroyed: Cell::new(false),
        }
    }

    /// Sends one capability request and suspends until its response arrives.
    pub async fn call(&self, details: CapabilityDetails) -> CallResult {
        if self.destroyed.get() {
            return Err(CapabilityError::ContextDestroyed);
        }

        let request = CapabilityRequest::new(details);
        let frame = encode(&GuestMessage::request(&request))
            .map_err(|e| CapabilityError::Channel(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(request.id.clone(), tx);

        if let Err(e) = self.link.send(frame) {
            self.pending.borrow_mut().remove(&request.id);
            return Err(CapabilityError::Channel(e.to_string()));
        }
        trace!(request_id = %request.id, capability = %request.capability(), "capability call sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CapabilityError::ContextDestroyed),
            Err(_) => {
                self.pending.borrow_mut().remove(&request.id);
                warn!(request_id = %request.id, "capability call timed out");
                Err(CapabilityError::Timeout(self.timeout))
            }
        }
    }

    /// Settles the call with `id`. Unknown ids are ignored.
    pub fn resolve(&self, id: &str, outcome: Result<Value, String>) -> bool {
        let Some(tx) = self.pending.borrow_mut().remove(id) else {
            debug!(request_id = id, "response for unknown request");
            return false;
        };
        tx.send(outcome.map_err(CapabilityError::Rejected)).is_ok()
    }

    /// Rejects every outstanding call and refuses new ones.
    pub fn destroy_all(&self) -> usize {
        self.destroyed.set(true);
        let drained: Vec<_> = self.pending.borrow_mut().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(CapabilityError::ContextDestroyed));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchInit {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl FetchInit {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Response headers with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders(BTreeMap<String, String>);

impl ResponseHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<'de> Deserialize<'de> for ResponseHeaders {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(Self(
            raw.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        ))
    }
}

/// What `fetch` resolves to inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: ResponseHeaders,
    #[serde(default)]
    body: String,
}

impl SandboxResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn bytes(&self) -> &[u8] {
        self.body.as_bytes()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, CapabilityError> {
        serde_json::from_str(&self.body)
            .map_err(|e| CapabilityError::InvalidResponse(format!("body is not JSON: {e}")))
    }
}

/// Uninhabited: the primitive cannot be constructed inside the sandbox.
#[derive(Debug)]
pub enum XmlHttpRequest {}

/// The host surface a component sees. Every side effect goes through the broker.
pub struct SandboxGlobals {
    calls: Rc<CallRegistry>,
    policy: ContentPolicy,
    cookie_cache: Rc<RefCell<String>>,
    cookie_refreshing: Rc<Cell<bool>>,
}

impl SandboxGlobals {
    pub fn new(calls: Rc<CallRegistry>, policy: ContentPolicy) -> Self {
        Self {
            calls,
            policy,
            cookie_cache: Rc::new(RefCell::new(String::new())),
            cookie_refreshing: Rc::new(Cell::new(false)),
        }
    }

    pub async fn fetch(&self, url: &str, init: FetchInit) -> Result<SandboxResponse, CapabilityError> {
        let details = CapabilityDetails::Network(NetworkDetails {
            url: url.to_string(),
            method: init.method,
            headers: init.headers,
            body: init.body,
        });
        let value = self.calls.call(details).await?;
        serde_json::from_value(value).map_err(|e| CapabilityError::InvalidResponse(e.to_string()))
    }

    pub fn local_storage(&self) -> LocalStorage<'_> {
        LocalStorage { calls: &self.calls }
    }

    pub fn clipboard(&self) -> Clipboard<'_> {
        Clipboard { calls: &self.calls }
    }

    /// Synchronous cookie read. Returns the cached value and starts a background
    /// refresh, so the first read in a fresh context is empty.
    pub fn document_cookie(&self) -> String {
        self.refresh_cookies();
        self.cookie_cache.borrow().clone()
    }

    /// Fire-and-forget cookie write followed by a cache refresh.
    pub fn set_document_cookie(&self, assignment: &str) {
        let calls = Rc::clone(&self.calls);
        let cache = Rc::clone(&self.cookie_cache);
        let assignment = assignment.to_string();
        tokio::task::spawn_local(async move {
            if let Err(e) = calls.call(cookie_write(assignment)).await {
                debug!(error = %e, "background cookie write failed");
                return;
            }
            if let Ok(value) = calls.call(cookie_read()).await {
                *cache.borrow_mut() = cookie_value(&value);
            }
        });
    }

    pub async fn cookie_get(&self) -> Result<String, CapabilityError> {
        let value = self.calls.call(cookie_read()).await?;
        let cookies = cookie_value(&value);
        *self.cookie_cache.borrow_mut() = cookies.clone();
        Ok(cookies)
    }

    pub async fn cookie_set(&self, assignment: &str) -> Result<(), CapabilityError> {
        self.calls.call(cookie_write(assignment.to_string())).await?;
        Ok(())
    }

    pub fn xml_http_request(&self) -> Result<XmlHttpRequest, CapabilityError> {
        Err(CapabilityError::UnsupportedPrimitive("XMLHttpRequest"))
    }

    pub fn send_beacon(&self, _url: &str, _data: &str) -> Result<bool, CapabilityError> {
        Err(CapabilityError::UnsupportedPrimitive("navigator.sendBeacon"))
    }

    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Source of an approved runtime bundle. Anything else is a policy violation.
    pub fn import_bundle(&self, url: &str) -> Result<String, CapabilityError> {
        self.policy
            .bundle(url)
            .map(|bundle| bundle.source.clone())
            .ok_or_else(|| {
                CapabilityError::PolicyViolation(format!("{url} is not an approved runtime bundle"))
            })
    }

    fn refresh_cookies(&self) {
        if self.cookie_refreshing.replace(true) {
            return;
        }
        let calls = Rc::clone(&self.calls);
        let cache = Rc::clone(&self.cookie_cache);
        let refreshing = Rc::clone(&self.cookie_refreshing);
        tokio::task::spawn_local(async move {
            match calls.call(cookie_read()).await {
                Ok(value) => *cache.borrow_mut() = cookie_value(&value),
                Err(e) => debug!(error = %e, "cookie refresh failed"),
            }
            refreshing.set(false);
        });
    }
}

fn cookie_read() -> CapabilityDetails {
    CapabilityDetails::Cookies(CookieDetails {
        operation: AccessOperation::Read,
        value: None,
    })
}

fn cookie_write(assignment: String) -> CapabilityDetails {
    CapabilityDetails::Cookies(CookieDetails {
        operation: AccessOperation::Write,
        value: Some(assignment),
    })
}

fn cookie_value(result: &Value) -> String {
    result
        .get("value")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub struct LocalStorage<'a> {
    calls: &'a CallRegistry,
}

impl LocalStorage<'_> {
    pub async fn get(&self, key: &str) -> Result<Option<String>, CapabilityError> {
        let value = self
            .calls
            .call(storage(StorageOperation::Get, Some(key), None))
            .await?;
        Ok(value.get("value").and_then(Value::as_str).map(str::to_string))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), CapabilityError> {
        self.calls
            .call(storage(StorageOperation::Set, Some(key), Some(value)))
            .await
            .map(drop)
    }

    pub async fn remove(&self, key: &str) -> Result<(), CapabilityError> {
        self.calls
            .call(storage(StorageOperation::Remove, Some(key), None))
            .await
            .map(drop)
    }

    pub async fn clear(&self) -> Result<(), CapabilityError> {
        self.calls
            .call(storage(StorageOperation::Clear, None, None))
            .await
            .map(drop)
    }
}

fn storage(operation: StorageOperation, key: Option<&str>, value: Option<&str>) -> CapabilityDetails {
    CapabilityDetails::KeyValueStorage(StorageDetails {
        operation,
        key: key.map(str::to_string),
        value: value.map(str::to_string),
    })
}

pub struct Clipboard<'a> {
    calls: &'a CallRegistry,
}

impl Clipboard<'_> {
    pub async fn read_text(&self) -> Result<String, CapabilityError> {
        let value = self
            .calls
            .call(CapabilityDetails::Clipboard(ClipboardDetails {
                operation: AccessOperation::Read,
                text: None,
            }))
            .await?;
        Ok(value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn write_text(&self, text: &str) -> Result<(), CapabilityError> {
        self.calls
            .call(CapabilityDetails::Clipboard(ClipboardDetails {
                operation: AccessOperation::Write,
                text: Some(text.to_string()),
            }))
            .await
            .map(drop)
    }
}

/// Failure of a trapped primitive as seen by component code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("{0}")]
    Rejected(String),
    #[error("Sandbox context destroyed")]
    ContextDestroyed,
    #[error("Capability request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0} is not available in the sandbox")]
    UnsupportedPrimitive(&'static str),
    #[error("Policy violation: {0}")]
    PolicyViolation(String),
    #[error("Invalid capability response: {0}")]
    InvalidResponse(String),
    #[error("Channel error: {0}")]
    Channel(String),
}
