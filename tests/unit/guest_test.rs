use async_trait::async_trait;
use component_sandbox::sandbox::guest::{
    CallRegistry, CapabilityError, Component, ComponentCompiler, ComponentError, FetchInit,
    GuestRuntime, SandboxGlobals,
};
use component_sandbox::sandbox::ipc::{
    decode_guest, encode, ChannelEndpoint, GuestMessage, HostMessage, IpcChannel,
    DEFAULT_MAX_FRAME_BYTES,
};
use component_sandbox::sandbox::permissions::Capability;
use component_sandbox::sandbox::security::ContentPolicy;
use component_sandbox::sandbox::GuestConfig;
use futures::FutureExt;
use serde_json::{json, Value};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{spawn_local, LocalSet};

fn guest(timeout: Duration) -> (ChannelEndpoint, Rc<CallRegistry>, Rc<SandboxGlobals>) {
    let (host, guest) = IpcChannel::pair(DEFAULT_MAX_FRAME_BYTES);
    let calls = Rc::new(CallRegistry::new(guest.sender(), timeout));
    let globals = Rc::new(SandboxGlobals::new(Rc::clone(&calls), ContentPolicy::locked_down()));
    (host, calls, globals)
}

/// Next capability request the guest sent, as `(id, capability, details)`.
async fn next_request(host: &mut ChannelEndpoint) -> (String, Capability, Value) {
    let frame = host.recv().await.unwrap();
    match decode_guest(&frame).unwrap() {
        GuestMessage::CapabilityRequest {
            id,
            capability,
            details,
        } => (id, capability, details),
        other => panic!("expected a capability request, got {other:?}"),
    }
}

async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_first_cookie_read_is_empty() {
    LocalSet::new()
        .run_until(async {
            let (mut host, calls, globals) = guest(Duration::from_secs(30));

            assert_eq!(globals.document_cookie(), "");
            let (id, capability, details) = next_request(&mut host).await;
            assert_eq!(capability, Capability::Cookies);
            assert_eq!(details, json!({"operation": "read"}));

            assert!(calls.resolve(&id, Ok(json!({"value": "a=1"}))));
            settle().await;
            assert_eq!(globals.document_cookie(), "a=1");
        })
        .await;
}

#[tokio::test]
async fn test_cookie_write_refreshes_cache() {
    LocalSet::new()
        .run_until(async {
            let (mut host, calls, globals) = guest(Duration::from_secs(30));

            globals.set_document_cookie("session=abc; path=/");
            let (id, _, details) = next_request(&mut host).await;
            assert_eq!(details, json!({"operation": "write", "value": "session=abc; path=/"}));
            calls.resolve(&id, Ok(json!({"success": true})));

            let (id, _, details) = next_request(&mut host).await;
            assert_eq!(details, json!({"operation": "read"}));
            calls.resolve(&id, Ok(json!({"value": "session=abc; path=/"})));
            settle().await;

            assert!(globals.document_cookie().contains("session=abc"));
        })
        .await;
}

#[tokio::test]
async fn test_disabled_primitives_fail_synchronously() {
    let (_host, _calls, globals) = guest(Duration::from_secs(30));

    assert_eq!(
        globals.xml_http_request().unwrap_err(),
        CapabilityError::UnsupportedPrimitive("XMLHttpRequest")
    );
    let err = globals.send_beacon("https://x.test/beacon", "{}").unwrap_err();
    assert_eq!(err.to_string(), "navigator.sendBeacon is not available in the sandbox");

    assert!(matches!(
        globals.import_bundle("https://cdn.test/react.js"),
        Err(CapabilityError::PolicyViolation(_))
    ));
}

#[tokio::test]
async fn test_approved_bundle_is_served_from_policy() {
    let (_host, guest) = IpcChannel::pair(DEFAULT_MAX_FRAME_BYTES);
    let calls = Rc::new(CallRegistry::new(guest.sender(), Duration::from_secs(1)));
    let policy = ContentPolicy::locked_down().with_bundle("https://cdn.test/react.js", "export default 1;");
    let globals = SandboxGlobals::new(calls, policy);

    assert_eq!(
        globals.import_bundle("https://cdn.test/react.js").unwrap(),
        "export default 1;"
    );
}

#[tokio::test]
async fn test_fetch_resolves_to_response() {
    LocalSet::new()
        .run_until(async {
            let (mut host, calls, globals) = guest(Duration::from_secs(30));

            let pending = {
                let globals = Rc::clone(&globals);
                spawn_local(async move {
                    globals
                        .fetch(
                            "https://api.test/items",
                            FetchInit::default().method("post").body("{\"name\":\"x\"}"),
                        )
                        .await
                })
            };

            let (id, capability, details) = next_request(&mut host).await;
            assert_eq!(capability, Capability::Network);
            assert_eq!(details["url"], "https://api.test/items");
            assert_eq!(details["method"], "post");
            calls.resolve(
                &id,
                Ok(json!({
                    "status": 201,
                    "statusText": "Created",
                    "headers": {"Content-Type": "application/json"},
                    "body": "{\"ok\":true}"
                })),
            );

            let response = pending.await.unwrap().unwrap();
            assert!(response.ok());
            assert_eq!(response.status_text, "Created");
            assert_eq!(response.headers.get("content-type"), Some("application/json"));
            assert_eq!(response.json::<Value>().unwrap(), json!({"ok": true}));
        })
        .await;
}

#[tokio::test]
async fn test_broker_error_rejects_the_call() {
    LocalSet::new()
        .run_until(async {
            let (mut host, calls, globals) = guest(Duration::from_secs(30));

            let pending = {
                let globals = Rc::clone(&globals);
                spawn_local(async move { globals.local_storage().set("demo", "v1").await })
            };
            let (id, capability, _) = next_request(&mut host).await;
            assert_eq!(capability, Capability::KeyValueStorage);
            calls.resolve(&id, Err("Permission denied by user.".into()));

            let err = pending.await.unwrap().unwrap_err();
            assert_eq!(err.to_string(), "Permission denied by user.");
            assert_eq!(calls.pending_count(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_destroy_rejects_pending_calls() {
    LocalSet::new()
        .run_until(async {
            let (mut host, calls, globals) = guest(Duration::from_secs(30));

            let waiting: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|key| {
                    let globals = Rc::clone(&globals);
                    spawn_local(async move { globals.local_storage().get(key).await })
                })
                .collect();
            next_request(&mut host).await;
            next_request(&mut host).await;
            assert_eq!(calls.pending_count(), 2);

            assert_eq!(calls.destroy_all(), 2);
            for task in waiting {
                assert_eq!(task.await.unwrap(), Err(CapabilityError::ContextDestroyed));
            }

            // Late responses are ignored and new calls fail without a frame.
            assert!(!calls.resolve("a", Ok(Value::Null)));
            assert_eq!(
                globals.clipboard().read_text().await,
                Err(CapabilityError::ContextDestroyed)
            );
            assert!(host.recv().now_or_never().is_none());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    LocalSet::new()
        .run_until(async {
            let (_host, calls, globals) = guest(Duration::from_secs(2));

            let err = globals.clipboard().write_text("copied").await.unwrap_err();
            assert_eq!(err, CapabilityError::Timeout(Duration::from_secs(2)));
            assert_eq!(calls.pending_count(), 0);
        })
        .await;
}

struct Echo;

#[async_trait(?Send)]
impl Component for Echo {
    async fn mount(&mut self, props: &Value, globals: &SandboxGlobals) -> Result<(), ComponentError> {
        if props["store"].as_bool() == Some(true) {
            globals.local_storage().set("last", "mounted").await?;
        }
        Ok(())
    }

    async fn update(&mut self, _props: &Value, _globals: &SandboxGlobals) -> Result<(), ComponentError> {
        Err(ComponentError::runtime("updates unsupported"))
    }
}

struct EchoCompiler;

impl ComponentCompiler for EchoCompiler {
    fn compile(&self, source: &str) -> Result<Box<dyn Component>, ComponentError> {
        match source {
            "echo" => Ok(Box::new(Echo)),
            other => Err(ComponentError::compile(format!("unknown component {other}"))),
        }
    }
}

fn host_frame(message: &HostMessage) -> String {
    encode(message).unwrap()
}

#[tokio::test]
async fn test_guest_runtime_drives_render_cycle() {
    LocalSet::new()
        .run_until(async {
            let (mut host, guest) = IpcChannel::pair(DEFAULT_MAX_FRAME_BYTES);
            let runtime = spawn_local(GuestRuntime::run(
                Arc::new(EchoCompiler),
                GuestConfig::default(),
                guest,
            ));

            let frame = host.recv().await.unwrap();
            assert_eq!(decode_guest(&frame).unwrap(), GuestMessage::Ready);

            host.send(host_frame(&HostMessage::Render {
                code: "missing".into(),
                props: Value::Null,
            }))
            .unwrap();
            match decode_guest(&host.recv().await.unwrap()).unwrap() {
                GuestMessage::Error { error } => {
                    assert_eq!(error.message, "unknown component missing");
                }
                other => panic!("unexpected frame {other:?}"),
            }

            host.send(host_frame(&HostMessage::Render {
                code: "echo".into(),
                props: json!({"store": true}),
            }))
            .unwrap();
            let (id, capability, details) = next_request(&mut host).await;
            assert_eq!(capability, Capability::KeyValueStorage);
            assert_eq!(details, json!({"operation": "set", "key": "last", "value": "mounted"}));

            host.send(host_frame(&HostMessage::response(id, Ok(json!({"success": true})))))
                .unwrap();
            assert_eq!(
                decode_guest(&host.recv().await.unwrap()).unwrap(),
                GuestMessage::Rendered
            );

            host.send(host_frame(&HostMessage::UpdateProps { props: json!({}) }))
                .unwrap();
            match decode_guest(&host.recv().await.unwrap()).unwrap() {
                GuestMessage::Error { error } => assert_eq!(error.message, "updates unsupported"),
                other => panic!("unexpected frame {other:?}"),
            }

            drop(host);
            tokio::time::timeout(Duration::from_secs(5), runtime)
                .await
                .unwrap()
                .unwrap();
        })
        .await;
}
