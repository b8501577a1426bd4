use component_sandbox::sandbox::broker::{
    BrokerError, CapabilityBroker, ChannelPrompter, HostFacilities, PermissionPrompter,
    StaticPrompter,
};
use component_sandbox::sandbox::permissions::{
    AccessOperation, AuditOutcome, Capability, CapabilityDetails, CapabilityRequest, CookieDetails,
    NetworkDetails, PermissionDecision, PermissionRule, RuleStore, StorageDetails,
    StorageOperation,
};
use component_sandbox::sandbox::BrokerConfig;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn broker_with(
    instance_id: &str,
    enabled: &[Capability],
    rules: Vec<PermissionRule>,
    prompter: Arc<dyn PermissionPrompter>,
    facilities: &HostFacilities,
) -> Arc<CapabilityBroker> {
    Arc::new(
        CapabilityBroker::new(
            instance_id,
            enabled.iter().copied(),
            Arc::new(RuleStore::with_rules(rules)),
            prompter,
            facilities,
            &BrokerConfig::default(),
        )
        .unwrap(),
    )
}

fn get(url: impl Into<String>) -> CapabilityRequest {
    CapabilityRequest::new(CapabilityDetails::Network(NetworkDetails::get(url)))
}

fn storage(operation: StorageOperation, key: &str, value: Option<&str>) -> CapabilityRequest {
    CapabilityRequest::new(CapabilityDetails::KeyValueStorage(StorageDetails {
        operation,
        key: Some(key.to_string()),
        value: value.map(str::to_string),
    }))
}

fn cookie(operation: AccessOperation, value: Option<&str>) -> CapabilityRequest {
    CapabilityRequest::new(CapabilityDetails::Cookies(CookieDetails {
        operation,
        value: value.map(str::to_string),
    }))
}

async fn mock_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-sandbox", "yes")
                .set_body_string("hello"),
        )
        .mount(&server)
        .await;
    server
}

fn host_pattern(server: &MockServer, path: &str) -> String {
    format!("127.0.0.1:{}{path}", server.address().port())
}

#[tokio::test]
async fn test_allow_once_prompts_every_time() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .expect(1)
        .mount(&server)
        .await;

    let (prompter, mut prompts) = ChannelPrompter::new();
    let broker = broker_with(
        "a",
        &[Capability::Network],
        Vec::new(),
        Arc::new(prompter),
        &HostFacilities::default(),
    );
    let url = format!("{}/a", server.uri());

    let first = {
        let broker = Arc::clone(&broker);
        let request = get(url.clone());
        tokio::spawn(async move { broker.handle_request(&request).await })
    };
    let prompt = prompts.recv().await.unwrap();
    assert_eq!(prompt.capability, Capability::Network);
    assert_eq!(prompt.summary, format!("GET {url}"));
    assert_eq!(prompt.pattern, host_pattern(&server, "/a"));
    assert!(prompt.decide(PermissionDecision::AllowOnce));

    let response = first.await.unwrap().unwrap();
    assert_eq!(response["status"], 200);
    assert_eq!(response["statusText"], "OK");
    assert_eq!(response["body"], "hello");
    assert!(broker.rules().is_empty());

    // Same request again: no rule was stored, so the user is asked again.
    let second = {
        let broker = Arc::clone(&broker);
        let request = get(url.clone());
        tokio::spawn(async move { broker.handle_request(&request).await })
    };
    let prompt = prompts.recv().await.unwrap();
    assert_eq!(prompt.summary, format!("GET {url}"));
    prompt.decide(PermissionDecision::DenyOnce);

    assert_eq!(second.await.unwrap(), Err(BrokerError::DeniedByUser));
    assert_eq!(broker.auditor().metrics().prompts_shown, 2);
}

#[tokio::test]
async fn test_allow_always_stores_rule_and_skips_later_prompts() {
    let server = mock_server().await;
    let (prompter, mut prompts) = ChannelPrompter::new();
    let broker = broker_with(
        "b",
        &[Capability::Network],
        Vec::new(),
        Arc::new(prompter),
        &HostFacilities::default(),
    );
    let url = format!("{}/a", server.uri());

    let first = {
        let broker = Arc::clone(&broker);
        let request = get(url.clone());
        tokio::spawn(async move { broker.handle_request(&request).await })
    };
    prompts
        .recv()
        .await
        .unwrap()
        .decide(PermissionDecision::AllowAlways);
    let response = first.await.unwrap().unwrap();
    assert_eq!(response["headers"]["x-sandbox"], "yes");

    assert_eq!(
        broker.rules().snapshot(),
        vec![PermissionRule::allow(Capability::Network, host_pattern(&server, "/a"))]
    );

    for _ in 0..3 {
        let response = broker.handle_request(&get(url.clone())).await.unwrap();
        assert_eq!(response["body"], "hello");
    }
    assert!(prompts.try_recv().is_err());

    let metrics = broker.auditor().metrics();
    assert_eq!(metrics.prompts_shown, 1);
    assert_eq!(metrics.total_events, 4);
    let outcomes: Vec<AuditOutcome> = broker
        .auditor()
        .recent(4)
        .into_iter()
        .map(|event| event.outcome)
        .collect();
    assert_eq!(outcomes.iter().filter(|o| **o == AuditOutcome::AllowedByRule).count(), 3);
}

#[tokio::test]
async fn test_rule_prefix_match_runs_without_prompt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&server)
        .await;

    let (prompter, mut prompts) = ChannelPrompter::new();
    let broker = broker_with(
        "rules",
        &[Capability::Network],
        vec![PermissionRule::allow(
            Capability::Network,
            host_pattern(&server, "/api/*"),
        )],
        Arc::new(prompter),
        &HostFacilities::default(),
    );

    let response = broker
        .handle_request(&get(format!("{}/api/users", server.uri())))
        .await
        .unwrap();
    assert_eq!(serde_json::from_str::<Value>(response["body"].as_str().unwrap()).unwrap(), json!([{"id": 1}]));
    assert!(prompts.try_recv().is_err());

    // A different host is not covered by the rule.
    let other = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.handle_request(&get("https://other.com/x")).await })
    };
    let prompt = prompts.recv().await.unwrap();
    assert_eq!(prompt.pattern, "other.com/x");
    drop(prompt);
    assert_eq!(other.await.unwrap(), Err(BrokerError::DeniedByUser));
}

#[test]
fn test_rule_patterns_match_by_host_and_path() {
    let rules = RuleStore::with_rules([PermissionRule::allow(Capability::Network, "api.example.com/*")]);

    let users = CapabilityDetails::Network(NetworkDetails::get("https://api.example.com/users"));
    let other = CapabilityDetails::Network(NetworkDetails::get("https://other.com/x"));
    assert_eq!(users.pattern(), "api.example.com/users");
    assert!(rules.find_match(Capability::Network, &users.pattern()).is_some());
    assert!(rules.find_match(Capability::Network, &other.pattern()).is_none());
    assert!(rules.find_match(Capability::Cookies, &users.pattern()).is_none());
}

#[tokio::test]
async fn test_deny_decisions_fail_the_call() {
    let facilities = HostFacilities::default();

    let deny_once = broker_with(
        "deny-once",
        &[Capability::Cookies],
        Vec::new(),
        Arc::new(StaticPrompter(PermissionDecision::DenyOnce)),
        &facilities,
    );
    let err = deny_once
        .handle_request(&cookie(AccessOperation::Write, Some("a=1")))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Permission denied by user.");
    assert!(deny_once.rules().is_empty());
    assert!(deny_once.executor().cookies().is_empty());

    let (prompter, mut prompts) = ChannelPrompter::new();
    let deny_always = broker_with(
        "deny-always",
        &[Capability::Cookies],
        Vec::new(),
        Arc::new(prompter),
        &facilities,
    );
    let first = {
        let broker = Arc::clone(&deny_always);
        tokio::spawn(async move {
            broker
                .handle_request(&cookie(AccessOperation::Write, Some("a=1")))
                .await
        })
    };
    prompts
        .recv()
        .await
        .unwrap()
        .decide(PermissionDecision::DenyAlways);
    assert_eq!(first.await.unwrap(), Err(BrokerError::DeniedByUser));
    assert_eq!(
        deny_always.rules().snapshot(),
        vec![PermissionRule::deny(Capability::Cookies, "a")]
    );

    let err = deny_always
        .handle_request(&cookie(AccessOperation::Write, Some("a=2; path=/")))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Denied by permission rule: cookies → a");
    assert!(prompts.try_recv().is_err());
    assert!(deny_always.executor().cookies().is_empty());
    assert_eq!(deny_always.auditor().metrics().denials, 2);
}

#[tokio::test]
async fn test_storage_is_isolated_per_instance() {
    let facilities = HostFacilities::default();
    let allow: Arc<dyn PermissionPrompter> = Arc::new(StaticPrompter(PermissionDecision::AllowOnce));
    let first = broker_with("first", &[Capability::KeyValueStorage], Vec::new(), Arc::clone(&allow), &facilities);
    let second = broker_with("second", &[Capability::KeyValueStorage], Vec::new(), allow, &facilities);

    let set = first
        .handle_request(&storage(StorageOperation::Set, "demo", Some("v1")))
        .await
        .unwrap();
    assert_eq!(set, json!({"success": true}));

    let value = first
        .handle_request(&storage(StorageOperation::Get, "demo", None))
        .await
        .unwrap();
    assert_eq!(value, json!({"value": "v1"}));

    let value = second
        .handle_request(&storage(StorageOperation::Get, "demo", None))
        .await
        .unwrap();
    assert_eq!(value, json!({"value": null}));

    second
        .handle_request(&storage(StorageOperation::Set, "demo", Some("v2")))
        .await
        .unwrap();
    second
        .handle_request(&CapabilityRequest::new(CapabilityDetails::KeyValueStorage(StorageDetails {
            operation: StorageOperation::Clear,
            key: None,
            value: None,
        })))
        .await
        .unwrap();

    let value = first
        .handle_request(&storage(StorageOperation::Get, "demo", None))
        .await
        .unwrap();
    assert_eq!(value, json!({"value": "v1"}));
}

#[tokio::test]
async fn test_cookie_write_then_read() {
    let broker = broker_with(
        "cookies",
        &[Capability::Cookies],
        Vec::new(),
        Arc::new(StaticPrompter(PermissionDecision::AllowOnce)),
        &HostFacilities::default(),
    );

    broker
        .handle_request(&cookie(AccessOperation::Write, Some("session=abc; path=/")))
        .await
        .unwrap();
    let read = broker
        .handle_request(&cookie(AccessOperation::Read, None))
        .await
        .unwrap();
    assert!(read["value"].as_str().unwrap().contains("session=abc"));
}

#[tokio::test]
async fn test_prompts_are_shown_one_at_a_time_in_order() {
    let (prompter, mut prompts) = ChannelPrompter::new();
    let broker = broker_with(
        "fifo",
        &[Capability::Cookies],
        Vec::new(),
        Arc::new(prompter),
        &HostFacilities::default(),
    );

    let mut tasks = Vec::new();
    for name in ["a", "b", "c"] {
        let broker = Arc::clone(&broker);
        let request = cookie(AccessOperation::Write, Some(&format!("{name}=1")));
        tasks.push(tokio::spawn(async move { broker.handle_request(&request).await }));
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let prompt = prompts.recv().await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(prompts.try_recv().is_err(), "a second prompt became visible");
        seen.push(prompt.pattern.clone());
        prompt.decide(PermissionDecision::AllowOnce);
    }
    assert_eq!(seen, vec!["a", "b", "c"]);

    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(json!({"success": true})));
    }
    assert_eq!(broker.executor().cookies().read(), "a=1; b=1; c=1");
}

#[tokio::test]
async fn test_queued_duplicate_uses_rule_from_earlier_prompt() {
    let (prompter, mut prompts) = ChannelPrompter::new();
    let broker = broker_with(
        "dup",
        &[Capability::Cookies],
        Vec::new(),
        Arc::new(prompter),
        &HostFacilities::default(),
    );

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .handle_request(&cookie(AccessOperation::Write, Some("theme=dark")))
                    .await
            })
        })
        .collect();

    prompts
        .recv()
        .await
        .unwrap()
        .decide(PermissionDecision::AllowAlways);
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    assert!(prompts.try_recv().is_err());
    assert_eq!(broker.auditor().metrics().prompts_shown, 1);
    assert_eq!(broker.rules().len(), 1);
}

fn request_for(capability: Capability, word: &str) -> CapabilityRequest {
    let details = match capability {
        Capability::Network => json!({"url": format!("https://{word}.test/{word}"), "method": "POST"}),
        Capability::KeyValueStorage => json!({"operation": "set", "key": word, "value": word}),
        Capability::Clipboard => json!({"operation": "write", "text": word}),
        Capability::Cookies => json!({"operation": "write", "value": format!("{word}=1")}),
    };
    CapabilityRequest::new(CapabilityDetails::from_value(capability, details).unwrap())
}

proptest! {
    #[test]
    fn test_disabled_capability_never_prompts(
        index in 0usize..4,
        word in "[a-z]{1,8}",
        always in any::<bool>(),
    ) {
        let capability = Capability::ALL[index];
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (prompter, mut prompts) = ChannelPrompter::new();
            let enabled: Vec<Capability> = Capability::ALL
                .into_iter()
                .filter(|c| *c != capability)
                .collect();
            // Even a blanket allow rule does not re-enable the capability.
            let rules = if always {
                vec![PermissionRule::allow(capability, "*")]
            } else {
                Vec::new()
            };
            let broker = broker_with("prop", &enabled, rules, Arc::new(prompter), &HostFacilities::default());

            let err = broker
                .handle_request(&request_for(capability, &word))
                .await
                .unwrap_err();
            prop_assert_eq!(err, BrokerError::CapabilityDisabled(capability));
            prop_assert!(prompts.try_recv().is_err());
            prop_assert_eq!(broker.auditor().metrics().prompts_shown, 0);
            Ok(())
        })?;
    }
}
