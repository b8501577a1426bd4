pub mod executor;

pub use executor::*;

use crate::sandbox::permissions::{
    AuditOutcome, Capability, CapabilityDetails, CapabilityRequest, DecisionAuditor,
    PermissionDecision, PermissionRule, RuleDecision, RuleStore,
};
use crate::sandbox::BrokerConfig;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// A permission question waiting for a user decision.
///
/// Dropping it without calling [`PendingPrompt::decide`] counts as `deny-once`.
#[derive(Debug)]
pub struct PendingPrompt {
    pub id: String,
    pub capability: Capability,
    pub details: CapabilityDetails,
    pub pattern: String,
    pub summary: String,
    responder: oneshot::Sender<PermissionDecision>,
}

impl PendingPrompt {
    /// Returns `false` when the broker stopped waiting for this prompt.
    pub fn decide(self, decision: PermissionDecision) -> bool {
        self.responder.send(decision).is_ok()
    }
}

/// Presents prompts to whoever can answer them.
pub trait PermissionPrompter: Send + Sync {
    fn present(&self, prompt: PendingPrompt);
}

/// Forwards prompts to a receiver owned by the embedding UI.
pub struct ChannelPrompter {
    tx: mpsc::UnboundedSender<PendingPrompt>,
}

impl ChannelPrompter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingPrompt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PermissionPrompter for ChannelPrompter {
    fn present(&self, prompt: PendingPrompt) {
        if let Err(mpsc::error::SendError(prompt)) = self.tx.send(prompt) {
            warn!(request_id = %prompt.id, "no prompt receiver, denying");
        }
    }
}

/// Answers every prompt with the same decision.
pub struct StaticPrompter(pub PermissionDecision);

impl PermissionPrompter for StaticPrompter {
    fn present(&self, prompt: PendingPrompt) {
        prompt.decide(self.0);
    }
}

/// Gates capability requests from one isolated context.
pub struct CapabilityBroker {
    enabled: HashSet<Capability>,
    rules: Arc<RuleStore>,
    prompter: Arc<dyn PermissionPrompter>,
    prompt_gate: Mutex<()>,
    prompt_timeout: Duration,
    executor: CapabilityExecutor,
    auditor: Arc<DecisionAuditor>,
}

impl CapabilityBroker {
    pub fn new(
        instance_id: &str,
        enabled: impl IntoIterator<Item = Capability>,
        rules: Arc<RuleStore>,
        prompter: Arc<dyn PermissionPrompter>,
        facilities: &HostFacilities,
        config: &BrokerConfig,
    ) -> Result<Self, BrokerError> {
        let executor = CapabilityExecutor::new(instance_id, facilities, config)
            .map_err(|e| BrokerError::ExecutionFailure(e.to_string()))?;

        Ok(Self {
            enabled: enabled.into_iter().collect(),
            rules,
            prompter,
            prompt_gate: Mutex::new(()),
            prompt_timeout: Duration::from_millis(config.prompt_timeout_ms),
            executor,
            auditor: Arc::new(DecisionAuditor::new(config.audit_capacity)),
        })
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn auditor(&self) -> &Arc<DecisionAuditor> {
        &self.auditor
    }

    pub fn executor(&self) -> &CapabilityExecutor {
        &self.executor
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    pub async fn handle_request(&self, request: &CapabilityRequest) -> Result<Value, BrokerError> {
        let capability = request.capability();
        if !self.is_enabled(capability) {
            self.auditor
                .record(&request.id, capability, "", AuditOutcome::Disabled, false);
            return Err(BrokerError::CapabilityDisabled(capability));
        }

        let pattern = request.details.pattern();
        if let Some(rule) = self.rules.find_match(capability, &pattern) {
            return self.apply_rule(request, &pattern, rule).await;
        }

        let decision = {
            // One prompt visible at a time; waiters are served in arrival order.
            let slot = self.prompt_gate.lock().await;

            if let Some(rule) = self.rules.find_match(capability, &pattern) {
                drop(slot);
                return self.apply_rule(request, &pattern, rule).await;
            }

            let decision = self.ask(request, &pattern).await;
            if let Some(persisted) = decision.persisted() {
                info!(%capability, pattern = %pattern, ?persisted, "persisting permission rule");
                self.rules.append(PermissionRule {
                    capability,
                    pattern: pattern.clone(),
                    decision: persisted,
                });
            }
            decision
        };

        if decision.is_allow() {
            self.execute(request, &pattern, AuditOutcome::AllowedByUser, true)
                .await
        } else {
            self.auditor.record(
                &request.id,
                capability,
                &pattern,
                AuditOutcome::DeniedByUser,
                true,
            );
            Err(BrokerError::DeniedByUser)
        }
    }

    async fn apply_rule(
        &self,
        request: &CapabilityRequest,
        pattern: &str,
        rule: PermissionRule,
    ) -> Result<Value, BrokerError> {
        match rule.decision {
            RuleDecision::Allow => {
                self.execute(request, pattern, AuditOutcome::AllowedByRule, false)
                    .await
            }
            RuleDecision::Deny => {
                self.auditor.record(
                    &request.id,
                    rule.capability,
                    pattern,
                    AuditOutcome::DeniedByRule,
                    false,
                );
                Err(BrokerError::DeniedByRule {
                    capability: rule.capability,
                    pattern: rule.pattern,
                })
            }
        }
    }

    async fn ask(&self, request: &CapabilityRequest, pattern: &str) -> PermissionDecision {
        let (responder, decision) = oneshot::channel();
        let prompt = PendingPrompt {
            id: request.id.clone(),
            capability: request.capability(),
            details: request.details.clone(),
            pattern: pattern.to_string(),
            summary: request.details.summary(),
            responder,
        };

        debug!(request_id = %request.id, summary = %prompt.summary, "presenting permission prompt");
        self.prompter.present(prompt);

        match tokio::time::timeout(self.prompt_timeout, decision).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => {
                debug!(request_id = %request.id, "prompt dropped without a decision");
                PermissionDecision::DenyOnce
            }
            Err(_) => {
                warn!(request_id = %request.id, timeout = ?self.prompt_timeout, "permission prompt timed out");
                PermissionDecision::DenyOnce
            }
        }
    }

    async fn execute(
        &self,
        request: &CapabilityRequest,
        pattern: &str,
        outcome: AuditOutcome,
        prompted: bool,
    ) -> Result<Value, BrokerError> {
        let capability = request.capability();
        match self.executor.execute(&request.details).await {
            Ok(value) => {
                self.auditor
                    .record(&request.id, capability, pattern, outcome, prompted);
                Ok(value)
            }
            Err(e) => {
                self.auditor.record(
                    &request.id,
                    capability,
                    pattern,
                    AuditOutcome::ExecutionFailed,
                    prompted,
                );
                Err(BrokerError::ExecutionFailure(e.to_string()))
            }
        }
    }
}

/// Broker outcomes other than success. `Display` is the wire error string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Capability \"{0}\" is not enabled for this sandbox.")]
    CapabilityDisabled(Capability),
    #[error("Denied by permission rule: {capability} → {pattern}")]
    DeniedByRule {
        capability: Capability,
        pattern: String,
    },
    #[error("Permission denied by user.")]
    DeniedByUser,
    #[error("{0}")]
    ExecutionFailure(String),
}
