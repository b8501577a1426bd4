use super::Capability;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// How the broker settled one capability request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Disabled,
    AllowedByRule,
    DeniedByRule,
    AllowedByUser,
    DeniedByUser,
    ExecutionFailed,
}

impl AuditOutcome {
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            AuditOutcome::Disabled | AuditOutcome::DeniedByRule | AuditOutcome::DeniedByUser
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub capability: Capability,
    pub pattern: String,
    pub outcome: AuditOutcome,
    pub prompted: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AuditMetrics {
    pub total_events: u64,
    pub prompts_shown: u64,
    pub denials: u64,
    pub execution_failures: u64,
    pub events_by_capability: HashMap<Capability, u64>,
}

/// Bounded in-memory log of broker decisions for one session.
pub struct DecisionAuditor {
    events: Mutex<VecDeque<AuditEvent>>,
    metrics: Mutex<AuditMetrics>,
    capacity: usize,
}

impl DecisionAuditor {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            metrics: Mutex::new(AuditMetrics::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(
        &self,
        request_id: &str,
        capability: Capability,
        pattern: &str,
        outcome: AuditOutcome,
        prompted: bool,
    ) {
        if outcome.is_denial() {
            warn!(request_id, %capability, pattern, ?outcome, "capability request denied");
        } else {
            debug!(request_id, %capability, pattern, ?outcome, "capability request settled");
        }

        {
            let mut metrics = self.metrics.lock();
            metrics.total_events += 1;
            if prompted {
                metrics.prompts_shown += 1;
            }
            if outcome.is_denial() {
                metrics.denials += 1;
            }
            if outcome == AuditOutcome::ExecutionFailed {
                metrics.execution_failures += 1;
            }
            *metrics.events_by_capability.entry(capability).or_insert(0) += 1;
        }

        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(AuditEvent {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            capability,
            pattern: pattern.to_string(),
            outcome,
            prompted,
        });
    }

    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn metrics(&self) -> AuditMetrics {
        self.metrics.lock().clone()
    }
}

impl Default for DecisionAuditor {
    fn default() -> Self {
        Self::new(256)
    }
}
