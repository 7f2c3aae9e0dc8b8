//! Cumulative usage ledger for sub-model calls routed through the callback
//! server.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::lm::TokenUsage;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

/// Point-in-time copy of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_calls: u64,
    pub calls_by_model: BTreeMap<String, ModelUsage>,
}

/// Difference between two snapshots, reported per sub-agent run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

impl UsageSnapshot {
    /// Counters accrued since `earlier`. Saturating, so a reset between the
    /// two snapshots reads as zero rather than underflowing.
    pub fn since(&self, earlier: &UsageSnapshot) -> UsageDelta {
        UsageDelta {
            input_tokens: self
                .total_input_tokens
                .saturating_sub(earlier.total_input_tokens),
            output_tokens: self
                .total_output_tokens
                .saturating_sub(earlier.total_output_tokens),
            calls: self.total_calls.saturating_sub(earlier.total_calls),
        }
    }
}

/// Monotonic counters; only `reset` moves them backward.
#[derive(Default)]
pub struct UsageLedger {
    inner: Mutex<UsageSnapshot>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, usage: TokenUsage) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_input_tokens += usage.input_tokens;
        inner.total_output_tokens += usage.output_tokens;
        inner.total_calls += 1;
        let entry = inner.calls_by_model.entry(model.to_string()).or_default();
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.calls += 1;
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        self.inner.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap() = UsageSnapshot::default();
    }
}
