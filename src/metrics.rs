//! Metrics emission behind a pluggable sink.
//!
//! The engine records everything through [`MetricsEmitter`]; the default
//! sink writes structured tracing events, and deployments plug in their
//! own exporter. Emission failures never propagate into decisions.

use std::fmt;
use std::sync::Mutex;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

/// Metric names, following the `genai.*` semantic conventions.
pub mod names {
    pub const COST_TOTAL: &str = "genai.cost.total";
    pub const COST_MODEL: &str = "genai.cost.model";
    pub const COST_TOOL: &str = "genai.cost.tool";
    pub const TOKENS_INPUT: &str = "genai.tokens.input";
    pub const TOKENS_OUTPUT: &str = "genai.tokens.output";
    pub const AGENT_ITERATIONS: &str = "genai.agent.iterations";
    pub const AGENT_TOOL_CALLS: &str = "genai.agent.tool_calls";
    pub const AGENT_RUNS: &str = "genai.agent.runs";
    pub const DOWNGRADE_EVENTS: &str = "genai.cost.downgrade_events";
    pub const REJECTION_EVENTS: &str = "genai.cost.rejection_events";
    pub const HALT_EVENTS: &str = "genai.cost.halt_events";
    pub const BUDGET_UTILIZATION: &str = "genai.cost.budget_utilization";
}

#[derive(Debug, Error)]
#[error("metrics emission failed: {message}")]
pub struct EmitError {
    pub message: String,
}

/// One recorded measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: &'static str,
    pub value: MetricValue,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Cost(Decimal),
    Count(u64),
    Gauge(f64),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Cost(v) => write!(f, "{v}"),
            MetricValue::Count(v) => write!(f, "{v}"),
            MetricValue::Gauge(v) => write!(f, "{v}"),
        }
    }
}

/// Sink for usage and enforcement metrics.
pub trait MetricsEmitter: Send + Sync {
    fn emit(&self, measurement: Measurement) -> Result<(), EmitError>;
}

/// Default sink: one structured tracing event per measurement.
#[derive(Debug, Default)]
pub struct TracingEmitter;

impl MetricsEmitter for TracingEmitter {
    fn emit(&self, m: Measurement) -> Result<(), EmitError> {
        info!(
            target: "costguard::metrics",
            metric = m.name,
            value = %m.value,
            attributes = ?m.attributes,
            "metric"
        );
        Ok(())
    }
}

/// Test sink that captures every measurement.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    measurements: Mutex<Vec<Measurement>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Measurement> {
        match self.measurements.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn count_for(&self, name: &str) -> usize {
        match self.measurements.lock() {
            Ok(guard) => guard.iter().filter(|m| m.name == name).count(),
            Err(poisoned) => poisoned.into_inner().iter().filter(|m| m.name == name).count(),
        }
    }
}

impl MetricsEmitter for RecordingEmitter {
    fn emit(&self, measurement: Measurement) -> Result<(), EmitError> {
        match self.measurements.lock() {
            Ok(mut guard) => guard.push(measurement),
            Err(poisoned) => poisoned.into_inner().push(measurement),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_recording_emitter_captures_measurements() {
        let emitter = RecordingEmitter::new();
        emitter
            .emit(Measurement {
                name: names::COST_TOTAL,
                value: MetricValue::Cost(dec!(0.195)),
                attributes: vec![("costguard.tenant_id".into(), "acme".into())],
            })
            .unwrap();
        emitter
            .emit(Measurement {
                name: names::AGENT_RUNS,
                value: MetricValue::Count(1),
                attributes: vec![],
            })
            .unwrap();

        assert_eq!(emitter.count_for(names::COST_TOTAL), 1);
        let all = emitter.take();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, MetricValue::Cost(dec!(0.195)));
        assert!(emitter.take().is_empty());
    }
}
