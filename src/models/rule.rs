use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::group::NotifyOn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Info => "INFO",
        }
    }

    /// SLA targets in seconds: `(tta_target, ttr_target)`, `None` for INFO
    /// (no SLA tracked) per §4.5.
    pub fn default_sla_targets(&self) -> Option<(i64, i64)> {
        match self {
            Self::Critical => Some((5 * 60, 60 * 60)),
            Self::High => Some((15 * 60, 4 * 60 * 60)),
            Self::Medium => Some((60 * 60, 24 * 60 * 60)),
            Self::Low => Some((4 * 60 * 60, 72 * 60 * 60)),
            Self::Info => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ComparisonOp {
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Lte => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Gte => lhs >= rhs,
            Self::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Self::Ne => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Lte),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Gte),
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl Aggregate {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "sum" => Some(Self::Sum),
            "count" => Some(Self::Count),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatMeasure {
    Stddev,
    Zscore,
}

/// Rule family parameter bundles (§4.4). The tagged enum keeps validation at
/// the type boundary: a rule row decodes into exactly one variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "UPPERCASE")]
pub enum RuleParams {
    Threshold {
        op: ComparisonOp,
        value: f64,
    },
    Comparison {
        metric_a: String,
        metric_b: String,
        op: ComparisonOp,
    },
    TimeWindow {
        window_seconds: u32,
        aggregate: Aggregate,
        op: ComparisonOp,
        value: f64,
    },
    Statistical {
        window_seconds: u32,
        aggregate: StatMeasure,
        op: ComparisonOp,
        value: f64,
    },
}

impl RuleParams {
    pub fn family_name(&self) -> &'static str {
        match self {
            Self::Threshold { .. } => "THRESHOLD",
            Self::Comparison { .. } => "COMPARISON",
            Self::TimeWindow { .. } => "TIME_WINDOW",
            Self::Statistical { .. } => "STATISTICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub enabled: bool,
    pub device_id: Uuid,
    pub metric: String,
    pub params: RuleParams,
    pub severity: Severity,
    pub action_ids: Vec<Uuid>,
    pub consecutive_errors: u32,
    /// Fan-out policy for the alert group this rule's fires land in
    /// (§4.5). Carried on the rule rather than the group so it's
    /// configurable per rule-author rather than fixed at group-creation
    /// time.
    #[serde(default)]
    pub notify_on: NotifyOn,
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub device_id: Uuid,
    pub metric: String,
    pub params: RuleParams,
    pub severity: Severity,
    #[serde(default)]
    pub action_ids: Vec<Uuid>,
    #[serde(default)]
    pub notify_on: NotifyOn,
}

/// Result of evaluating one rule on one tick (§4.4 "Evaluation contract").
#[derive(Debug, Clone)]
pub enum EvalOutcome {
    Fired { metadata: serde_json::Value },
    Ok,
    InsufficientData,
    Error(String),
}
