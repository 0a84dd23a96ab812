//! Per-provider notification filtering.
//!
//! A filter is a pure predicate: the same `(filter, notification)` pair
//! always evaluates to the same verdict and reason.

use crate::notification::{Notification, NotificationPriority, NotificationType, Value};
use std::collections::HashMap;

/// Why a notification was (or wasn't) matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// Matched every dimension.
    All,
    TypeMismatch,
    PriorityMismatch,
    ComponentMismatch,
    /// The confidence comparison failed: threshold not met, missing or
    /// non-numeric metadata, or an unparsable expression.
    ConfidenceThreshold,
    MetadataMismatch,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::All => "all",
            FilterReason::TypeMismatch => "type-mismatch",
            FilterReason::PriorityMismatch => "priority-mismatch",
            FilterReason::ComponentMismatch => "component-mismatch",
            FilterReason::ConfidenceThreshold => "confidence-threshold",
            FilterReason::MetadataMismatch => "metadata-mismatch",
        }
    }
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterVerdict {
    pub matched: bool,
    pub reason: FilterReason,
}

impl FilterVerdict {
    fn matched() -> Self {
        Self { matched: true, reason: FilterReason::All }
    }

    fn rejected(reason: FilterReason) -> Self {
        Self { matched: false, reason }
    }
}

/// Include-list filter. Empty dimensions accept everything; metadata
/// entries must all hold.
#[derive(Debug, Clone, Default)]
pub struct ProviderFilter {
    pub types: Vec<NotificationType>,
    pub priorities: Vec<NotificationPriority>,
    pub components: Vec<String>,
    /// Key `"confidence"` is a comparator expression (`">0.8"`); any
    /// other key is an exact stringified comparison.
    pub metadata_filters: HashMap<String, String>,
}

impl ProviderFilter {
    pub fn evaluate(&self, notification: &Notification) -> FilterVerdict {
        if !self.types.is_empty() && !self.types.contains(&notification.kind) {
            return FilterVerdict::rejected(FilterReason::TypeMismatch);
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&notification.priority) {
            return FilterVerdict::rejected(FilterReason::PriorityMismatch);
        }
        if !self.components.is_empty()
            && !self.components.iter().any(|c| c == &notification.component)
        {
            return FilterVerdict::rejected(FilterReason::ComponentMismatch);
        }

        for (key, expected) in &self.metadata_filters {
            if key == "confidence" {
                if !confidence_matches(expected, notification.metadata.get(key)) {
                    return FilterVerdict::rejected(FilterReason::ConfidenceThreshold);
                }
            } else {
                let matches = notification
                    .metadata
                    .get(key)
                    .is_some_and(|actual| actual.to_string() == *expected);
                if !matches {
                    return FilterVerdict::rejected(FilterReason::MetadataMismatch);
                }
            }
        }

        FilterVerdict::matched()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Ge,
    Le,
    Eq,
    Gt,
    Lt,
}

/// Parses a comparator expression of the form `<op><number>`.
///
/// Operators are tested longest first so `>=` is not read as `>` followed
/// by `=0.8`. `=` and `==` are both exact equality.
fn parse_confidence_expr(expr: &str) -> Option<(CmpOp, f64)> {
    let expr = expr.trim();
    let (op, rest) = if let Some(rest) = expr.strip_prefix(">=") {
        (CmpOp::Ge, rest)
    } else if let Some(rest) = expr.strip_prefix("<=") {
        (CmpOp::Le, rest)
    } else if let Some(rest) = expr.strip_prefix("==") {
        (CmpOp::Eq, rest)
    } else if let Some(rest) = expr.strip_prefix('>') {
        (CmpOp::Gt, rest)
    } else if let Some(rest) = expr.strip_prefix('<') {
        (CmpOp::Lt, rest)
    } else if let Some(rest) = expr.strip_prefix('=') {
        (CmpOp::Eq, rest)
    } else {
        return None;
    };
    let threshold: f64 = rest.trim().parse().ok()?;
    Some((op, threshold))
}

fn confidence_matches(expr: &str, value: Option<&Value>) -> bool {
    let Some((op, threshold)) = parse_confidence_expr(expr) else {
        return false;
    };
    let Some(actual) = value.and_then(Value::as_f64) else {
        return false;
    };
    match op {
        CmpOp::Gt => actual > threshold,
        CmpOp::Ge => actual >= threshold,
        CmpOp::Lt => actual < threshold,
        CmpOp::Le => actual <= threshold,
        CmpOp::Eq => actual == threshold,
    }
}
