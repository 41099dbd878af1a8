//! Guard predicates - metric-gated conditional execution

use crate::core::value::OutputValue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator in a guard expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl GuardOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            GuardOp::Lt => ordering == Ordering::Less,
            GuardOp::Le => ordering != Ordering::Greater,
            GuardOp::Gt => ordering == Ordering::Greater,
            GuardOp::Ge => ordering != Ordering::Less,
            GuardOp::Eq => ordering == Ordering::Equal,
            GuardOp::Ne => ordering != Ordering::Equal,
        }
    }
}

impl fmt::Display for GuardOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            GuardOp::Lt => "<",
            GuardOp::Le => "<=",
            GuardOp::Gt => ">",
            GuardOp::Ge => ">=",
            GuardOp::Eq => "==",
            GuardOp::Ne => "!=",
        };
        write!(f, "{}", symbol)
    }
}

/// A predicate over a named upstream output.
///
/// The scheduler evaluates the guard immediately before a node would become
/// ready; a false guard forces the node to `Skipped` without dispatch. Making
/// the decision part of the graph keeps it visible and testable independently
/// of the step's own code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    /// Name of the upstream step producing the gated value
    pub source_step: String,

    /// Output key on that step
    pub output_key: String,

    /// Comparison operator
    pub op: GuardOp,

    /// Literal to compare against
    pub threshold: OutputValue,
}

impl Guard {
    pub fn new(
        source_step: impl Into<String>,
        output_key: impl Into<String>,
        op: GuardOp,
        threshold: impl Into<OutputValue>,
    ) -> Self {
        Self {
            source_step: source_step.into(),
            output_key: output_key.into(),
            op,
            threshold: threshold.into(),
        }
    }

    /// Evaluate the guard against the resolved upstream value.
    ///
    /// Incomparable types (e.g. a string metric against a numeric threshold)
    /// evaluate to false rather than erroring; the mismatch is a manifest
    /// authoring problem and a skip is the safe outcome.
    pub fn evaluate(&self, value: &OutputValue) -> bool {
        match value.compare(&self.threshold) {
            Some(ordering) => self.op.holds(ordering),
            None => false,
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "steps.{}.outputs.{} {} {}",
            self.source_step, self.output_key, self.op, self.threshold
        )
    }
}
