//! Output channel - publication and resolution of small step outputs

use crate::core::value::OutputValue;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Errors from resolving an output reference.
///
/// The two variants are deliberately distinct: an unknown key is a
/// structural bug the graph builder should have caught (or a substrate
/// publishing keys it never declared), while a not-yet-available value is
/// an ordering violation in the scheduler. Neither is retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("output 'steps.{step}.outputs.{key}' is not yet available")]
    OutputNotYetAvailable { step: String, key: String },

    #[error("unknown output key 'steps.{step}.outputs.{key}'")]
    UnknownOutputKey { step: String, key: String },
}

/// In-run store of published step outputs, keyed by (step, output key).
///
/// Keys are namespaced by their producing step, so each key has exactly one
/// legal writer; a second publish to the same key replaces the value only
/// within a retry of the same step.
#[derive(Debug, Default)]
pub struct OutputChannel {
    /// (step, key) pairs declared by the workflow; the full legal key space
    declared: BTreeSet<(String, String)>,

    /// Values published so far
    values: BTreeMap<(String, String), OutputValue>,
}

impl OutputChannel {
    /// Build a channel whose legal key space is the given declarations.
    pub fn new<I>(declared: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            declared: declared.into_iter().collect(),
            values: BTreeMap::new(),
        }
    }

    /// Publish a value for a declared output key.
    ///
    /// Publishing an undeclared key is rejected; a retried step may
    /// republish its own keys, overwriting the previous attempt's values.
    pub fn publish(
        &mut self,
        step: &str,
        key: &str,
        value: OutputValue,
    ) -> Result<(), ChannelError> {
        let full_key = (step.to_string(), key.to_string());
        if !self.declared.contains(&full_key) {
            return Err(ChannelError::UnknownOutputKey {
                step: step.to_string(),
                key: key.to_string(),
            });
        }
        debug!(step, key, %value, "output published");
        self.values.insert(full_key, value);
        Ok(())
    }

    /// Resolve a declared output key to its published value.
    pub fn resolve(&self, step: &str, key: &str) -> Result<&OutputValue, ChannelError> {
        let full_key = (step.to_string(), key.to_string());
        if !self.declared.contains(&full_key) {
            return Err(ChannelError::UnknownOutputKey {
                step: step.to_string(),
                key: key.to_string(),
            });
        }
        self.values
            .get(&full_key)
            .ok_or_else(|| ChannelError::OutputNotYetAvailable {
                step: step.to_string(),
                key: key.to_string(),
            })
    }

    /// All values published by one step, in key order.
    pub fn outputs_of(&self, step: &str) -> BTreeMap<&str, &OutputValue> {
        self.values
            .iter()
            .filter(|((s, _), _)| s == step)
            .map(|((_, k), v)| (k.as_str(), v))
            .collect()
    }
}
