//! Step descriptor domain model

use crate::core::guard::Guard;
use crate::core::value::OutputValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// CPU/memory requested for one containerized step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU in millicores (1000 = one core)
    pub cpu_millis: u64,

    /// Memory in MiB
    pub memory_mib: u64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu_millis: 500,
            memory_mib: 512,
        }
    }
}

/// Placement requirements forwarded to the substrate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConstraints {
    /// Required node labels (key -> value)
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Taint keys this step tolerates
    #[serde(default)]
    pub tolerations: BTreeSet<String>,
}

impl PlacementConstraints {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.tolerations.is_empty()
    }
}

/// Per-step retry behaviour: `max_retries` additional attempts after the
/// first, with exponential backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    /// Backoff before the given retry (1-based), doubling each time.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 500,
        }
    }
}

/// How a step parameter gets its value at run time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamBinding {
    /// Fixed value baked into the workflow
    Literal(OutputValue),

    /// Value published by an upstream step's declared output
    FromOutput { step: String, key: String },

    /// Value supplied by the caller when the run is invoked
    PipelineParam(String),
}

/// One unit of work in a pipeline, mapped to one containerized execution.
///
/// Immutable once added to a graph: every setting is supplied through
/// [`StepBuilder`] before insertion, so a descriptor can never be observed
/// partially configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Unique name within the pipeline
    pub name: String,

    /// Container image reference
    pub image: String,

    /// Command argument vector; arguments may reference parameters as
    /// `{{ name }}` placeholders resolved at dispatch time
    pub command: Vec<String>,

    /// Named parameters, literal or bound to upstream outputs
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamBinding>,

    /// Explicitly declared upstream dependencies
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Output keys this step publishes on the channel
    #[serde(default)]
    pub outputs: BTreeSet<String>,

    /// Resource request forwarded to the substrate
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Placement constraints forwarded to the substrate
    #[serde(default)]
    pub placement: PlacementConstraints,

    /// Retry policy applied by the scheduler
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Optional wall-clock budget
    #[serde(default)]
    pub timeout: Option<Duration>,

    /// Optional guard predicate over an upstream output
    #[serde(default)]
    pub guard: Option<Guard>,
}

/// Builder for [`StepDescriptor`].
pub struct StepBuilder {
    descriptor: StepDescriptor,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            descriptor: StepDescriptor {
                name: name.into(),
                image: image.into(),
                command: Vec::new(),
                parameters: BTreeMap::new(),
                depends_on: BTreeSet::new(),
                outputs: BTreeSet::new(),
                resources: ResourceRequest::default(),
                placement: PlacementConstraints::default(),
                retry: RetryPolicy::default(),
                timeout: None,
                guard: None,
            },
        }
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.command = args.into_iter().map(Into::into).collect();
        self
    }

    /// Bind a parameter to a literal value.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<OutputValue>) -> Self {
        self.descriptor
            .parameters
            .insert(name.into(), ParamBinding::Literal(value.into()));
        self
    }

    /// Bind a parameter to an upstream step's output. The graph builder
    /// turns this into a real dependency edge.
    pub fn param_from_output(
        mut self,
        name: impl Into<String>,
        step: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.descriptor.parameters.insert(
            name.into(),
            ParamBinding::FromOutput {
                step: step.into(),
                key: key.into(),
            },
        );
        self
    }

    /// Bind a parameter to a pipeline-level parameter supplied at run time.
    pub fn param_from_pipeline(
        mut self,
        name: impl Into<String>,
        pipeline_param: impl Into<String>,
    ) -> Self {
        self.descriptor.parameters.insert(
            name.into(),
            ParamBinding::PipelineParam(pipeline_param.into()),
        );
        self
    }

    pub fn depends_on(mut self, upstream: impl Into<String>) -> Self {
        self.descriptor.depends_on.insert(upstream.into());
        self
    }

    /// Declare an output key this step publishes.
    pub fn output(mut self, key: impl Into<String>) -> Self {
        self.descriptor.outputs.insert(key.into());
        self
    }

    pub fn resources(mut self, cpu_millis: u64, memory_mib: u64) -> Self {
        self.descriptor.resources = ResourceRequest {
            cpu_millis,
            memory_mib,
        };
        self
    }

    pub fn placement_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor
            .placement
            .labels
            .insert(key.into(), value.into());
        self
    }

    pub fn tolerates(mut self, taint: impl Into<String>) -> Self {
        self.descriptor.placement.tolerations.insert(taint.into());
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.descriptor.retry.max_retries = max_retries;
        self
    }

    pub fn backoff_base_ms(mut self, ms: u64) -> Self {
        self.descriptor.retry.backoff_base_ms = ms;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout = Some(timeout);
        self
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.descriptor.guard = Some(guard);
        self
    }

    pub fn build(self) -> StepDescriptor {
        self.descriptor
    }
}

impl StepDescriptor {
    /// Names of the upstream steps this descriptor references through
    /// parameter bindings or its guard (the implicit dependencies).
    pub fn bound_upstreams(&self) -> BTreeSet<&str> {
        let mut upstreams: BTreeSet<&str> = self
            .parameters
            .values()
            .filter_map(|binding| match binding {
                ParamBinding::FromOutput { step, .. } => Some(step.as_str()),
                _ => None,
            })
            .collect();
        if let Some(guard) = &self.guard {
            upstreams.insert(guard.source_step.as_str());
        }
        upstreams
    }

    /// Output references (step, key) this descriptor reads, from bindings
    /// and its guard.
    pub fn output_references(&self) -> Vec<(&str, &str)> {
        let mut refs: Vec<(&str, &str)> = self
            .parameters
            .values()
            .filter_map(|binding| match binding {
                ParamBinding::FromOutput { step, key } => Some((step.as_str(), key.as_str())),
                _ => None,
            })
            .collect();
        if let Some(guard) = &self.guard {
            refs.push((guard.source_step.as_str(), guard.output_key.as_str()));
        }
        refs
    }
}
