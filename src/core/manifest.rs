//! Pipeline manifests from YAML

use crate::core::graph::{GraphBuilder, PipelineGraph, PipelineParameter};
use crate::core::guard::{Guard, GuardOp};
use crate::core::step::{ParamBinding, StepBuilder, StepDescriptor};
use crate::core::value::OutputValue;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Top-level pipeline manifest loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineManifest {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Pipeline-level parameters bound by the caller at run time
    #[serde(default)]
    pub params: Vec<ParamSpec>,

    /// Pipeline steps
    pub steps: Vec<StepSpec>,
}

/// Pipeline-parameter declaration as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<OutputValue>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique step name
    pub name: String,

    /// Container image reference
    pub image: String,

    /// Command argument vector
    pub command: Vec<String>,

    /// Named parameters; values are literals or `{{ ... }}` references
    #[serde(default)]
    pub params: std::collections::BTreeMap<String, serde_yaml::Value>,

    /// Step names this step explicitly depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Output keys this step publishes
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Guard expression, e.g. `steps.evaluate.outputs.mse < 12`
    #[serde(default)]
    pub when: Option<String>,

    /// CPU request in Kubernetes quantity form ("500m", "2")
    #[serde(default)]
    pub cpu: Option<String>,

    /// Memory request in Kubernetes quantity form ("512Mi", "4Gi")
    #[serde(default)]
    pub memory: Option<String>,

    /// Required node labels
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,

    /// Taint keys this step tolerates
    #[serde(default)]
    pub tolerations: Vec<String>,

    /// Additional attempts after the first failure
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Base backoff between retries, in milliseconds
    #[serde(default)]
    pub backoff_ms: Option<u64>,

    /// Wall-clock budget in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn output_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\{\{\s*steps\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)\s*\}\}$").unwrap()
    })
}

fn pipeline_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\{\{\s*params\.([A-Za-z0-9_-]+)\s*\}\}$").unwrap())
}

fn guard_expr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^steps\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)\s*(<=|>=|==|!=|<|>)\s*(.+)$",
        )
        .unwrap()
    })
}

impl PipelineManifest {
    /// Load a manifest from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading manifest {}", path.as_ref().display()))?;
        Self::from_yaml(&content)
    }

    /// Parse a manifest from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: PipelineManifest =
            serde_yaml::from_str(yaml).context("parsing pipeline manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Surface-level validation; structural checks (cycles, binding
    /// soundness) happen in [`GraphBuilder::build`].
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("pipeline name must not be empty");
        }
        if self.steps.is_empty() {
            bail!("pipeline '{}' has no steps", self.name);
        }
        for step in &self.steps {
            if step.command.is_empty() {
                bail!("step '{}' has an empty command", step.name);
            }
            if let Some(when) = &step.when {
                if !guard_expr_re().is_match(when.trim()) {
                    bail!(
                        "step '{}' has an invalid guard expression: '{}'",
                        step.name,
                        when
                    );
                }
            }
        }
        Ok(())
    }

    /// Lower the manifest into a validated [`PipelineGraph`].
    pub fn into_graph(self) -> Result<PipelineGraph> {
        let mut builder = GraphBuilder::new();
        for param in &self.params {
            builder.add_parameter(PipelineParameter {
                name: param.name.clone(),
                required: param.required,
                default: param.default.clone(),
            });
        }
        for spec in self.steps {
            let step = spec.into_descriptor()?;
            builder.add_step(step)?;
        }
        Ok(builder.build()?)
    }
}

impl StepSpec {
    fn into_descriptor(self) -> Result<StepDescriptor> {
        let mut builder = StepBuilder::new(&self.name, &self.image).command(self.command);

        for (name, value) in self.params {
            let binding = parse_binding(&value)
                .with_context(|| format!("step '{}' parameter '{}'", self.name, name))?;
            builder = match binding {
                ParamBinding::Literal(v) => builder.param(name, v),
                ParamBinding::FromOutput { step, key } => {
                    builder.param_from_output(name, step, key)
                }
                ParamBinding::PipelineParam(p) => builder.param_from_pipeline(name, p),
            };
        }

        for dep in self.depends_on {
            builder = builder.depends_on(dep);
        }
        for output in self.outputs {
            builder = builder.output(output);
        }
        for (key, value) in self.labels {
            builder = builder.placement_label(key, value);
        }
        for taint in self.tolerations {
            builder = builder.tolerates(taint);
        }

        let cpu_millis = match &self.cpu {
            Some(q) => parse_cpu_quantity(q)
                .with_context(|| format!("step '{}' cpu request", self.name))?,
            None => crate::core::step::ResourceRequest::default().cpu_millis,
        };
        let memory_mib = match &self.memory {
            Some(q) => parse_memory_quantity(q)
                .with_context(|| format!("step '{}' memory request", self.name))?,
            None => crate::core::step::ResourceRequest::default().memory_mib,
        };
        builder = builder.resources(cpu_millis, memory_mib);

        if let Some(max_retries) = self.max_retries {
            builder = builder.retries(max_retries);
        }
        if let Some(backoff_ms) = self.backoff_ms {
            builder = builder.backoff_base_ms(backoff_ms);
        }
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(when) = &self.when {
            builder = builder.guard(parse_guard(when)?);
        }

        Ok(builder.build())
    }
}

/// Interpret a YAML parameter value as a binding.
///
/// Strings wholly consisting of a `{{ steps.<s>.outputs.<k> }}` or
/// `{{ params.<n> }}` reference become bindings; everything else is a
/// literal.
fn parse_binding(value: &serde_yaml::Value) -> Result<ParamBinding> {
    match value {
        serde_yaml::Value::Bool(b) => Ok(ParamBinding::Literal(OutputValue::Bool(*b))),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ParamBinding::Literal(OutputValue::Integer(i)))
            } else if let Some(f) = n.as_f64() {
                Ok(ParamBinding::Literal(OutputValue::Float(f)))
            } else {
                bail!("unrepresentable numeric literal: {:?}", n)
            }
        }
        serde_yaml::Value::String(s) => {
            let trimmed = s.trim();
            if let Some(caps) = output_ref_re().captures(trimmed) {
                Ok(ParamBinding::FromOutput {
                    step: caps[1].to_string(),
                    key: caps[2].to_string(),
                })
            } else if let Some(caps) = pipeline_param_re().captures(trimmed) {
                Ok(ParamBinding::PipelineParam(caps[1].to_string()))
            } else {
                Ok(ParamBinding::Literal(OutputValue::String(s.clone())))
            }
        }
        other => bail!("unsupported parameter value: {:?}", other),
    }
}

fn parse_guard(expr: &str) -> Result<Guard> {
    let caps = guard_expr_re()
        .captures(expr.trim())
        .with_context(|| format!("invalid guard expression: '{}'", expr))?;
    let op = match &caps[3] {
        "<" => GuardOp::Lt,
        "<=" => GuardOp::Le,
        ">" => GuardOp::Gt,
        ">=" => GuardOp::Ge,
        "==" => GuardOp::Eq,
        "!=" => GuardOp::Ne,
        other => bail!("unknown guard operator: '{}'", other),
    };
    let literal = caps[4].trim().trim_matches(|c| c == '"' || c == '\'');
    Ok(Guard::new(
        caps[1].to_string(),
        caps[2].to_string(),
        op,
        OutputValue::parse(literal),
    ))
}

/// Parse a Kubernetes-style CPU quantity into millicores.
///
/// "500m" means 500 millicores; a bare number means whole cores.
pub fn parse_cpu_quantity(quantity: &str) -> Result<u64> {
    let q = quantity.trim();
    if let Some(millis) = q.strip_suffix('m') {
        return millis
            .parse::<u64>()
            .with_context(|| format!("invalid cpu quantity: '{}'", quantity));
    }
    let cores: f64 = q
        .parse()
        .with_context(|| format!("invalid cpu quantity: '{}'", quantity))?;
    if cores < 0.0 {
        bail!("cpu quantity must be non-negative: '{}'", quantity);
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Parse a Kubernetes-style memory quantity into MiB.
pub fn parse_memory_quantity(quantity: &str) -> Result<u64> {
    let q = quantity.trim();
    let (number, scale) = if let Some(n) = q.strip_suffix("Gi") {
        (n, 1024)
    } else if let Some(n) = q.strip_suffix("Mi") {
        (n, 1)
    } else {
        bail!("invalid memory quantity (expected Mi or Gi suffix): '{}'", quantity);
    };
    let value: u64 = number
        .parse()
        .with_context(|| format!("invalid memory quantity: '{}'", quantity))?;
    Ok(value.saturating_mul(scale))
}
