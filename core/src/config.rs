use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

// Consts

const DNS_LABEL_MAX_LEN: usize = 63;

// FieldError

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new<PATH: Into<String>, MSG: Into<String>>(path: PATH, msg: MSG) -> Self {
        Self {
            path: path.into(),
            message: msg.into(),
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

// Engine

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Vllm,
    Sglang,
    Trtllm,
    Llamacpp,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vllm => "vllm",
            Self::Sglang => "sglang",
            Self::Trtllm => "trtllm",
            Self::Llamacpp => "llamacpp",
        }
    }
}

impl Display for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Mode

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One worker pool runs both prefill and decode.
    #[default]
    Aggregated,
    /// Prefill and decode run on independently sized worker pools.
    Disaggregated,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregated => "aggregated",
            Self::Disaggregated => "disaggregated",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// RouterMode

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouterMode {
    #[default]
    None,
    Kv,
    RoundRobin,
}

impl RouterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Kv => "kv",
            Self::RoundRobin => "round-robin",
        }
    }
}

impl Display for RouterMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Resources

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// GPUs per replica in aggregated mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<u32>,
    /// Memory limit per replica (Kubernetes quantity).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, message = "must not be empty"))]
    pub memory: Option<String>,
}

// DeploymentConfig

/// Runtime-agnostic deployment request.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Name of the deployment, unique per namespace.
    #[validate(custom(function = "validate_dns_label"))]
    pub name: String,
    /// Namespace of the deployment.
    #[validate(custom(function = "validate_dns_label"))]
    pub namespace: String,
    /// Model identifier, e.g. `Qwen/Qwen3-0.6B`.
    #[validate(length(min = 1, message = "must not be empty"))]
    pub model_id: String,
    /// Name under which the model is served. Defaults to the model identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, message = "must not be empty"))]
    pub served_model_name: Option<String>,
    /// Identifier of the provider that processes this config.
    #[validate(length(min = 1, message = "must not be empty"))]
    pub provider: String,
    pub engine: Engine,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub router_mode: RouterMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, message = "must be a positive integer"))]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, message = "must be a positive integer"))]
    pub prefill_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, message = "must be a positive integer"))]
    pub decode_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, message = "must be a positive integer"))]
    pub prefill_gpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, message = "must be a positive integer"))]
    pub decode_gpus: Option<u32>,
    #[serde(default)]
    #[validate(nested)]
    pub resources: Resources,
    /// Name of an existing secret holding the model hub token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, message = "must not be empty"))]
    pub hf_token_secret: Option<String>,
    #[serde(default)]
    pub enforce_eager: bool,
    #[serde(default)]
    pub enable_prefix_caching: bool,
    #[serde(default)]
    pub trust_remote_code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, message = "must be a positive integer"))]
    pub context_length: Option<u32>,
    /// Extra engine arguments, passed through verbatim and applied last.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_engine_args"))]
    pub engine_args: BTreeMap<String, Value>,
}

impl DeploymentConfig {
    pub fn from_raw(raw: &Value) -> std::result::Result<Self, Vec<FieldError>> {
        serde_json::from_value(raw.clone())
            .map_err(|err| vec![FieldError::new("config", err.to_string())])
    }

    pub fn parse(raw: &Value) -> std::result::Result<Self, Vec<FieldError>> {
        let cfg = Self::from_raw(raw)?;
        let errs = cfg.check();
        if errs.is_empty() {
            Ok(cfg)
        } else {
            Err(errs)
        }
    }

    /// Field rules and topology rules shared by every provider, sorted by path.
    pub fn check(&self) -> Vec<FieldError> {
        let mut errs = vec![];
        if let Err(verrs) = self.validate() {
            collect_validation_errors("", &verrs, &mut errs);
        }
        match self.mode {
            Mode::Aggregated => {
                let required = [
                    ("replicas", self.replicas.is_some()),
                    ("resources.gpu", self.resources.gpu.is_some()),
                ];
                for (path, present) in required {
                    if !present {
                        errs.push(FieldError::new(path, "is required in aggregated mode"));
                    }
                }
            }
            Mode::Disaggregated => {
                let required = [
                    ("decodeGpus", self.decode_gpus.is_some()),
                    ("decodeReplicas", self.decode_replicas.is_some()),
                    ("prefillGpus", self.prefill_gpus.is_some()),
                    ("prefillReplicas", self.prefill_replicas.is_some()),
                ];
                for (path, present) in required {
                    if !present {
                        errs.push(FieldError::new(path, "is required in disaggregated mode"));
                    }
                }
            }
        }
        errs.sort();
        errs
    }

    /// Router mode written into manifests: a disaggregated topology can't work without a router.
    pub fn effective_router_mode(&self) -> RouterMode {
        if self.mode == Mode::Disaggregated && self.router_mode == RouterMode::None {
            RouterMode::RoundRobin
        } else {
            self.router_mode
        }
    }

    pub fn served_name(&self) -> &str {
        self.served_model_name.as_deref().unwrap_or(&self.model_id)
    }
}

// Functions

pub(crate) fn check_engine(
    cfg: &DeploymentConfig,
    provider: &str,
    allowed: &[Engine],
) -> Option<FieldError> {
    if allowed.contains(&cfg.engine) {
        None
    } else {
        let allowed = allowed
            .iter()
            .map(|engine| engine.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Some(FieldError::new(
            "engine",
            format!(
                "engine `{}` is not supported by provider `{provider}` (expected one of: {allowed})",
                cfg.engine
            ),
        ))
    }
}

pub(crate) fn check_mode(cfg: &DeploymentConfig, provider: &str, allowed: &[Mode]) -> Option<FieldError> {
    if allowed.contains(&cfg.mode) {
        None
    } else {
        Some(FieldError::new(
            "mode",
            format!("mode `{}` is not supported by provider `{provider}`", cfg.mode),
        ))
    }
}

pub(crate) fn check_provider(cfg: &DeploymentConfig, provider: &str) -> Option<FieldError> {
    if cfg.provider == provider {
        None
    } else {
        Some(FieldError::new(
            "provider",
            format!(
                "config targets provider `{}` but was submitted to `{provider}`",
                cfg.provider
            ),
        ))
    }
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn collect_validation_errors(prefix: &str, verrs: &ValidationErrors, out: &mut Vec<FieldError>) {
    for (field, kind) in verrs.errors() {
        let field = camel_case(field);
        let path = if prefix.is_empty() {
            field
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(errs) => {
                for err in errs {
                    let msg = err
                        .message
                        .as_ref()
                        .map(|msg| msg.to_string())
                        .unwrap_or_else(|| format!("is invalid ({})", err.code));
                    out.push(FieldError::new(path.clone(), msg));
                }
            }
            ValidationErrorsKind::Struct(verrs) => collect_validation_errors(&path, verrs, out),
            ValidationErrorsKind::List(items) => {
                for (idx, verrs) in items {
                    collect_validation_errors(&format!("{path}[{idx}]"), verrs, out);
                }
            }
        }
    }
}

fn validate_dns_label(value: &str) -> std::result::Result<(), ValidationError> {
    let valid = !value.is_empty()
        && value.len() <= DNS_LABEL_MAX_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !value.starts_with('-')
        && !value.ends_with('-');
    if valid {
        Ok(())
    } else {
        let mut err = ValidationError::new("dns_label");
        err.message = Some(
            "must be a DNS-1123 label (at most 63 lowercase alphanumerics or '-', starting and ending with an alphanumeric)"
                .into(),
        );
        Err(err)
    }
}

fn validate_engine_args(args: &BTreeMap<String, Value>) -> std::result::Result<(), ValidationError> {
    let invalid: Vec<&str> = args
        .iter()
        .filter(|(_, val)| !matches!(val, Value::Bool(_) | Value::Number(_) | Value::String(_)))
        .map(|(key, _)| key.as_str())
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        let mut err = ValidationError::new("scalar");
        err.message = Some(
            format!(
                "values must be strings, numbers or booleans (invalid keys: {})",
                invalid.join(", ")
            )
            .into(),
        );
        Err(err)
    }
}

// Tests
