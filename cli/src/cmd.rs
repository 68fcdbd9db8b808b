use std::{fs::read_to_string, io::Write, path::Path};

use anyhow::{anyhow, Context};
use llmdeck_core::{
    clock::Clock,
    config::DeploymentConfig,
    err::Error,
    kube::KubeClient,
    orchestrator::{DeploymentOrchestrator, Pagination},
    registry::ProviderRegistry,
};
use schemars::schema_for;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::output::{
    write_deployment, write_deployments, write_providers, write_serialized, OutputFormat,
};

// Functions

#[instrument(skip(orch, path, provider, out), fields(config.path = %path.display()))]
pub async fn apply<CLOCK: Clock, KUBE: KubeClient, W: Write>(
    orch: &DeploymentOrchestrator<CLOCK, KUBE>,
    path: &Path,
    provider: Option<&str>,
    out: &mut W,
) -> anyhow::Result<()> {
    let (raw, provider) = load_config(path, provider)?;
    let (outcome, depl) = orch.apply_deployment(&raw, &provider).await?;
    writeln!(
        out,
        "{}/{} {}",
        depl.provider,
        depl.name,
        outcome.to_string().to_lowercase()
    )?;
    Ok(())
}

pub async fn delete<CLOCK: Clock, KUBE: KubeClient, W: Write>(
    orch: &DeploymentOrchestrator<CLOCK, KUBE>,
    name: &str,
    ns: &str,
    out: &mut W,
) -> anyhow::Result<()> {
    orch.delete_deployment(name, ns).await?;
    writeln!(out, "deployment `{name}` deleted from namespace `{ns}`")?;
    Ok(())
}

#[instrument(skip(orch, path, provider, format, out), fields(config.path = %path.display()))]
pub async fn deploy<CLOCK: Clock, KUBE: KubeClient, W: Write>(
    orch: &DeploymentOrchestrator<CLOCK, KUBE>,
    path: &Path,
    provider: Option<&str>,
    format: OutputFormat,
    out: &mut W,
) -> anyhow::Result<()> {
    let (raw, provider) = load_config(path, provider)?;
    let depl = orch.create_deployment(&raw, &provider).await?;
    write_deployments(out, format, &[depl])
}

pub async fn get<CLOCK: Clock, KUBE: KubeClient, W: Write>(
    orch: &DeploymentOrchestrator<CLOCK, KUBE>,
    name: &str,
    ns: &str,
    format: OutputFormat,
    out: &mut W,
) -> anyhow::Result<()> {
    let depl = orch.get_deployment(name, ns).await?;
    write_deployment(out, format, &depl)
}

pub async fn list<CLOCK: Clock, KUBE: KubeClient, W: Write>(
    orch: &DeploymentOrchestrator<CLOCK, KUBE>,
    ns: Option<&str>,
    page: Pagination,
    format: OutputFormat,
    out: &mut W,
) -> anyhow::Result<()> {
    let page = orch.list(ns, page).await?;
    match format {
        OutputFormat::Table => {
            write_deployments(out, format, &page.deployments)?;
            if page.has_more {
                writeln!(
                    out,
                    "({} of {} deployments shown, use --offset to see more)",
                    page.deployments.len(),
                    page.total
                )?;
            }
            Ok(())
        }
        format => write_serialized(out, format, &page),
    }
}

/// Reads a YAML or JSON config. `provider` overrides the config's own `provider` field.
pub fn load_config(path: &Path, provider: Option<&str>) -> anyhow::Result<(Value, String)> {
    debug!(config.path = %path.display(), "loading config");
    let content = read_to_string(path)
        .with_context(|| format!("failed to read config `{}`", path.display()))?;
    let mut raw: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config `{}`", path.display()))?;
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| anyhow!("config `{}` is not a mapping", path.display()))?;
    if let Some(provider) = provider {
        obj.insert("provider".into(), Value::String(provider.into()));
    }
    let provider = obj
        .get("provider")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| anyhow!("config has no `provider` field, use --provider"))?;
    Ok((raw, provider))
}

pub async fn logs<CLOCK: Clock, KUBE: KubeClient, W: Write>(
    orch: &DeploymentOrchestrator<CLOCK, KUBE>,
    pod: &str,
    ns: &str,
    container: Option<String>,
    tail: Option<i64>,
    out: &mut W,
) -> anyhow::Result<()> {
    let logs = orch.pod_logs(ns, pod, container, tail).await?;
    out.write_all(logs.as_bytes())?;
    Ok(())
}

pub async fn providers<CLOCK: Clock, KUBE: KubeClient, W: Write>(
    orch: &DeploymentOrchestrator<CLOCK, KUBE>,
    steps: bool,
    format: OutputFormat,
    out: &mut W,
) -> anyhow::Result<()> {
    let providers = orch.providers().await;
    write_providers(out, format, &providers)?;
    if steps {
        write_installation_steps(orch.registry(), out)?;
    }
    Ok(())
}

/// Validates a config and prints the manifest it generates, without touching the cluster.
pub fn render<W: Write>(
    registry: &ProviderRegistry,
    path: &Path,
    provider: Option<&str>,
    out: &mut W,
) -> anyhow::Result<()> {
    let (raw, provider) = load_config(path, provider)?;
    let provider = registry.get(&provider)?;
    let cfg = provider.validate_config(&raw).map_err(Error::Validation)?;
    let manifest = provider.generate_manifest(&cfg);
    serde_yaml::to_writer(out, &manifest)?;
    Ok(())
}

pub fn schema<W: Write>(out: &mut W) -> anyhow::Result<()> {
    let schema = schema_for!(DeploymentConfig);
    serde_json::to_writer_pretty(&mut *out, &schema)?;
    writeln!(out)?;
    Ok(())
}

fn write_installation_steps<W: Write>(registry: &ProviderRegistry, out: &mut W) -> anyhow::Result<()> {
    for provider in registry.providers() {
        writeln!(out)?;
        writeln!(out, "# {} ({})", provider.name(), provider.id())?;
        for (idx, step) in provider.installation_steps().iter().enumerate() {
            writeln!(out, "{}. {}", idx + 1, step.title)?;
            if let Some(cmd) = &step.command {
                writeln!(out, "   {cmd}")?;
            }
        }
    }
    Ok(())
}

// Tests
