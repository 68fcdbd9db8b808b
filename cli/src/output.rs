use std::io::{self, Write};

use clap::ValueEnum;
use llmdeck_core::{
    orchestrator::ProviderInfo,
    status::{DeploymentStatus, PodInfo},
};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

// OutputFormat

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

// Rows

#[derive(Tabled)]
struct ConditionRow {
    #[tabled(rename = "CONDITION")]
    kind: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "REASON")]
    reason: String,
    #[tabled(rename = "MESSAGE")]
    message: String,
}

#[derive(Tabled)]
struct DeploymentRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "NAMESPACE")]
    namespace: String,
    #[tabled(rename = "PROVIDER")]
    provider: String,
    #[tabled(rename = "ENGINE")]
    engine: String,
    #[tabled(rename = "MODE")]
    mode: String,
    #[tabled(rename = "PHASE")]
    phase: String,
    #[tabled(rename = "READY")]
    ready: String,
    #[tabled(rename = "MODEL")]
    model: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl From<&DeploymentStatus> for DeploymentRow {
    fn from(depl: &DeploymentStatus) -> Self {
        Self {
            name: depl.name.clone(),
            namespace: depl.namespace.clone(),
            provider: depl.provider.clone(),
            engine: depl.engine.to_string(),
            mode: depl.mode.to_string(),
            phase: depl.phase.to_string(),
            ready: format!("{}/{}", depl.replicas.ready, depl.replicas.desired),
            model: depl.model_id.clone(),
            created: depl.created_at.to_rfc3339(),
        }
    }
}

#[derive(Tabled)]
struct PodRow {
    #[tabled(rename = "POD")]
    name: String,
    #[tabled(rename = "PHASE")]
    phase: String,
    #[tabled(rename = "READY")]
    ready: &'static str,
    #[tabled(rename = "RESTARTS")]
    restarts: i32,
    #[tabled(rename = "NODE")]
    node: String,
}

#[derive(Tabled)]
struct ProviderRow {
    #[tabled(rename = "ID")]
    id: &'static str,
    #[tabled(rename = "NAME")]
    name: &'static str,
    #[tabled(rename = "NAMESPACE")]
    namespace: &'static str,
    #[tabled(rename = "INSTALLED")]
    installed: &'static str,
    #[tabled(rename = "STATUS")]
    status: String,
}

// Functions

pub fn write_deployments<W: Write>(
    out: &mut W,
    format: OutputFormat,
    deployments: &[DeploymentStatus],
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            write_table(out, deployments.iter().map(DeploymentRow::from))?;
            Ok(())
        }
        format => write_serialized(out, format, &deployments),
    }
}

pub fn write_deployment<W: Write>(
    out: &mut W,
    format: OutputFormat,
    depl: &DeploymentStatus,
) -> anyhow::Result<()> {
    if format != OutputFormat::Table {
        return write_serialized(out, format, depl);
    }
    writeln!(out, "Name:       {}", depl.name)?;
    writeln!(out, "Namespace:  {}", depl.namespace)?;
    writeln!(out, "Provider:   {}", depl.provider)?;
    writeln!(out, "Model:      {}", depl.model_id)?;
    writeln!(out, "Engine:     {}", depl.engine)?;
    writeln!(out, "Mode:       {}", depl.mode)?;
    writeln!(out, "Phase:      {}", depl.phase)?;
    writeln!(
        out,
        "Replicas:   {} desired, {} ready, {} available",
        depl.replicas.desired, depl.replicas.ready, depl.replicas.available
    )?;
    if let Some(prefill) = depl.prefill_replicas {
        writeln!(out, "Prefill:    {}/{} ready", prefill.ready, prefill.desired)?;
    }
    if let Some(decode) = depl.decode_replicas {
        writeln!(out, "Decode:     {}/{} ready", decode.ready, decode.desired)?;
    }
    writeln!(out, "Frontend:   {}", depl.frontend_service)?;
    writeln!(out, "Created:    {}", depl.created_at.to_rfc3339())?;
    if !depl.conditions.is_empty() {
        writeln!(out)?;
        let rows = depl.conditions.iter().map(|cond| ConditionRow {
            kind: cond.kind.clone(),
            status: cond.status.to_string(),
            reason: cond.reason.clone().unwrap_or_default(),
            message: cond.message.clone().unwrap_or_default(),
        });
        write_table(out, rows)?;
    }
    if !depl.pods.is_empty() {
        writeln!(out)?;
        write_pods(out, &depl.pods)?;
    }
    Ok(())
}

pub fn write_providers<W: Write>(
    out: &mut W,
    format: OutputFormat,
    providers: &[ProviderInfo],
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            let rows = providers.iter().map(|provider| ProviderRow {
                id: provider.id,
                name: provider.name,
                namespace: provider.default_namespace,
                installed: yes_no(provider.installation.installed),
                status: provider.installation.message.clone(),
            });
            write_table(out, rows)?;
            Ok(())
        }
        format => write_serialized(out, format, &providers),
    }
}

pub fn write_serialized<W: Write, VALUE: Serialize + ?Sized>(
    out: &mut W,
    format: OutputFormat,
    val: &VALUE,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, val)?;
            writeln!(out)?;
        }
        OutputFormat::Table | OutputFormat::Yaml => serde_yaml::to_writer(out, val)?,
    }
    Ok(())
}

fn write_pods<W: Write>(out: &mut W, pods: &[PodInfo]) -> io::Result<()> {
    let rows = pods.iter().map(|pod| PodRow {
        name: pod.name.clone(),
        phase: pod.phase.clone(),
        ready: yes_no(pod.ready),
        restarts: pod.restarts,
        node: pod.node_name.clone().unwrap_or_default(),
    });
    write_table(out, rows)
}

/// Borderless table, one header line then one line per row.
fn write_table<W: Write, ROW: Tabled, ROWS: IntoIterator<Item = ROW>>(
    out: &mut W,
    rows: ROWS,
) -> io::Result<()> {
    let mut table = Table::new(rows);
    table.with(Style::blank());
    writeln!(out, "{table}")
}

fn yes_no(val: bool) -> &'static str {
    if val {
        "yes"
    } else {
        "no"
    }
}

// Tests
