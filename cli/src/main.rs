use std::{
    io::{stdout, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use kube::Client;
use llmdeck_core::{
    clock::DefaultClock,
    err::Error,
    kube::DefaultKubeClient,
    orchestrator::{DeploymentOrchestrator, Pagination},
    process::repeat_until_sigint_or_sigterm,
    registry::ProviderRegistry,
    tracer::{init_tracer, LogFormat},
};
use output::OutputFormat;
use tracing::{debug, error, warn};

// Main

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = init_tracer(&args.log_filter, args.log_format) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    match run(args.cmd).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

// Mods

mod cmd;
mod output;

// Consts

const EXIT_CLIENT: u8 = 2;
const EXIT_NOT_FOUND: u8 = 3;
const EXIT_CONFLICT: u8 = 4;
const EXIT_FORBIDDEN: u8 = 5;
const EXIT_UNKNOWN: u8 = 1;

// Args

#[derive(Clone, Debug, Eq, Parser, PartialEq)]
#[command(version, about = "Deploy LLM inference workloads through pluggable serving runtimes")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
    #[arg(
        long,
        env,
        default_value = "llmdeck_cli=info,llmdeck_core=info,warn",
        global = true,
        long_help = "Log filter (https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives)"
    )]
    log_filter: String,
    #[arg(
        long,
        env,
        default_value_t = LogFormat::Compact,
        global = true,
        long_help = "Log format (compact, full or json)"
    )]
    log_format: LogFormat,
}

// Command

#[derive(Clone, Debug, Eq, PartialEq, Subcommand)]
enum Command {
    /// Validate a config and create the deployment it describes.
    Apply {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Delete a deployment, whatever its provider.
    Delete {
        name: String,
        #[arg(short, long, env = "LLMDECK_NAMESPACE", default_value = "default")]
        namespace: String,
    },
    /// Create a deployment. Fails if it already exists.
    Deploy {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Show a deployment with its conditions and pods.
    Get {
        name: String,
        #[arg(short, long, env = "LLMDECK_NAMESPACE", default_value = "default")]
        namespace: String,
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// List deployments of a namespace, or of every provider's namespace.
    List {
        #[command(flatten)]
        list: ListArgs,
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Print the logs of a pod.
    Logs {
        pod: String,
        #[arg(short, long, env = "LLMDECK_NAMESPACE", default_value = "default")]
        namespace: String,
        #[arg(short, long)]
        container: Option<String>,
        #[arg(long)]
        tail: Option<i64>,
    },
    /// List providers with their installation status.
    Providers {
        #[arg(long, long_help = "Print the Helm installation steps of every provider")]
        steps: bool,
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Validate a config and print the manifest it generates, without cluster access.
    Render {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Print the JSON schema of deployment configs.
    Schema,
    /// List deployments periodically until interrupted.
    Watch {
        #[command(flatten)]
        list: ListArgs,
        #[arg(long, default_value_t = 5, long_help = "Seconds between two listings")]
        interval: u64,
    },
}

// ConfigArgs

#[derive(clap::Args, Clone, Debug, Eq, PartialEq)]
struct ConfigArgs {
    #[arg(long_help = "Deployment config file (YAML or JSON)")]
    file: PathBuf,
    #[arg(long, long_help = "Provider processing the config, overriding its `provider` field")]
    provider: Option<String>,
}

// ListArgs

#[derive(clap::Args, Clone, Debug, Eq, PartialEq)]
struct ListArgs {
    #[arg(short, long, long_help = "Namespace to list; every provider's namespace when absent")]
    namespace: Option<String>,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long)]
    limit: Option<usize>,
}

impl ListArgs {
    fn page(&self) -> Pagination {
        Pagination {
            offset: self.offset,
            limit: self.limit,
        }
    }
}

// Functions

/// Exit code of a failed command, derived from the status code of the core error.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>().map(Error::status_code) {
        Some(400) => EXIT_CLIENT,
        Some(404) => EXIT_NOT_FOUND,
        Some(409) => EXIT_CONFLICT,
        Some(401 | 403) => EXIT_FORBIDDEN,
        _ => EXIT_UNKNOWN,
    }
}

async fn run(cmd: Command) -> anyhow::Result<()> {
    let mut out = stdout().lock();
    match cmd {
        Command::Render { config } => {
            let registry = ProviderRegistry::with_defaults();
            return cmd::render(&registry, &config.file, config.provider.as_deref(), &mut out);
        }
        Command::Schema => return cmd::schema(&mut out),
        _ => {}
    }
    debug!("connecting to cluster");
    let kube = Client::try_default().await?;
    let orch = DeploymentOrchestrator::new(
        ProviderRegistry::with_defaults(),
        Arc::new(DefaultKubeClient::new(kube)),
        Arc::new(DefaultClock),
    );
    match cmd {
        Command::Apply { config } => {
            cmd::apply(&orch, &config.file, config.provider.as_deref(), &mut out).await
        }
        Command::Delete { name, namespace } => cmd::delete(&orch, &name, &namespace, &mut out).await,
        Command::Deploy { config, output } => {
            cmd::deploy(
                &orch,
                &config.file,
                config.provider.as_deref(),
                output,
                &mut out,
            )
            .await
        }
        Command::Get {
            name,
            namespace,
            output,
        } => cmd::get(&orch, &name, &namespace, output, &mut out).await,
        Command::List { list, output } => {
            cmd::list(&orch, list.namespace.as_deref(), list.page(), output, &mut out).await
        }
        Command::Logs {
            pod,
            namespace,
            container,
            tail,
        } => cmd::logs(&orch, &pod, &namespace, container, tail, &mut out).await,
        Command::Providers { steps, output } => {
            cmd::providers(&orch, steps, output, &mut out).await
        }
        Command::Watch { list, interval } => {
            drop(out);
            let period = Duration::from_secs(interval.max(1));
            let orch = &orch;
            let list = &list;
            repeat_until_sigint_or_sigterm(period, move || async move {
                let mut out = Vec::new();
                let res = cmd::list(
                    orch,
                    list.namespace.as_deref(),
                    list.page(),
                    OutputFormat::Table,
                    &mut out,
                )
                .await;
                match res {
                    Ok(()) => {
                        let mut stdout = stdout().lock();
                        if let Err(err) = writeln!(stdout).and_then(|_| stdout.write_all(&out)) {
                            warn!("failed to write listing: {err}");
                        }
                    }
                    Err(err) => warn!("failed to list deployments: {err:#}"),
                }
            })
            .await?;
            Ok(())
        }
        Command::Render { .. } | Command::Schema => Ok(()),
    }
}

// Tests
