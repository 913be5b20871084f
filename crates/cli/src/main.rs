use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use cairn_apply::{restore_archive, ReplayReport, RetryPolicy};
use cairn_kubehub::{KubeBackend, KubeDiscovery, ResourceInfo};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cairnctl", version, about = "Back up and restore Kubernetes namespaces as tar.gz manifest archives")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path to kubeconfig file (default: KUBECONFIG, ~/.kube/config or in-cluster)
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture a namespace into backup-<ns>-<timestamp>.tar.gz
    Backup {
        namespace: Option<String>,
        #[arg(short = 'n', long = "namespace")]
        namespace_flag: Option<String>,
        /// Directory the archive is written to
        #[arg(long = "out-dir", default_value = ".")]
        out_dir: PathBuf,
    },
    /// Create or update every manifest of an archive, in archive order
    Restore {
        /// Backup archive (tar.gz)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Namespace for namespaced manifests that declare none
        #[arg(short = 'n', long = "namespace", default_value = "")]
        namespace: String,
        /// Extra attempts for an object whose update lost a concurrency race
        #[arg(long = "conflict-retries", default_value_t = 0)]
        conflict_retries: u32,
        #[arg(long = "retry-backoff-ms", default_value_t = 500)]
        retry_backoff_ms: u64,
    },
    /// List the objects a backup of the namespace would capture
    Ls {
        namespace: Option<String>,
        #[arg(short = 'n', long = "namespace")]
        namespace_flag: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("CAIRN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CAIRN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CAIRN_METRICS_ADDR; expected host:port");
        }
    }
}

/// `-n` wins over the positional argument; one of them is required.
fn pick_namespace(positional: Option<String>, flag: Option<String>) -> Result<String> {
    flag.filter(|s| !s.is_empty())
        .or(positional.filter(|s| !s.is_empty()))
        .ok_or_else(|| anyhow!("namespace is required; pass it as an argument or with --namespace"))
}

fn print_report(output: Output, report: &ReplayReport) -> Result<()> {
    match output {
        Output::Human => {
            println!("restored {} entries: {} created, {} updated", report.entries, report.created, report.updated);
            if report.skipped_empty > 0 {
                println!("skipped {} empty entries", report.skipped_empty);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn render_resources(namespace: &str, resources: &[ResourceInfo]) -> String {
    if resources.is_empty() {
        return format!("No resources found in namespace '{}'\n", namespace);
    }
    let mut out = format!("{:<24} {:<40} {:<20} API VERSION\n", "KIND", "NAME", "NAMESPACE");
    for r in resources {
        out.push_str(&format!("{:<24} {:<40} {:<20} {}\n", r.kind, r.name, r.namespace, r.api_version));
    }
    out.push_str(&format!("\ntotal: {}\n", resources.len()));
    out
}

async fn run(cli: Cli) -> Result<()> {
    let kubeconfig = cli.kubeconfig.as_deref();
    match cli.command {
        Commands::Backup { namespace, namespace_flag, out_dir } => {
            let ns = pick_namespace(namespace, namespace_flag)?;
            info!(ns = %ns, out_dir = %out_dir.display(), "backup invoked");
            let client = cairn_kubehub::connect(kubeconfig).await?;
            let path = cairn_kubehub::backup_namespace(&client, &ns, &out_dir).await?;
            match cli.output {
                Output::Human => println!("backup written to {}", path.display()),
                Output::Json => println!("{}", serde_json::json!({ "namespace": ns, "archive": path })),
            }
        }
        Commands::Restore { file, namespace, conflict_retries, retry_backoff_ms } => {
            info!(file = %file.display(), fallback_ns = %namespace, "restore invoked");
            let client = cairn_kubehub::connect(kubeconfig).await?;
            let discovery = KubeDiscovery::new(client.clone());
            let backend = KubeBackend::new(client);
            let retry = RetryPolicy { conflict_retries, backoff: Duration::from_millis(retry_backoff_ms) };
            tokio::select! {
                res = restore_archive(&file, &discovery, &backend, &namespace, retry) => {
                    print_report(cli.output, &res?)?;
                }
                _ = signal::ctrl_c() => {
                    warn!("Ctrl-C received; restore interrupted, objects applied so far are kept");
                    return Err(anyhow!("restore interrupted"));
                }
            }
        }
        Commands::Ls { namespace, namespace_flag } => {
            let ns = pick_namespace(namespace, namespace_flag)?;
            info!(ns = %ns, "ls invoked");
            let client = cairn_kubehub::connect(kubeconfig).await?;
            let resources = cairn_kubehub::list_resources(&client, &ns).await?;
            match cli.output {
                Output::Human => print!("{}", render_resources(&ns, &resources)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cmd = match &cli.command {
        Commands::Backup { .. } => "backup",
        Commands::Restore { .. } => "restore",
        Commands::Ls { .. } => "ls",
    };
    if let Err(e) = run(cli).await {
        error!(error = ?e, "{} failed", cmd);
        eprintln!("{} error: {:#}", cmd, e);
        std::process::exit(1);
    }
}
