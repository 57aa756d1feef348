use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use skiff_api::{ClusterApi, HttpApi, HttpConfig};
use skiff_core::{ResourceKey, ResourceKind};
use skiff_ops::{Action, Dispatcher, EpicSet, Operation, OperationRequest, OpsConfig, Payload};
use skiff_store::{event_log_cap_from_env, spawn_reducer, RequestStatus, StoreSnapshot};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "skiffctl", version, about = "Skiff console CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// REST base URL, including the `/api` prefix
    #[arg(long = "url", global = true, env = "SKIFF_API_URL")]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct Target {
    /// Resource kind, e.g. broker, workers, shabondi
    #[arg(value_parser = parse_kind)]
    kind: ResourceKind,
    #[arg(long = "group", default_value = skiff_core::DEFAULT_GROUP)]
    group: String,
    #[arg(long = "name")]
    name: String,
    /// JSON body for create/update
    #[arg(long = "body")]
    body: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a service and wait until it is RUNNING
    Start(Target),
    /// Stop a service and wait until its state is gone
    Stop(Target),
    /// Delete a resource and wait until it is no longer listed
    Delete(Target),
    Create(Target),
    Update(Target),
    /// Fetch one resource
    Get(Target),
    /// Load all pipelines and workspaces
    Init,
}

fn parse_kind(s: &str) -> Result<ResourceKind, String> {
    ResourceKind::from_str(s).map_err(|e| e.to_string())
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_action(action: &Action, output: Output) {
    match output {
        Output::Json => match serde_json::to_string(action) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "failed to encode action"),
        },
        Output::Human => {
            let detail = match &action.payload {
                Payload::Empty => String::new(),
                Payload::Id { id } => format!("id={}", id),
                Payload::Name { name } => format!("name={}", name),
                Payload::Success(s) => {
                    let rows: usize = s.normalized.entities.values().map(|r| r.len()).sum();
                    format!("rows={}", rows)
                }
                Payload::Removed(r) => format!("removed {} id={}", r.entity, r.id),
                Payload::Failure(f) => f.title.clone(),
                Payload::EventLog(e) => format!("[{:?}] {}", e.level, e.failure.title),
            };
            println!("{:<32} {}", action.type_name(), detail);
        }
    }
}

/// Decide the exit status from the final store snapshot.
fn check_outcome(snap: &StoreSnapshot, key: Option<&ResourceKey>) -> Result<()> {
    match key {
        Some(key) => match snap.status.get(&key.id()) {
            Some(RequestStatus::Failed { title, .. }) => bail!("{}", title),
            Some(RequestStatus::Pending { routine }) => bail!("{} did not finish", routine),
            _ => Ok(()),
        },
        None if snap.initialized => Ok(()),
        None => bail!("initialization did not complete"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut http = HttpConfig::from_env();
    if let Some(url) = cli.url.clone() {
        http.base_url = url;
    }
    let api: Arc<dyn ClusterApi> = Arc::new(HttpApi::new(&http)?);
    let cfg = OpsConfig::from_env();
    info!(url = %http.base_url, ?cfg, "skiffctl starting");

    let (out, mut rx) = Dispatcher::channel();
    let (store_tx, store_rx) = mpsc::unbounded_channel();
    let (store, reducer) = spawn_reducer(event_log_cap_from_env(), store_rx);
    let output = cli.output;
    let printer = tokio::spawn(async move {
        while let Some(action) = rx.recv().await {
            print_action(&action, output);
            let _ = store_tx.send(action);
        }
    });
    let set = EpicSet::spawn(api, &cfg, out);

    let (op, target) = match cli.command {
        Commands::Start(t) => (Some(Operation::Start), Some(t)),
        Commands::Stop(t) => (Some(Operation::Stop), Some(t)),
        Commands::Delete(t) => (Some(Operation::Delete), Some(t)),
        Commands::Create(t) => (Some(Operation::Create), Some(t)),
        Commands::Update(t) => (Some(Operation::Update), Some(t)),
        Commands::Get(t) => (Some(Operation::Fetch), Some(t)),
        Commands::Init => (None, None),
    };
    let key = match (op, target) {
        (Some(op), Some(t)) => {
            let key = ResourceKey::new(t.group, t.name);
            let body = match t.body {
                Some(raw) => serde_json::from_str(&raw).context("parsing --body as JSON")?,
                None => serde_json::Value::Null,
            };
            set.dispatch(t.kind, op, OperationRequest::new(key.clone()).with_body(body))
                .with_context(|| format!("dispatching {} {}", op, t.kind))?;
            Some(key)
        }
        _ => {
            set.initialize_app().context("dispatching init")?;
            None
        }
    };

    let interrupted = tokio::select! {
        _ = set.shutdown() => false,
        _ = signal::ctrl_c() => true,
    };
    if interrupted {
        warn!("interrupted; pending operations abandoned");
        bail!("interrupted");
    }
    printer.await?;
    reducer.await?;
    check_outcome(&store.current(), key.as_ref())
}
