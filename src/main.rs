//! Layer-Stack Controller
//!
//! Loads persisted layer records, merges satellite reports into them and
//! serves health and metrics endpoints.
//!
//! ```text
//! layerstack-controller load                     # load and summarize the graph
//! layerstack-controller merge --report r.json    # merge one report and persist
//! layerstack-controller serve                    # poll the report inbox
//! ```

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use layerstack_controller::{
    ControllerConfig, Error, InMemoryProviderAdapter, InboxConfig, JsonFileRecordStore,
    ReconcileMetrics, ReconcileService, ResourceRegistry, Result, SatelliteReport,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Layer-stack controller core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "LAYERSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// JSON document holding the persisted records
    #[arg(long, env = "LAYERSTACK_RECORDS")]
    records: Option<PathBuf>,

    /// JSON file with backend facts
    #[arg(long, env = "LAYERSTACK_FACTS")]
    facts: Option<PathBuf>,

    /// Extents a storage volume may overshoot its expected size by
    #[arg(long, env = "LAYERSTACK_TOLERANCE_FACTOR")]
    tolerance_factor: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the persisted graph and summarize it
    Load,

    /// Merge one satellite report and persist the result
    Merge {
        /// Report file (JSON)
        #[arg(long)]
        report: PathBuf,
    },

    /// Serve health/metrics and merge reports dropped into the inbox
    Serve {
        /// Inbox directory
        #[arg(long, env = "LAYERSTACK_INBOX")]
        inbox: Option<PathBuf>,

        /// Health server bind address
        #[arg(long, env = "HEALTH_ADDR")]
        health_addr: Option<String>,

        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR")]
        metrics_addr: Option<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => ControllerConfig::from_yaml_file(path)?,
        None => ControllerConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    info!("Starting Layer-Stack Controller");
    info!("  Version: {}", layerstack_controller::VERSION);
    info!("  Records: {}", config.records_path.display());
    info!("  Tolerance factor: {}", config.tolerance_factor);

    let service = build_service(&config).await?;
    service.load().await?;

    match &args.command {
        Command::Load => summarize(&service).await,
        Command::Merge { report } => merge_file(&service, report).await,
        Command::Serve { .. } => serve(Arc::new(service), &config).await,
    }
}

fn apply_overrides(config: &mut ControllerConfig, args: &Args) {
    if let Some(records) = &args.records {
        config.records_path = records.clone();
    }
    if let Some(facts) = &args.facts {
        config.facts_path = Some(facts.clone());
    }
    if let Some(factor) = args.tolerance_factor {
        config.tolerance_factor = factor;
    }
    if let Command::Serve {
        inbox,
        health_addr,
        metrics_addr,
    } = &args.command
    {
        if let Some(inbox) = inbox {
            config.inbox.dir = inbox.clone();
        }
        if let Some(addr) = health_addr {
            config.health_addr = addr.clone();
        }
        if let Some(addr) = metrics_addr {
            config.metrics_addr = addr.clone();
        }
    }
}

async fn build_service(config: &ControllerConfig) -> Result<ReconcileService> {
    let store = Arc::new(JsonFileRecordStore::new(&config.records_path));
    let adapter = match &config.facts_path {
        Some(path) => InMemoryProviderAdapter::from_json_file("facts", path).await?,
        None => InMemoryProviderAdapter::new("facts"),
    };

    Ok(ReconcileService::new(
        ResourceRegistry::new(),
        store,
        Arc::new(adapter),
        config,
    ))
}

// =============================================================================
// Commands
// =============================================================================

async fn summarize(service: &ReconcileService) -> Result<()> {
    let registry = service.registry();
    info!(
        resources = registry.resource_count(),
        layers = registry.layer_count(),
        "Layer graph loaded"
    );

    for key in registry.keys() {
        let handle = registry.get(&key)?;
        let resource = handle.lock().await;
        let stack: Vec<&str> = resource
            .metadata
            .layer_stack
            .iter()
            .map(|kind| kind.as_str())
            .collect();
        info!(
            resource = %key,
            stack = %stack.join(","),
            diskless = resource.metadata.diskless,
            volumes = resource.metadata.volume_numbers.len(),
            "Resource"
        );
    }
    Ok(())
}

async fn read_report(path: &Path) -> Result<SatelliteReport> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn merge_file(service: &ReconcileService, path: &Path) -> Result<()> {
    let report = read_report(path).await?;
    let summary = service.handle_report(&report).await?;
    info!(
        report = %path.display(),
        merged = summary.merged_volumes,
        tolerated = summary.tolerated_absences,
        changed = summary.changed_fields,
        drift = summary.drift.len(),
        "Report merged"
    );
    Ok(())
}

async fn serve(service: Arc<ReconcileService>, config: &ControllerConfig) -> Result<()> {
    let health_addr = config.health_addr.clone();
    let registry = service.registry().clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, registry).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = config.metrics_addr.clone();
    let metrics = service.metrics().clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::fs::create_dir_all(&config.inbox.dir).await?;
    info!(inbox = %config.inbox.glob_pattern(), "Watching report inbox");

    let mut inbox_interval = tokio::time::interval(config.inbox.poll_interval());
    let mut pool_interval = tokio::time::interval(config.pool_refresh_interval());
    loop {
        tokio::select! {
            _ = pool_interval.tick() => {
                if let Err(e) = service.refresh_free_space().await {
                    warn!(error = %e, "Storage pool refresh failed");
                }
            }
            _ = inbox_interval.tick() => {
                if let Err(e) = process_inbox(&service, &config.inbox).await {
                    error!(error = %e, "Inbox processing failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    info!("Controller shutdown complete");
    Ok(())
}

// =============================================================================
// Report Inbox
// =============================================================================

/// Merge every report file currently in the inbox
///
/// Processed files are renamed to `*.done` or `*.failed`.
async fn process_inbox(service: &ReconcileService, inbox: &InboxConfig) -> Result<usize> {
    let pattern = inbox.glob_pattern();
    let mut paths: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| Error::Configuration(format!("Invalid inbox pattern {}: {}", pattern, e)))?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Unreadable inbox entry");
                None
            }
        })
        .collect();
    paths.sort();

    let mut reports = Vec::with_capacity(paths.len());
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        match read_report(&path).await {
            Ok(report) => {
                reports.push(report);
                sources.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable report");
                finish(&path, "failed").await?;
            }
        }
    }

    let results = service.handle_reports(&reports).await;
    for (path, result) in sources.iter().zip(&results) {
        finish(path, if result.is_ok() { "done" } else { "failed" }).await?;
    }

    Ok(results.iter().filter(|result| result.is_ok()).count())
}

async fn finish(path: &Path, outcome: &str) -> Result<()> {
    let target = path.with_extension(format!("json.{}", outcome));
    tokio::fs::rename(path, &target).await?;
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, registry: Arc<ResourceRegistry>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if registry.is_loaded() => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "not loaded"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<ReconcileMetrics>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match (req.uri().path(), metrics.encode_text()) {
                        ("/metrics", Ok(text)) => {
                            let mut response = Response::new(Body::from(text));
                            response.headers_mut().insert(
                                CONTENT_TYPE,
                                HeaderValue::from_static("text/plain; version=0.0.4"),
                            );
                            response
                        }
                        ("/metrics", Err(e)) => {
                            let mut response = Response::new(Body::from(e.to_string()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
