use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use scene_render::cache::ContentKey;
use scene_render::config::{RenderQuality, ServiceConfig};
use scene_render::context::{RenderContext, RendererHealth, check_renderer};
use scene_render::degrade::provision_placeholder;
use scene_render::manifest::Manifest;
use scene_render::observability::log_snapshot;
#[cfg(feature = "metrics-server")]
use scene_render::observability::server::MetricsServer;
use scene_render::pipeline::Pipeline;
use scene_render::presets::generate_preset;
use scene_render::request::{RenderPayload, RenderRequest};
use scene_render::sanitize::sanitize;
use scene_render::validation::{ValidationReport, validate_config, validate_manifest};
use serde::Serialize;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match command {
        Commands::Render {
            source,
            request_id,
            step,
            payload,
            settings,
        } => render_command(source, request_id, step, payload, settings),
        Commands::Run {
            manifest,
            workers,
            dry_run,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint,
            settings,
        } => {
            let _ = otlp_endpoint; // consumed by configure_tracing
            run_manifest(
                manifest,
                workers,
                dry_run,
                MetricsOutputs {
                    print: print_metrics,
                    json: metrics_json,
                    prometheus: metrics_prometheus,
                    listen: metrics_listen,
                },
                settings,
            )
        }
        Commands::Status { request_id, config } => status_command(&request_id, config),
        Commands::Cache { action } => cache_command(action),
        Commands::Check { config } => check_command(config),
        Commands::Config { action } => config_command(action),
        Commands::Sanitize { source, json } => sanitize_command(&source, json),
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                env!("CARGO_PKG_NAME"),
                &mut io::stdout(),
            );
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command output (JSON, sanitized source).
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "scene-render")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(fmt_layer)
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(fmt_layer)
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

/// Loads the config and applies command-line overrides.
fn load_settings(settings: &RenderSettings) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load_or_default(settings.config.as_deref())?;
    if let Some(quality) = settings.quality {
        config.renderer.quality = quality;
    }
    if let Some(timeout) = settings.timeout {
        config.renderer.timeout_secs = timeout;
    }
    if settings.skip_health_check {
        config.renderer.health_check = false;
    }

    let report = validate_config(&config);
    let label = settings
        .config
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<defaults>".to_string());
    report_validation(&label, &report, "Configuration")?;
    Ok(config)
}

fn build_pipeline(config: ServiceConfig) -> Result<Pipeline> {
    let placeholder = provision_placeholder(&config)?;
    info!(
        path = %placeholder.path.display(),
        bytes = placeholder.bytes,
        "Placeholder ready"
    );

    let ctx = RenderContext::initialize(config);
    if !ctx.health.is_usable() {
        warn!(health = ?ctx.health, "Renderer is unhealthy; requests will degrade to the placeholder");
    }
    Pipeline::from_context(ctx)
}

fn read_source(source: &Path) -> Result<String> {
    if source == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read scene source from stdin")?;
        return Ok(buffer);
    }
    fs::read_to_string(source)
        .with_context(|| format!("Failed to read scene source: {}", source.display()))
}

fn render_command(
    source: PathBuf,
    request_id: Option<String>,
    step: Option<u32>,
    payload: bool,
    settings: RenderSettings,
) -> Result<()> {
    let input = read_source(&source)?;
    let request = if payload {
        let mut parsed: RenderPayload =
            serde_json::from_str(&input).context("Failed to parse render payload JSON")?;
        if request_id.is_some() {
            parsed.request_id = request_id;
        }
        if step.is_some() {
            parsed.step = step;
        }
        RenderRequest::from_payload(parsed)?
    } else {
        RenderRequest::new(input, request_id.as_deref(), step)?
    };

    let pipeline = build_pipeline(load_settings(&settings)?)?;
    let response = pipeline.process(&request);
    print_json(&response)
}

struct MetricsOutputs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
    listen: Option<String>,
}

fn run_manifest(
    manifest_path: PathBuf,
    workers: Option<usize>,
    dry_run: bool,
    metrics: MetricsOutputs,
    settings: RenderSettings,
) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    report_validation(
        &manifest_path.display().to_string(),
        &validate_manifest(&manifest),
        "Manifest",
    )?;

    let base_dir = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let planned = manifest.expand(&base_dir)?;
    if planned.is_empty() {
        warn!("Manifest resolved no requests. Nothing to render.");
        return Ok(());
    }

    if dry_run {
        for item in &planned {
            info!(
                source = %item.path.display(),
                request_id = item.request.request_id(),
                step = item.request.step(),
                "Planned render"
            );
        }
        info!(requests = planned.len(), "Dry run complete");
        return Ok(());
    }

    let workers = workers
        .or(manifest.workers)
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
    let pipeline = build_pipeline(load_settings(&settings)?)?;
    let metrics_handle = pipeline.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &metrics.listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(
            addr,
            metrics_handle.clone(),
            pipeline.context().health.clone(),
        )?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &metrics.listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let requests: Vec<RenderRequest> = planned.into_iter().map(|item| item.request).collect();
    let responses = pipeline.run_batch(&requests, workers);
    for response in &responses {
        if response.is_degraded() {
            warn!(
                request_id = %response.request_id,
                step = response.step,
                state = ?response.state,
                "Render degraded"
            );
        } else {
            info!(
                request_id = %response.request_id,
                step = response.step,
                url = %response.url,
                cached = response.cached,
                "Render completed"
            );
        }
    }
    print_json(&responses)?;

    if metrics.print || metrics.json.is_some() || metrics.prometheus.is_some() {
        let snapshot = metrics_handle.snapshot();
        if metrics.print {
            log_snapshot(&snapshot);
        }
        if let Some(path) = metrics.json {
            ensure_parent(&path)?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = metrics.prometheus {
            ensure_parent(&path)?;
            fs::write(&path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    Ok(())
}

fn status_command(request_id: &str, config: Option<PathBuf>) -> Result<()> {
    let config = ServiceConfig::load_or_default(config.as_deref())?;
    let ctx = RenderContext::with_health(config, RendererHealth::Unchecked);
    let pipeline = Pipeline::from_context(ctx)?;
    let report = pipeline
        .status(request_id)
        .with_context(|| format!("Failed to load status for request '{request_id}'"))?;
    print_json(&report)
}

fn cache_command(command: CacheCommands) -> Result<()> {
    match command {
        CacheCommands::Lookup { source, config } => {
            let config = ServiceConfig::load_or_default(config.as_deref())?;
            let sanitized = sanitize(&read_source(&source)?);
            let key = ContentKey::of(&sanitized.source);
            let ctx = RenderContext::with_health(config, RendererHealth::Unchecked);
            let pipeline = Pipeline::from_context(ctx)?;
            let url = pipeline.cache().lookup(&key);
            if url.is_none() {
                info!(content_key = %key, "Cache miss");
            }
            print_json(&CacheLookup {
                content_key: key.to_string(),
                url,
            })
        }
    }
}

#[derive(Serialize)]
struct CacheLookup {
    content_key: String,
    url: Option<String>,
}

fn check_command(config: Option<PathBuf>) -> Result<()> {
    let config = ServiceConfig::load_or_default(config.as_deref())?;
    let health = check_renderer(&config);
    print_json(&health)?;
    if health.is_usable() {
        Ok(())
    } else {
        Err(anyhow!("Renderer health check failed"))
    }
}

fn config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("config/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset config generated"
            );
            Ok(())
        }
        ConfigCommands::Validate { config } => {
            let loaded = ServiceConfig::load(&config)?;
            let report = validate_config(&loaded);
            report_validation(&config.display().to_string(), &report, "Configuration")?;
            info!(file = %config.display(), "Configuration validation passed");
            Ok(())
        }
    }
}

fn sanitize_command(source: &Path, json: bool) -> Result<()> {
    let sanitized = sanitize(&read_source(source)?);
    if json {
        return print_json(&sanitized);
    }
    info!(scene = %sanitized.scene, outcome = ?sanitized.outcome, "Sanitized scene source");
    let mut stdout = io::stdout().lock();
    stdout.write_all(sanitized.source.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn report_validation(label: &str, report: &ValidationReport, what: &str) -> Result<()> {
    for warning in &report.warnings {
        warn!(file = %label, "{warning}");
    }
    if report.is_ok() {
        return Ok(());
    }
    for error_msg in &report.errors {
        error!(file = %label, "{error_msg}");
    }
    Err(anyhow!(
        "{what} validation failed with {} error(s)",
        report.errors.len()
    ))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create metrics directory: {}", parent.display()))?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    to_writer_pretty(&mut stdout, value).context("Failed to write JSON output")?;
    writeln!(stdout)?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "Scene render orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RenderSettings {
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    quality: Option<RenderQuality>,
    /// Renderer timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long = "skip-health-check")]
    skip_health_check: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one scene source (`-` reads stdin).
    Render {
        #[arg(value_hint = ValueHint::FilePath)]
        source: PathBuf,
        #[arg(long = "request-id")]
        request_id: Option<String>,
        #[arg(long)]
        step: Option<u32>,
        /// Treat the input as a JSON payload `{code, request_id, step}`.
        #[arg(long)]
        payload: bool,
        #[command(flatten)]
        settings: RenderSettings,
    },
    /// Render every request listed in a manifest.
    Run {
        #[arg(value_hint = ValueHint::FilePath)]
        manifest: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
        #[command(flatten)]
        settings: RenderSettings,
    },
    /// Show the step timeline recorded for a request.
    Status {
        request_id: String,
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
    /// Run the renderer health check.
    Check {
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Print the sanitized form of a scene source.
    Sanitize {
        #[arg(value_hint = ValueHint::FilePath)]
        source: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Look up the cached URL for a scene source.
    Lookup {
        #[arg(value_hint = ValueHint::FilePath)]
        source: PathBuf,
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Validate {
        config: PathBuf,
    },
}
