use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;

use sw_domain::config::{Config, ObservabilityConfig};
use sw_gateway::bootstrap;
use sw_gateway::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to chat when no subcommand is given.
        None => {
            init_cli_tracing();
            let (config, _) = sw_gateway::cli::load_config()?;
            sw_gateway::cli::chat::chat(Arc::new(config), None, false).await
        }
        Some(Command::Chat { session, offline }) => {
            init_cli_tracing();
            let (config, _) = sw_gateway::cli::load_config()?;
            sw_gateway::cli::chat::chat(Arc::new(config), session, offline).await
        }
        Some(Command::Run { message, session, json, save, offline }) => {
            init_cli_tracing();
            let (config, _) = sw_gateway::cli::load_config()?;
            sw_gateway::cli::run::run(Arc::new(config), message, session, json, save, offline).await
        }
        Some(Command::Quota { json }) => {
            init_cli_tracing();
            let (config, _) = sw_gateway::cli::load_config()?;
            sw_gateway::cli::quota::quota(Arc::new(config), json).await
        }
        Some(Command::Monitor) => {
            let (config, _) = sw_gateway::cli::load_config()?;
            let tracer_provider = init_tracing(&config.observability);
            run_monitor(Arc::new(config), tracer_provider).await
        }
        Some(Command::Ideas) => {
            init_cli_tracing();
            let (config, _) = sw_gateway::cli::load_config()?;
            sw_gateway::cli::ideas::ideas(Arc::new(config))
        }
        Some(Command::Settings(command)) => {
            init_cli_tracing();
            let (config, _) = sw_gateway::cli::load_config()?;
            sw_gateway::cli::settings::run(Arc::new(config), command)
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = sw_gateway::cli::load_config()?;
            if !sw_gateway::cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _) = sw_gateway::cli::load_config()?;
            sw_gateway::cli::config::show(&config)
        }
        Some(Command::Version) => {
            println!("slipway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured tracing for the long-running `monitor` command.
///
/// When `otlp_endpoint` is configured, an OpenTelemetry layer is added
/// so that every `tracing` span is also exported as an OTel span via
/// OTLP/gRPC. The returned [`SdkTracerProvider`] handle must be shut
/// down on exit to flush pending spans.
///
/// [`SdkTracerProvider`]: opentelemetry_sdk::trace::SdkTracerProvider
fn init_tracing(
    obs: &ObservabilityConfig,
) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sw_gateway=debug"));

    let fmt_layer = if obs.json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().boxed()
    };

    let Some(endpoint) = &obs.otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return None;
    };

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!(
                "WARNING: failed to create OTLP exporter for {endpoint}: {e}; \
                 starting without OpenTelemetry"
            );
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
            return None;
        }
    };

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(obs.service_name.clone())
        .build();

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(
            obs.sample_rate,
        ))
        .with_resource(resource)
        .build();

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("slipway"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Some(tracer_provider)
}

/// Initialize compact stderr-only tracing for interactive and one-shot
/// commands.
///
/// Defaults to `warn` level so diagnostic output does not pollute stdout.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Sample quota in the foreground until interrupted.
async fn run_monitor(
    config: Arc<Config>,
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
) -> anyhow::Result<()> {
    tracing::info!("Slipway monitor starting");

    let state = bootstrap::build_app_state(config)?;
    let tasks = bootstrap::spawn_background_tasks(&state);
    if tasks.is_empty() {
        tracing::warn!("no quota source configured or allocator disabled, nothing to sample");
    }

    shutdown_signal().await;
    state.shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }

    // Flush and shut down the OTel tracer provider so pending spans
    // are exported before the process exits.
    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = ?e, "OpenTelemetry tracer provider shutdown failed");
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT, shutting down");
    }
}
