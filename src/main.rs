use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway::auth::{GitHubAuth, TokenIssuer};
use gateway::cache::TokenCache;
use gateway::clock::{Clock, SystemClock};
use gateway::config::{self, Config};
use gateway::models::token::mask;
use gateway::store::TokenStore;
use gateway::{api, cli, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let mut cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { listen, token_file }) => {
            if let Some(listen) = listen {
                cfg.listen_addr = listen;
            }
            if let Some(token_file) = token_file {
                cfg.token_file = token_file;
            }
            run_server(cfg).await
        }
        Some(cli::Commands::Status {
            token_file,
            offline,
        }) => {
            if let Some(token_file) = token_file {
                cfg.token_file = token_file;
            }
            run_status(cfg, offline).await
        }
        None => run_server(cfg).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "copilot-gateway"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let (text_layer, json_layer) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "gateway=debug,copilot_gateway=debug,tower_http=debug".into()
            }),
        ))
        .with(text_layer)
        .with(json_layer)
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn run_server(cfg: Config) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    tracing::info!("Loading token cache...");
    let tokens = TokenCache::open(TokenStore::new(&cfg.token_file), clock, cfg.token_margin).await;

    let issuer: Arc<dyn TokenIssuer> = Arc::new(GitHubAuth::from_config(&cfg)?);
    let addr = cfg.listen_addr;
    let state = Arc::new(AppState::new(cfg, tokens, issuer)?);
    let app = api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Copilot gateway listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Flushing token cache...");
    state.tokens().flush().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn run_status(cfg: Config, offline: bool) -> anyhow::Result<()> {
    let now = SystemClock.now();
    let margin = chrono::Duration::from_std(cfg.token_margin).context("invalid token margin")?;
    let tokens = TokenStore::new(&cfg.token_file)
        .load(now)
        .await
        .with_context(|| format!("failed to read {}", cfg.token_file.display()))?;

    let mut usable: Vec<_> = tokens
        .into_iter()
        .filter(|(_, token)| token.is_usable_at(now, margin))
        .collect();
    usable.sort_by(|a, b| a.0.cmp(&b.0));

    if usable.is_empty() {
        anyhow::bail!(
            "no usable Copilot tokens in {}; log in through /login first",
            cfg.token_file.display()
        );
    }

    println!("{:<16} {:<26} {}", "CREDENTIAL", "EXPIRES", "REMAINING");
    for (credential, token) in &usable {
        let remaining = token.expiry() - now;
        println!(
            "{:<16} {:<26} {}s",
            mask(credential),
            token.expiry().to_rfc3339(),
            remaining.num_seconds()
        );
    }

    if offline {
        return Ok(());
    }

    let (credential, _) = &usable[0];
    let auth = GitHubAuth::from_config(&cfg)?;
    let fresh = auth
        .issue_token(credential)
        .await
        .with_context(|| format!("GitHub rejected credential {}", mask(credential)))?;
    println!(
        "verified {} against GitHub; new token expires {}",
        mask(credential),
        fresh.expiry().to_rfc3339()
    );
    Ok(())
}
