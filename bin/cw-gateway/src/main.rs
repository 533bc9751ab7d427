//! CorpWire Gateway
//!
//! Receives platform callbacks for every configured tenant and keeps their
//! access credentials fresh.

mod handlers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cw_api::create_router;
use cw_callback::{CallbackCrypto, CallbackService, EventDispatcher, EventKind};
use cw_client::{PlatformClient, SignedRequestExecutor};
use cw_common::{InMemoryTenantDirectory, SystemClock};
use cw_config::{GatewayConfig, LogFormat, LoggingConfig};
use cw_credential::{CredentialStore, PlatformTokenSource, StoreConfig, TokenSourceConfig};

use handlers::{AuthLifecycleLogger, WelcomeSender};

/// CorpWire callback gateway
#[derive(Parser, Debug)]
#[command(name = "cw-gateway")]
#[command(about = "Multi-tenant callback gateway with credential refresh")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "CW_CONFIG", default_value = "config/gateway.toml")]
    config: PathBuf,

    /// Greeting sent to newly added external contacts
    #[arg(long, env = "CW_WELCOME_TEXT")]
    welcome_text: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_tracing(&config.logging);

    info!("Starting CorpWire Gateway");

    let directory = Arc::new(InMemoryTenantDirectory::from_tenants(config.build_tenants()?));
    info!(tenants = directory.len(), "Tenant directory ready");

    let source = PlatformTokenSource::new(TokenSourceConfig {
        base_url: config.platform.base_url.clone(),
        connect_timeout: config.platform.connect_timeout(),
        request_timeout: config.platform.request_timeout(),
        fatal_codes: config.credentials.fatal_codes.clone(),
    })?;
    let store = CredentialStore::new(
        StoreConfig {
            safety_margin: config.credentials.safety_margin(),
            refresh_timeout: config.credentials.refresh_timeout(),
            wait_timeout: config.credentials.wait_timeout(),
        },
        directory.clone(),
        Arc::new(source),
        Arc::new(SystemClock),
    );

    let executor = SignedRequestExecutor::new(
        cw_client::ExecutorConfig {
            base_url: config.platform.base_url.clone(),
            connect_timeout: config.platform.connect_timeout(),
            request_timeout: config.platform.request_timeout(),
            rejection_codes: config.executor.rejection_codes.clone(),
            max_transport_attempts: config.executor.max_transport_attempts,
            transport_backoff: config.executor.transport_backoff(),
            call_timeout: config.executor.call_timeout(),
        },
        store.clone(),
    )?;
    let client = PlatformClient::new(Arc::new(executor));

    let dispatcher = Arc::new(EventDispatcher::new(store).with_handler_timeout(config.server.handler_timeout()));
    for kind in [EventKind::CreateAuth, EventKind::ChangeAuth, EventKind::CancelAuth] {
        dispatcher.register_global(kind, Arc::new(AuthLifecycleLogger));
    }
    match args.welcome_text {
        Some(text) => {
            dispatcher.register_global(
                EventKind::ChangeExternalContact,
                Arc::new(WelcomeSender::new(client, text)),
            );
            info!("Welcome messages enabled");
        }
        None => info!("No welcome text configured, external contact changes are only acknowledged"),
    }

    let service = CallbackService::new(CallbackCrypto::new(directory), dispatcher);
    let app = create_router(service).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Callback server listening");

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!("Callback server error: {}", e);
        return Err(e.into());
    }

    info!("CorpWire Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
