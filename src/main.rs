use fngate::backend::lambda::LambdaProvider;
use fngate::backend::memory::MemoryProvider;
use fngate::backend::{ClientSettings, FunctionClient, FunctionProvider};
use fngate::config::{Config, ProviderType, RegistryType};
use fngate::control::{ControlApi, ControlApiConfig, PKG_NAME, VERSION};
use fngate::db::SqliteRegistry;
use fngate::proxy::{ProxyServer, ProxySettings};
use fngate::registry::{MemoryRegistry, SharedRegistry};
use fngate::service::AppService;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fngate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("fngate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let registry: SharedRegistry = match config.registry.registry_type {
        RegistryType::Memory => {
            warn!("Using in-memory registry; app records are lost on restart");
            Arc::new(MemoryRegistry::new())
        }
        RegistryType::Sqlite => Arc::new(SqliteRegistry::open(&config.registry.path)?),
    };

    let provider: Arc<dyn FunctionProvider> = match config.provider.provider_type {
        ProviderType::Lambda => Arc::new(LambdaProvider::new(&config.provider)?),
        ProviderType::Memory => {
            warn!("Using in-process function provider; functions echo their events");
            Arc::new(MemoryProvider::new())
        }
    };

    let functions = Arc::new(FunctionClient::new(
        provider,
        ClientSettings::from(&config.provider),
    ));
    let service = Arc::new(
        AppService::new(registry, functions).with_serialized_deploys(config.server.serialize_deploys),
    );

    // Create shutdown channel; the token aborts in-flight activation waits
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cancel = CancellationToken::new();

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid proxy bind address: {}", e))?;
    let control_addr: SocketAddr = format!("{}:{}", config.server.control_bind, config.server.control_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid control API bind address: {}", e))?;

    // Generate or use configured control token
    let control_token = config.server.control_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated control API token (configure control_token to set a fixed value)");
        token
    });

    let proxy = ProxyServer::new(
        proxy_addr,
        Arc::clone(&service),
        ProxySettings {
            request_timeout: config.server.request_timeout(),
            max_body_bytes: config.server.max_body_bytes,
        },
        shutdown_rx.clone(),
    );

    let control = Arc::new(ControlApi::new(
        ControlApiConfig {
            bind_addr: control_addr,
            auth_token: control_token,
            deploy_timeout: config.server.deploy_timeout(),
            max_artifact_bytes: config.server.max_artifact_bytes,
        },
        Arc::clone(&service),
        shutdown_rx.clone(),
        cancel.clone(),
    ));

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let control_handle = tokio::spawn(async move {
        if let Err(e) = control.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    cancel.cancel();

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = control_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting function gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        control_bind = %config.server.control_bind,
        control_port = config.server.control_port,
        "Server configuration"
    );
    info!(
        request_timeout_secs = config.server.request_timeout_secs,
        deploy_timeout_secs = config.server.deploy_timeout_secs,
        max_body_bytes = config.server.max_body_bytes,
        max_artifact_bytes = config.server.max_artifact_bytes,
        serialize_deploys = config.server.serialize_deploys,
        "Request handling settings"
    );
    info!(
        registry = ?config.registry.registry_type,
        path = %config.registry.path,
        "Registry settings"
    );
    info!(
        provider = ?config.provider.provider_type,
        endpoint = %config.provider.endpoint,
        runtime = %config.provider.runtime,
        handler = %config.provider.handler,
        architecture = %config.provider.architecture,
        activation_timeout_secs = config.provider.activation_timeout_secs,
        activation_poll_interval_ms = config.provider.activation_poll_interval_ms,
        "Function provider settings"
    );
}
