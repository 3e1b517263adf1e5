use cachefront_proxy::{
    Fetch, GenerationManager, HttpFetcher, LifecycleController, ProxyConfig, ProxyState,
    RequestRouter, SqliteStoreBackend, StoreBackend, server,
};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tower::Service;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Arc::new(ProxyConfig::from_env().expect("Failed to load proxy configuration"));

    // STORAGE_DIR holds cache.db (SQLite database, one table set shared by
    // all generations)
    let storage_dir = std::env::var("CACHEFRONT_STORAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./cachefront-storage"));

    // Ensure storage directory exists before creating database
    std::fs::create_dir_all(&storage_dir).expect("Failed to create storage directory");

    let db_path = storage_dir.join("cache.db");
    let backend: Arc<dyn StoreBackend> = Arc::new(
        SqliteStoreBackend::new(&db_path).expect("Failed to initialize cache store"),
    );

    let fetcher: Arc<dyn Fetch> = Arc::new(
        HttpFetcher::new(config.user_agent.as_deref()).expect("Failed to build HTTP client"),
    );

    let manager = GenerationManager::new(backend.clone(), fetcher.clone(), config.clone());
    let controller = LifecycleController::new(
        config.generation_id.clone(),
        config.manifest.clone(),
        manager,
    );
    let router = RequestRouter::new(
        backend.clone(),
        fetcher.clone(),
        config.clone(),
        controller.subscribe(),
    );

    // Bootstrap: install seeds the manifest, activate retires stale
    // generations and claims clients. If install fails the proxy keeps
    // serving pass-through and a later start retries it.
    match controller.install().await {
        Ok(report) => {
            info!(
                "Installed generation {} ({} manifest entries)",
                report.generation, report.entries
            );
            match controller.activate().await {
                Ok(retired) if retired.is_empty() => {
                    info!("Generation {} active, no stale generations", config.generation_id)
                }
                Ok(retired) => info!(
                    "Generation {} active, retired {:?}",
                    config.generation_id, retired
                ),
                Err(e) => error!("Activation failed: {}", e),
            }
        }
        Err(e) => warn!(
            "Install failed, serving pass-through until the next start: {}",
            e
        ),
    }

    let state = Arc::new(ProxyState {
        config: config.clone(),
        controller,
        router,
    });
    let app = server::create_app(state);

    let bind = std::env::var("CACHEFRONT_BIND").unwrap_or_else(|_| "127.0.0.1:8780".to_string());
    let listener = tokio::net::TcpListener::bind(&bind).await.unwrap();
    info!(
        "Cachefront proxy listening on http://{} (HTTP/1.1 + HTTP/2), upstream {}",
        bind, config.upstream_origin
    );
    info!("Storage directory: {}", storage_dir.display());

    // Use hyper's auto-negotiating server to support both HTTP/1.1 and HTTP/2
    let conn_builder = ConnBuilder::new(hyper_util::rt::TokioExecutor::new());

    loop {
        let (stream, addr) = listener.accept().await.unwrap();
        debug!("New connection from: {}", addr);
        let io = TokioIo::new(stream);
        let app_clone = app.clone();
        let conn_builder = conn_builder.clone();

        tokio::spawn(async move {
            if let Err(err) = conn_builder
                .serve_connection_with_upgrades(
                    io,
                    hyper::service::service_fn(move |req| app_clone.clone().call(req)),
                )
                .await
            {
                // Check if the error is an io::Error indicating a normal close
                let is_normal_close = err
                    .source()
                    .and_then(|e| e.downcast_ref::<io::Error>())
                    .map(|io_err| {
                        matches!(
                            io_err.kind(),
                            io::ErrorKind::ConnectionReset
                                | io::ErrorKind::BrokenPipe
                                | io::ErrorKind::UnexpectedEof
                        )
                    })
                    .unwrap_or(false);

                if is_normal_close {
                    debug!("Connection from {} closed normally", addr);
                } else {
                    error!("Error serving connection from {}: {}", addr, err);
                }
            }
        });
    }
}
