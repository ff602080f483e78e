use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use lessond::studio::StudioManager;
use lessond::wire;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Resolves when the process is asked to stop (ctrl-c, or SIGTERM on unix).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    lessond::observability::init(env_parsed::<u16>("LESSOND_METRICS_PORT"));

    let bind = env_or("LESSOND_BIND", "0.0.0.0");
    let port = env_or("LESSOND_PORT", "5434");
    let data_dir = env_or("LESSOND_DATA_DIR", "./data");
    let password = env_or("LESSOND_PASSWORD", "lessond");
    let max_connections: usize = env_parsed("LESSOND_MAX_CONNECTIONS").unwrap_or(256);
    let compact_threshold: u64 = env_parsed("LESSOND_COMPACT_THRESHOLD").unwrap_or(1000);

    let tls_cert = std::env::var("LESSOND_TLS_CERT").ok();
    let tls_key = std::env::var("LESSOND_TLS_KEY").ok();
    let tls_acceptor = lessond::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;
    let studios = Arc::new(StudioManager::new(PathBuf::from(&data_dir), compact_threshold));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "lessond listening on {addr} (data_dir={data_dir}, max_connections={max_connections}, tls={})",
        if tls_acceptor.is_some() { "on" } else { "off" },
    );

    // One permit per connection; a full semaphore turns new clients away at
    // accept time instead of queueing them.
    let permits = Arc::new(Semaphore::new(max_connections));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(lessond::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(lessond::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(lessond::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let sm = studios.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();
                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, sm, pw, tls).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(lessond::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Give in-flight connections a grace window before exiting.
    info!("draining connections");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while permits.available_permits() < max_connections {
        if tokio::time::Instant::now() >= deadline {
            let open = max_connections - permits.available_permits();
            warn!("drain timeout, {open} connections still open");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("lessond stopped");
    Ok(())
}
