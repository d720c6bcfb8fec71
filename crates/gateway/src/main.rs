use std::net::SocketAddr;
use std::time::Duration;

use hubgate_gateway::{config, http};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match config::Config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let app = match http::router(config.clone(), shutdown_rx).await {
        Ok(app) => app,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let tls = match axum_server::tls_rustls::RustlsConfig::from_pem_file(
        &config.certificate_path,
        &config.key_path,
    )
    .await
    {
        Ok(tls) => tls,
        Err(_) => {
            eprintln!("STARTUP_ERROR ERR_TLS_CONFIG failed to load certificate/key");
            std::process::exit(1);
        }
    };

    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown_signal(shutdown_tx, handle.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!(%addr, "hubgate-gateway listening");

    if let Err(err) = axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
    {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
        std::process::exit(1);
    }

    tracing::info!("server exiting");
}

async fn shutdown_signal(
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    handle: axum_server::Handle,
) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutting down server");

    // Ends every live watch session, then gives in-flight requests five
    // seconds before responses are abandoned.
    let _ = shutdown_tx.send(true);
    handle.graceful_shutdown(Some(SHUTDOWN_DEADLINE));
}
