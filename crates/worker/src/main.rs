//! `vigil-worker` -- traffic violation relay.
//!
//! Subscribes to `violation:*` on Redis, correlates each event with the
//! camera identity and plate sidecar, notifies the configured webhook and
//! push topic, and archives the evidence artifact.
//!
//! # Environment variables
//!
//! | Variable              | Default                  | Description                          |
//! |-----------------------|--------------------------|--------------------------------------|
//! | `REDIS_URL`           | `redis://127.0.0.1:6379/0` | Event bus                          |
//! | `NOTIFY_ENDPOINT`     | --                       | Webhook URL; webhook off when unset  |
//! | `FCM_SERVER_KEY`      | --                       | Push server key; push off when unset |
//! | `FCM_TOPIC`           | `authorities`            | Push topic                           |
//! | `BACKEND_PUBLIC_URL`  | `http://localhost:8000`  | Base for evidence links              |
//! | `CAMERA_ID` etc.      | `unknown_cam`            | Static camera identity               |
//! | `STORAGE_BACKEND`     | --                       | `s3` or `local`; archival off when unset |
//! | `DATABASE_URL`        | --                       | Durable archive index                |
//! | `WORKER_CONCURRENCY`  | `16`                     | Events processed at once             |
//!
//! The full list lives on [`RelayConfig::from_vars`].
//!
//! # Usage
//!
//! ```text
//! vigil-worker                  # run the relay until SIGINT/SIGTERM
//! vigil-worker publish-sample   # publish one sample event and exit
//! ```

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::config::RelayConfig;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_worker=info,vigil_events=info,vigil_archive=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    match std::env::args().nth(1).as_deref() {
        None => {}
        Some("publish-sample") => {
            match vigil_worker::publish_sample(&config).await {
                Ok(receivers) => tracing::info!(receivers, "Published sample violation event"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to publish sample event");
                    std::process::exit(1);
                }
            }
            return;
        }
        Some(other) => {
            tracing::error!(command = other, "Unknown command; expected `publish-sample`");
            std::process::exit(2);
        }
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    match vigil_worker::run(config, cancel).await {
        Ok(summary) => tracing::info!(
            processed = summary.processed,
            abandoned = summary.abandoned,
            "Relay stopped",
        ),
        Err(e) => {
            tracing::error!(error = %e, "Relay failed to start");
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
}
