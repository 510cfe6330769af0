//! Coordination server: the coordinator core, its background workers and the
//! HTTP surface in front of them.

mod api;
mod coordinator;
mod dispatcher;
pub mod types;

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

pub use api::router;
pub use coordinator::Coordinator;
pub use dispatcher::Workers;

use crate::config::RunlaneConfig;
use crate::error::Result;
use crate::notify::WebhookNotifier;

/// Run the server until ctrl-c or SIGTERM, then drain.
pub async fn serve(config: RunlaneConfig) -> Result<()> {
    let coordinator = Coordinator::new(&config)?;
    let workers = coordinator.start();

    let notifier = match &config.notify.webhook_url {
        Some(url) => {
            let timeout = Duration::from_millis(config.notify.webhook_timeout_ms);
            match WebhookNotifier::new(url.clone(), timeout) {
                Ok(notifier) => Some(notifier.spawn(coordinator.subscribe())),
                Err(e) => {
                    warn!(error = %e, "webhook notifier disabled");
                    None
                }
            }
        }
        None => None,
    };

    let listener = TcpListener::bind(&config.server.bind).await?;
    info!(
        addr = %listener.local_addr()?,
        max_queue_depth = config.server.max_queue_depth,
        "runlane listening"
    );

    let shutdown = coordinator.shutdown_token();
    axum::serve(listener, router(coordinator.clone()))
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = shutdown_signal() => {}
                () = shutdown.cancelled() => {}
            }
        })
        .await?;

    coordinator.shutdown();
    workers.join().await;

    // Dropping the last handle closes the event channel, which lets the
    // notifier flush the final `Finished` events and stop.
    drop(coordinator);
    if let Some(mut handle) = notifier {
        let drain = Duration::from_millis(config.notify.webhook_timeout_ms.saturating_mul(4));
        match tokio::time::timeout(drain, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "webhook notifier ended abnormally"),
            Err(_) => {
                warn!("webhook notifier did not drain in time");
                handle.abort();
            }
        }
    }
    info!("runlane stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
