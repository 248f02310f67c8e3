//! Custodian: the regional control-plane agent.
//!
//! Wires the shared dependencies together, starts the queue consumers, the
//! polling loop and the midnight scrub sweep, and turns SIGTERM into an
//! advisory shutdown: the loops stop picking up work, in-flight jobs finish
//! naturally.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use workers::Deps;

mod dispatcher;
mod mainloop;
mod midnight;
mod robot;

use dispatcher::Dispatcher;

#[tokio::main]
async fn main() {
    let settings = Arc::new(settings::Settings::from_env());

    let _log_guard = match telemetry::init(&settings).await {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("could not set up telemetry: {err}");
            std::process::exit(1);
        }
    };

    info!(region = %settings.region_name, "custodian starting");

    let notifier = match notifier::EmailNotifier::new(&settings) {
        Ok(notifier) => Arc::new(notifier),
        Err(err) => {
            error!(error = %err, "could not set up the email notifier");
            std::process::exit(1);
        }
    };

    let dispatcher = Arc::new(Dispatcher::new());
    let deps = Deps {
        api: Arc::new(iaas::Client::new(&settings)),
        settings: settings.clone(),
        notifier,
        metrics: notifier::Metrics::new(&settings),
        queue: dispatcher.clone(),
    };
    dispatcher.spawn_consumers(deps.clone()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("termination signal received");
        let _ = shutdown_tx.send(true);
    });

    let poller = tokio::spawn(mainloop::run(deps.clone(), shutdown_rx.clone()));
    let sweeper = tokio::spawn(midnight::run(deps, shutdown_rx));
    let _ = tokio::join!(poller, sweeper);

    info!("custodian stopped");
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler installs");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
