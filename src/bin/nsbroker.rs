use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};

use nsbroker::amqp;
use nsbroker::codec::FrameCodec;
use nsbroker::config::Config;
use nsbroker::dispatcher::Dispatcher;
use nsbroker::quiesce::QuiesceState;
use nsbroker::server::{self, AppState};
use nsbroker::signer::Signer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "nsbroker.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load(&args.config).context("failed to load configuration")?;
    let mac_secret = config.mac_secret_bytes().context("failed to decode web.mac_secret")?;

    let signer = Arc::new(Signer::new(mac_secret, config.web.admin_auth.clone()));
    let codec = Arc::new(FrameCodec::new());
    let counters = Arc::new(nsbroker::metrics::Counters::new());
    let dispatcher = Arc::new(Dispatcher::new(codec, Arc::clone(&counters)));
    let quiesce = QuiesceState::new(config.web.conn_shed_rate);

    let bind: SocketAddr = config.web.bind.parse().context("invalid web.bind address")?;

    let status_slot = Arc::new(amqp::StatusSlot::new(None));

    let amqp_dispatcher = Arc::clone(&dispatcher);
    let amqp_config = config.amqp.clone();
    let amqp_status = Arc::clone(&status_slot);
    tokio::spawn(amqp::pump_messages(amqp_config, amqp_dispatcher, amqp_status));

    let state = Arc::new(AppState {
        dispatcher: Arc::clone(&dispatcher),
        signer,
        quiesce: Arc::clone(&quiesce),
        counters,
        status: status_slot,
        ping_interval: Duration::from_secs(config.web.ping_interval),
    });

    register_quiesce_signal(Arc::clone(&quiesce));
    spawn_connection_count_heartbeat(Arc::clone(&dispatcher));

    info!("listening on {bind}");
    let listener = tokio::net::TcpListener::bind(bind).await.context("failed to bind listener")?;
    axum::serve(
        listener,
        server::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server exited")?;

    Ok(())
}

/// Registers `SIGUSR2` as a bypass-auth quiesce trigger, mirroring the
/// upstream service's signal handler for draining behind a process
/// supervisor (e.g. einhorn) that doesn't speak HTTP.
fn register_quiesce_signal(quiesce: Arc<QuiesceState>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            let mut stream = match signal(SignalKind::user_defined2()) {
                Ok(stream) => stream,
                Err(err) => {
                    log::warn!("failed to register SIGUSR2 handler: {err}");
                    return;
                }
            };
            while stream.recv().await.is_some() {
                info!("received SIGUSR2, quiescing");
                quiesce.quiesce();
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = quiesce;
    }
}

/// Periodic debug-log heartbeat reporting the connection count, matching
/// the upstream consumer loop's `LOG.debug("pumping")` cadence.
fn spawn_connection_count_heartbeat(dispatcher: Arc<Dispatcher>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            debug!("connection_count={}", dispatcher.connection_count());
        }
    });
}
