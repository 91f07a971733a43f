/// Relay server: accepts downstream bots and gives each its own session.
///
/// Every accepted connection gets a fresh uplink connection and a fresh
/// [`Session`]; sessions share nothing but the configuration.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use super::config::Config;
use super::relay::{shutdown_requested, Phase, Session};
use super::transport::connect_uplink;

/// Bind the configured listen address and serve until Ctrl-C.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(&config.listen).await?;
    info!(
        "eggnat listening on {}, linking to {} as {}",
        config.listen,
        config.link.addr(),
        config.session.fake_handle
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, closing sessions");
            let _ = shutdown_tx.send(true);
        }
    });

    serve(listener, Arc::new(config), shutdown_rx).await?;
    Ok(())
}

/// Accept loop. Returns once `shutdown` turns `true` and every session
/// has wound down.
pub async fn serve(
    listener: TcpListener,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, addr) = accepted?;
                info!(%addr, "downstream connected");
                let config = Arc::clone(&config);
                let shutdown = shutdown.clone();
                let span = info_span!("session", %addr);
                sessions.spawn(handle_downstream(socket, addr, config, shutdown).instrument(span));
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    drop(listener);
    while sessions.join_next().await.is_some() {}
    info!("all sessions closed");
    Ok(())
}

async fn handle_downstream(
    socket: TcpStream,
    addr: SocketAddr,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = socket.set_nodelay(true);

    let uplink = tokio::select! {
        r = connect_uplink(&config.link) => r,
        _ = shutdown_requested(&mut shutdown) => return,
    };
    let uplink = match uplink {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%addr, phase = %Phase::Connecting, "{e}");
            return;
        }
    };

    let session = Session::new(socket, uplink, Arc::clone(&config.session));
    // The session logs its own outcome.
    let _ = session.run(shutdown).await;
    info!(%addr, "downstream disconnected");
}
