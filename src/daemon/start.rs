use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{error, info};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::oneshot;

use crate::commons::error::Error;
use crate::config::Config;
use crate::server::manager::EventServer;

use super::http::server::HttpServer;


/// Runs the daemon until it is stopped.
///
/// Once the admin interface listens, its address is sent through
/// `signal_running`.
pub async fn start_eventd_daemon(
    config: Arc<Config>,
    signal_running: Option<oneshot::Sender<SocketAddr>>,
) -> Result<(), Error> {
    let eventd = Arc::new(EventServer::build(config.clone()).await?);
    let server = Arc::new(HttpServer::new(eventd.clone(), config.clone()));
    let listener = TcpListener::bind(config.socket_addr()).await.map_err(|e| {
        Error::custom(format!(
            "Could not bind to {}: {e}", config.socket_addr()
        ))
    })?;

    eventd.start().await;

    let res = select!(
        _ = http_listener(server, listener, signal_running) => {
            Err(Error::custom("http server stopped unexpectedly"))
        }
        _ = eventd.stopped() => {
            Err(Error::custom("pipeline stopped unexpectedly"))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, stopping eventd");
            Ok(())
        }
    );

    eventd.shutdown().await;
    res
}

/// Serves the admin interface on the given listener.
async fn http_listener(
    server: Arc<HttpServer>,
    listener: TcpListener,
    signal_running: Option<oneshot::Sender<SocketAddr>>,
) {
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            error!("Could not determine listening address: {err}");
            return
        }
    };
    info!("Admin interface listening on {addr}");

    if let Some(tx) = signal_running {
        let _ = tx.send(addr);
    }

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(err) => {
                error!("Fatal error in HTTP server {addr}: {err}");
                return
            }
        };
        let server = server.clone();
        tokio::task::spawn(async move {
            let _ = hyper_util::server::conn::auto::Builder::new(
                TokioExecutor::new(),
            )
            .serve_connection(
                TokioIo::new(stream),
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.process_request(req).await }
                }),
            )
            .await;
        });
    }
}
