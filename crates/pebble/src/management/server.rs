//! HTTPS accept loop: TCP, TLS handshake, then hyper with upgrade support
//! so exec websockets work over the same listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use pebble_core::drain::DrainWatcher;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub async fn serve(
	listener: TcpListener,
	tls: Arc<ServerConfig>,
	app: Router,
	drain: DrainWatcher,
) -> anyhow::Result<()> {
	let acceptor = TlsAcceptor::from(tls);
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = accepted?;
				tokio::spawn(handle_connection(
					stream,
					peer,
					acceptor.clone(),
					app.clone(),
				));
			},
			_ = drain.clone().wait_for_drain() => {
				info!("https server draining");
				return Ok(());
			},
		}
	}
}

async fn handle_connection(
	stream: TcpStream,
	peer: SocketAddr,
	acceptor: TlsAcceptor,
	app: Router,
) {
	let tls_stream = match acceptor.accept(stream).await {
		Ok(tls_stream) => tls_stream,
		Err(e) => {
			debug!(%peer, "tls handshake failed: {e}");
			return;
		},
	};
	let service = TowerToHyperService::new(app);
	if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
		.serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
		.await
	{
		warn!(%peer, "connection error: {e}");
	}
}
