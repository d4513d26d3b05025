//! Server assembly: starts the configured backends and owns the stop signal.
//!
//! TCP workers run on their own threads; QUIC, Ctrl-C handling and the
//! teardown listener run on a tokio runtime owned by the calling thread.

use crate::config::Config;
use crate::error::InitError;
use crate::runtime::quic::{Credentials, QuicBackend};
use crate::runtime::shutdown::StopSignal;
use crate::runtime::tcp::TcpBackend;
use crate::runtime::ServerContext;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// Server instance
pub struct Server {
    config: Config,
    credentials: Option<Credentials>,
    stop: StopSignal,
}

impl Server {
    /// Create a server, loading QUIC credentials if that backend is enabled.
    pub fn new(config: Config) -> Result<Self, InitError> {
        let credentials = if config.backend.quic() {
            Some(Credentials::load(
                config.quic.cert.as_deref(),
                config.quic.key.as_deref(),
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            credentials,
            stop: StopSignal::new(),
        })
    }

    /// Handle for stopping the server from elsewhere.
    #[cfg(test)]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run until the stop signal fires and every backend has drained.
    pub fn run(self) -> Result<(), InitError> {
        let ctx = ServerContext::new(&self.config, self.stop.clone());
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("quic")
            .build()?;

        let tcp = if self.config.backend.tcp() {
            Some(TcpBackend::start(
                self.config.listen,
                self.config.workers,
                &ctx,
            )?)
        } else {
            None
        };

        let stop = self.stop.clone();
        let result = runtime.block_on(self.serve(ctx));
        if result.is_err() {
            // Let already running TCP workers exit.
            stop.trigger();
        }
        if let Some(tcp) = tcp {
            tcp.join();
        }
        info!("Server stopped");
        result
    }

    async fn serve(self, ctx: ServerContext) -> Result<(), InitError> {
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        info!("Received Ctrl-C, stopping");
                        stop.trigger();
                    }
                    Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
                },
                _ = stop.wait() => {}
            }
        });

        if let Some(port) = self.config.teardown_port {
            let addr = SocketAddr::new(self.config.listen.ip(), port);
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| InitError::Bind { addr, source })?;
            info!(addr = %socket.local_addr()?, "Teardown listener bound");
            tokio::spawn(teardown_listener(socket, self.stop.clone()));
        }

        match self.credentials {
            Some(credentials) => {
                let backend =
                    QuicBackend::bind(self.config.listen, &self.config.quic, credentials, ctx)?;
                backend.run().await;
            }
            None => self.stop.wait().await,
        }
        Ok(())
    }
}

/// Trigger the stop signal on the first datagram received.
async fn teardown_listener(socket: UdpSocket, stop: StopSignal) {
    let mut buf = [0u8; 64];
    tokio::select! {
        received = socket.recv_from(&mut buf) => match received {
            Ok((_, peer)) => {
                info!(peer = %peer, "Teardown requested");
                stop.trigger();
            }
            Err(e) => warn!(error = %e, "Teardown listener failed"),
        },
        _ = stop.wait() => {}
    }
}
