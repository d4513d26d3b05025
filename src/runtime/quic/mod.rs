//! QUIC backend built on quinn.
//!
//! One tokio task per connection and one per peer-opened stream. Every
//! stream shares the server's stream pool and a single send descriptor pool.

mod connection;
mod stream;
mod tls;

pub use tls::Credentials;

use crate::config::{CongestionControl, QuicConfig};
use crate::error::InitError;
use crate::runtime::buffer::SendBufferPool;
use crate::runtime::ServerContext;
use quinn::congestion::{BbrConfig, CubicConfig, NewRenoConfig};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Endpoint, EndpointConfig, IdleTimeout, ServerConfig, TransportConfig, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tls::server_crypto;
use tracing::{debug, info, warn};

/// State every connection and stream task holds a reference to.
pub struct QuicShared {
    pub ctx: ServerContext,
    pub send_buffers: Arc<SendBufferPool>,
}

/// A bound QUIC endpoint.
pub struct QuicBackend {
    endpoint: Endpoint,
    shared: Arc<QuicShared>,
    disconnect_timeout: Duration,
}

impl QuicBackend {
    /// Bind the UDP socket and install the server configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        config: &QuicConfig,
        credentials: Credentials,
        ctx: ServerContext,
    ) -> Result<Self, InitError> {
        let crypto = QuicServerConfig::try_from(server_crypto(credentials)?)?;
        let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport_config(config)?));

        let socket = udp_socket(addr).map_err(|source| InitError::Bind { addr, source })?;
        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            Some(server_config),
            socket,
            Arc::new(quinn::TokioRuntime),
        )?;

        info!(
            addr = %endpoint.local_addr()?,
            profile = ?config.execution_profile,
            congestion_control = ?config.congestion_control,
            ecn = config.ecn,
            "Starting QUIC backend"
        );

        let send_buffers = ctx.send_buffers();
        Ok(Self {
            endpoint,
            shared: Arc::new(QuicShared { ctx, send_buffers }),
            disconnect_timeout: config.disconnect_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Accept connections until stopped, then drain and close the endpoint.
    pub async fn run(self) {
        let stop = self.shared.ctx.stop.clone();
        let max_connections = self.shared.ctx.max_connections;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        break;
                    };
                    if connections.len() >= max_connections {
                        warn!(peer = %incoming.remote_address(), "Connection limit reached");
                        incoming.refuse();
                        continue;
                    }
                    match incoming.accept() {
                        Ok(connecting) => {
                            let shared = Arc::clone(&self.shared);
                            connections.spawn(connection::serve(shared, connecting));
                        }
                        Err(e) => debug!(error = %e, "Failed to accept connection"),
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = stop.wait() => break,
            }
        }

        // Refuse new handshakes while existing connections finish.
        self.endpoint.set_server_config(None);
        info!(connections = connections.len(), "Draining QUIC connections");

        let drained = tokio::time::timeout(self.shared.ctx.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                connections = connections.len(),
                "Drain timeout elapsed, closing connections"
            );
            connections.shutdown().await;
        }

        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        if tokio::time::timeout(self.disconnect_timeout, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("Disconnect timeout elapsed");
        }
        info!("QUIC backend stopped");
    }
}

/// Translate the configured limits into quinn transport parameters.
///
/// A zero idle timeout disables idle expiry.
fn transport_config(config: &QuicConfig) -> Result<TransportConfig, InitError> {
    let invalid = |field: &str, e: &dyn std::fmt::Display| {
        InitError::TransportSetting(format!("{field}: {e}"))
    };

    let streams = VarInt::from_u64(config.stream_count).map_err(|e| invalid("stream_count", &e))?;
    let window = VarInt::from_u64(config.conn_flow_control_window)
        .map_err(|e| invalid("conn_flow_control_window", &e))?;
    let idle_timeout = if config.idle_timeout.is_zero() {
        None
    } else {
        Some(IdleTimeout::try_from(config.idle_timeout).map_err(|e| invalid("idle_timeout", &e))?)
    };

    let mut transport = TransportConfig::default();
    transport
        .max_concurrent_bidi_streams(streams)
        .max_concurrent_uni_streams(streams)
        .receive_window(window)
        .send_window(config.conn_flow_control_window)
        .max_idle_timeout(idle_timeout);

    match config.congestion_control {
        CongestionControl::Cubic => {
            transport.congestion_controller_factory(Arc::new(CubicConfig::default()))
        }
        CongestionControl::Bbr => {
            transport.congestion_controller_factory(Arc::new(BbrConfig::default()))
        }
        CongestionControl::NewReno => {
            transport.congestion_controller_factory(Arc::new(NewRenoConfig::default()))
        }
    };
    Ok(transport)
}

/// Nonblocking UDP socket; IPv6 addresses accept IPv4-mapped peers too.
fn udp_socket(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
