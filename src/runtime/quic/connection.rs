//! Per-connection task: accepts peer streams and runs each in its own task.

use crate::runtime::quic::stream;
use crate::runtime::quic::QuicShared;
use quinn::{Connecting, ConnectionError, VarInt};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// Complete the handshake and serve streams until the connection ends.
///
/// Once stopped, no further streams are accepted; the ones already running
/// finish before the connection is closed.
pub async fn serve(shared: Arc<QuicShared>, connecting: Connecting) {
    // Servers can always send 0.5-RTT data, so this only fails for clients.
    let connection = match connecting.into_0rtt() {
        Ok((connection, _)) => connection,
        Err(connecting) => match connecting.await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(error = %e, "Handshake failed");
                return;
            }
        },
    };

    let conn_id = connection.stable_id();
    let peer = connection.remote_address();
    debug!(conn_id, peer = %peer, "Accepted connection");

    let stop = shared.ctx.stop.clone();
    let mut streams = JoinSet::new();

    let reason = loop {
        tokio::select! {
            bi = connection.accept_bi() => match bi {
                Ok((send, recv)) => {
                    let shared = Arc::clone(&shared);
                    streams.spawn(async move {
                        stream::serve_bidirectional(&shared, send, recv).await;
                    });
                }
                Err(e) => break Some(e),
            },
            uni = connection.accept_uni() => match uni {
                Ok(recv) => {
                    let shared = Arc::clone(&shared);
                    streams.spawn(async move {
                        stream::serve_receive_only(&shared, recv).await;
                    });
                }
                Err(e) => break Some(e),
            },
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
            _ = stop.wait() => break None,
        }
    };

    while streams.join_next().await.is_some() {}

    match reason {
        None => {
            connection.close(VarInt::from_u32(0), b"shutdown");
            debug!(conn_id, peer = %peer, "Connection closed on shutdown");
        }
        Some(ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed) => {
            debug!(conn_id, peer = %peer, "Connection closed");
        }
        Some(e) => trace!(conn_id, peer = %peer, error = %e, "Connection lost"),
    }
}
