//! Multiplexed-stream TCP backend.
//!
//! Thread-per-core: every worker owns an `SO_REUSEPORT` listener on the same
//! address and the kernel spreads connections across them.

mod connection;
mod event_loop;

use crate::error::InitError;
use crate::runtime::ServerContext;
use event_loop::Worker;
use std::io;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Running TCP workers.
pub struct TcpBackend {
    local_addr: SocketAddr,
    handles: Vec<JoinHandle<()>>,
}

impl TcpBackend {
    /// Bind one listener per worker and start the worker threads.
    ///
    /// Listeners are bound before any thread starts so bind failures are
    /// reported to the caller.
    pub fn start(addr: SocketAddr, workers: usize, ctx: &ServerContext) -> Result<Self, InitError> {
        let workers = workers.max(1);
        let bind_err = |source| InitError::Bind { addr, source };

        let first = create_listener_with_reuseport(addr).map_err(bind_err)?;
        // Port 0 resolves on the first bind; the rest must share its port.
        let local_addr = first.local_addr()?;
        let mut listeners = vec![first];
        for _ in 1..workers {
            listeners.push(create_listener_with_reuseport(local_addr).map_err(bind_err)?);
        }

        let per_worker = ctx.max_connections.div_ceil(workers);
        info!(
            workers,
            addr = %local_addr,
            max_connections = ctx.max_connections,
            stream_pool = ctx.streams.capacity(),
            "Starting TCP backend"
        );

        let mut handles = Vec::with_capacity(workers);
        for (worker_id, listener) in listeners.into_iter().enumerate() {
            let worker = Worker::new(worker_id, listener, ctx, per_worker)?;
            let handle = thread::Builder::new()
                .name(format!("tcp-worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker.run() {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            local_addr,
            handles,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for every worker to exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
///
/// IPv6 addresses accept IPv4-mapped connections too.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::mux::{encode_header, FrameDecoder, FrameFlags};
    use crate::protocols::request::Request;
    use crate::runtime::stream::StreamSettings;
    use crate::runtime::test_support;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn request_frame(stream_id: u32, response_size: u64) -> Vec<u8> {
        let header = Request {
            response_size,
            unidirectional: true,
        }
        .encode();
        let flags = FrameFlags {
            open: true,
            fin: true,
            abort: false,
        };
        let mut out = encode_header(stream_id, flags, header.len() as u32).to_vec();
        out.extend_from_slice(&header);
        out
    }

    #[test]
    fn test_loopback_streams() {
        let settings = StreamSettings {
            io_size: 4096,
            ideal_send_buffer: 16 * 1024,
            buffered_io: false,
        };
        let ctx = test_support::context(settings);
        let backend = TcpBackend::start("127.0.0.1:0".parse().unwrap(), 2, &ctx).unwrap();

        let mut client = TcpStream::connect(backend.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        let sizes = [(1u32, 100_000u64), (2, 0), (3, 5000)];
        let mut wire = Vec::new();
        for (id, size) in sizes {
            wire.extend(request_frame(id, size));
        }
        client.write_all(&wire).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut received = [0u64; 4];
        let mut finished = 0;
        while finished < sizes.len() {
            let mut buf = [0u8; 16 * 1024];
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0, "server closed early");
            decoder.extend(&buf[..n]);
            while let Some(frame) = decoder.decode().unwrap() {
                assert!(!frame.flags.abort);
                received[frame.stream_id as usize] += frame.payload.len() as u64;
                if frame.flags.fin {
                    finished += 1;
                }
            }
        }
        for (id, size) in sizes {
            assert_eq!(received[id as usize], size);
        }

        drop(client);
        ctx.stop.trigger();
        backend.join();
        assert_eq!(ctx.streams.in_use(), 0);
    }

    #[test]
    fn test_half_closed_client_gets_response() {
        let settings = StreamSettings {
            io_size: 4096,
            ideal_send_buffer: 16 * 1024,
            buffered_io: false,
        };
        let ctx = test_support::context(settings);
        let backend = TcpBackend::start("127.0.0.1:0".parse().unwrap(), 1, &ctx).unwrap();

        let mut client = TcpStream::connect(backend.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        client.write_all(&request_frame(1, 1_000_000)).unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut received = 0u64;
        let mut fin = false;
        loop {
            let mut buf = [0u8; 16 * 1024];
            let n = client.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            decoder.extend(&buf[..n]);
            while let Some(frame) = decoder.decode().unwrap() {
                assert_eq!(frame.stream_id, 1);
                assert!(!frame.flags.abort);
                received += frame.payload.len() as u64;
                fin |= frame.flags.fin;
            }
        }
        // The server closes once the response is fully written.
        assert_eq!(received, 1_000_000);
        assert!(fin);

        ctx.stop.trigger();
        backend.join();
        assert_eq!(ctx.streams.in_use(), 0);
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let ctx = test_support::context(StreamSettings::default());
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        // The plain listener holds the port without SO_REUSEPORT.
        let result = TcpBackend::start(addr, 1, &ctx);
        assert!(matches!(result, Err(InitError::Bind { .. })));
    }
}
