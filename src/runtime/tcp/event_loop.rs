//! mio event loop for the multiplexed TCP backend.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking reads and vectored writes. Each worker owns its
//! listener, its connections, and its send descriptor pool, so nothing in
//! the loop is shared with other threads except the stream pool.

use crate::error::ConnectionError;
use crate::runtime::buffer::SendBufferPool;
use crate::runtime::pool::{Arena, Key, ObjectPool};
use crate::runtime::shutdown::StopSignal;
use crate::runtime::stream::{PerfStream, StreamSettings};
use crate::runtime::tcp::connection::{MuxSession, TcpConnection};
use crate::runtime::token::{self, EventSource, LISTENER_TOKEN, WAKER_TOKEN};
use crate::runtime::ServerContext;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Waker};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// One TCP worker thread's event loop.
pub struct Worker {
    id: usize,
    poll: Poll,
    listener: Option<TcpListener>,
    connections: Arena<TcpConnection>,
    settings: StreamSettings,
    streams: Arc<ObjectPool<PerfStream>>,
    send_buffers: Arc<SendBufferPool>,
    /// Connections with streams waiting for a send descriptor.
    starved: VecDeque<Key>,
    stop: StopSignal,
    drain_timeout: Duration,
    drain_deadline: Option<Instant>,
}

impl Worker {
    /// Set up a worker around an already bound listener.
    pub fn new(
        id: usize,
        listener: std::net::TcpListener,
        ctx: &ServerContext,
        max_connections: usize,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        ctx.stop.register_waker(waker);

        Ok(Self {
            id,
            poll,
            listener: Some(listener),
            connections: Arena::new(max_connections),
            settings: ctx.settings,
            streams: Arc::clone(&ctx.streams),
            send_buffers: ctx.send_buffers(),
            starved: VecDeque::new(),
            stop: ctx.stop.clone(),
            drain_timeout: ctx.drain_timeout,
            drain_deadline: None,
        })
    }

    /// Run until stopped and drained.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        info!(
            worker = self.id,
            max_connections = self.connections.capacity(),
            send_buffers = self.send_buffers.capacity(),
            "Worker started"
        );

        loop {
            if self.stop.is_stopped() && self.drain_deadline.is_none() {
                self.start_draining();
            }

            let timeout = match self.drain_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline || self.connections.is_empty() {
                        break;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match token::decode(event.token()) {
                    EventSource::Listener => self.accept_connections(),
                    // Stop is checked at the top of the loop.
                    EventSource::Waker => {}
                    EventSource::Connection(key) => {
                        if let Err(e) = self.handle_connection_event(key, event) {
                            match e {
                                ConnectionError::PeerClosed => {}
                                e => debug!(worker = self.id, conn_id = %key, error = %e, "Connection error"),
                            }
                            self.close_connection(key);
                        }
                    }
                }
            }

            self.wake_starved();

            if self.drain_deadline.is_some() {
                self.reap_idle();
            }
        }

        let remaining = self.connections.len();
        if remaining > 0 {
            warn!(
                worker = self.id,
                connections = remaining,
                "Drain timeout elapsed, closing connections"
            );
        }
        for key in self.connections.keys() {
            self.close_connection(key);
        }
        info!(
            worker = self.id,
            streams_in_use = self.streams.in_use(),
            "Worker stopped"
        );
        Ok(())
    }

    fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((socket, peer)) => {
                    if self.connections.len() >= self.connections.capacity() {
                        warn!(worker = self.id, peer = %peer, "Connection limit reached");
                        continue;
                    }

                    let session = MuxSession::new(
                        self.settings,
                        Arc::clone(&self.streams),
                        Arc::clone(&self.send_buffers),
                    );
                    let Some(key) = self
                        .connections
                        .insert(TcpConnection::new(socket, peer, session))
                    else {
                        continue;
                    };

                    // Re-borrow after insert
                    let Some(conn) = self.connections.get_mut(key) else {
                        continue;
                    };
                    if let Err(e) = self.poll.registry().register(
                        &mut conn.socket,
                        token::encode(key),
                        Interest::READABLE,
                    ) {
                        warn!(worker = self.id, peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(key);
                        continue;
                    }

                    debug!(worker = self.id, conn_id = %key, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(
        &mut self,
        key: Key,
        event: &mio::event::Event,
    ) -> Result<(), ConnectionError> {
        let Some(conn) = self.connections.get_mut(key) else {
            // Stale event for a closed connection.
            return Ok(());
        };

        conn.service(event.is_readable() || event.is_read_closed())?;
        if conn.session.is_finished() {
            return Err(ConnectionError::PeerClosed);
        }

        if conn.session.is_starved() && !self.starved.contains(&key) {
            self.starved.push_back(key);
        }
        self.update_interest(key)
    }

    /// Keep the registration in line with what the connection can use.
    fn update_interest(&mut self, key: Key) -> Result<(), ConnectionError> {
        let Some(conn) = self.connections.get_mut(key) else {
            return Ok(());
        };
        let interest = conn.desired_interest();
        if interest != conn.interest {
            self.poll
                .registry()
                .reregister(&mut conn.socket, token::encode(key), interest)?;
            conn.interest = interest;
        }
        Ok(())
    }

    /// Give starved connections another try once descriptors are free.
    fn wake_starved(&mut self) {
        let pending = self.starved.len();
        for _ in 0..pending {
            if self.send_buffers.available() == 0 {
                break;
            }
            let Some(key) = self.starved.pop_front() else {
                break;
            };
            let Some(conn) = self.connections.get_mut(key) else {
                continue;
            };
            conn.session.retry_starved();
            let result = conn.service(false).and_then(|()| {
                if conn.session.is_finished() {
                    Err(ConnectionError::PeerClosed)
                } else {
                    Ok(())
                }
            });
            let result = result.and_then(|()| self.update_interest(key));
            match result {
                Ok(()) => {}
                Err(ConnectionError::PeerClosed) => {
                    self.close_connection(key);
                    continue;
                }
                Err(e) => {
                    debug!(worker = self.id, conn_id = %key, error = %e, "Connection error");
                    self.close_connection(key);
                    continue;
                }
            }
            if self
                .connections
                .get(key)
                .is_some_and(|conn| conn.session.is_starved())
            {
                self.starved.push_back(key);
            }
        }
    }

    /// Stop accepting and let in-flight streams finish.
    fn start_draining(&mut self) {
        info!(
            worker = self.id,
            connections = self.connections.len(),
            "Draining connections"
        );
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        for (_, conn) in self.connections.iter_mut() {
            conn.session.start_draining();
        }
        self.drain_deadline = Some(Instant::now() + self.drain_timeout);
        self.reap_idle();
    }

    fn reap_idle(&mut self) {
        for key in self.connections.keys() {
            if self
                .connections
                .get(key)
                .is_some_and(|conn| conn.session.is_idle())
            {
                self.close_connection(key);
            }
        }
    }

    fn close_connection(&mut self, key: Key) {
        if let Some(mut conn) = self.connections.remove(key) {
            let _ = self.poll.registry().deregister(&mut conn.socket);
            debug!(
                worker = self.id,
                conn_id = %key,
                peer = %conn.peer,
                streams = conn.session.stream_count(),
                "Connection closed"
            );
        }
    }
}
