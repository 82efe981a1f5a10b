//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking reads (discarded) and let the engine decide on
//! writes. Incoming data is thrown away as RFC 864 requires.
//!
//! Event mapping:
//! - listener readable: accept, deliver `Accepted`
//! - connection writable: flush, deliver `Acked`
//! - line accepted by the kernel: `Acked` on the next turn
//! - poll interval elapsed: `Poll` to every connection
//! - read error or error readiness: `Error`
//! - read EOF or engine close: `Disconnected`, then the socket is dropped

use crate::config::Config;
use crate::flow::{EventKind, Peer};
use crate::runtime::connection::{Link, SendState};
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::socket;
use crate::slots::ConnId;
use mio::event::Event as Readiness;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 256;

const READ_CHUNK: usize = 4096;

/// A chargen connection owned by the mio reactor.
struct MioConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    send: SendState,
}

impl MioConnection {
    fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            send: SendState::default(),
        }
    }

    /// Read and discard whatever the peer sent. Returns `true` on EOF.
    fn drain_input(&mut self) -> io::Result<bool> {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Ok(true),
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Pending socket error after error readiness.
    fn socket_error(&self) -> io::Error {
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => e,
            Ok(None) => io::Error::new(io::ErrorKind::Other, "socket error"),
        }
    }
}

impl Peer for MioConnection {
    fn is_disconnected(&self) -> bool {
        self.send.is_closed()
    }

    fn send_space(&self) -> usize {
        if self.send.is_idle() {
            socket::send_space(&self.stream)
        } else {
            0
        }
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        let stream = &mut self.stream;
        self.send.submit(bytes, |b| stream.write(b))
    }

    fn close(&mut self) {
        if self.send.mark_closed() {
            socket::shutdown(&self.stream);
        }
    }
}

impl Link for MioConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn flush(&mut self) -> io::Result<()> {
        let stream = &mut self.stream;
        self.send.flush(|b| stream.write(b))
    }

    fn take_fault(&mut self) -> Option<io::Error> {
        self.send.take_fault()
    }

    fn take_acked(&mut self) -> usize {
        self.send.take_acked()
    }
}

/// Single-threaded chargen reactor.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    listen: String,
    dispatcher: Dispatcher<MioConnection>,
    poll_interval: Duration,
    status_interval: Option<Duration>,
    next_poll: Instant,
    next_status: Option<Instant>,
    /// An accept failed with a backlog possibly left behind. The listener is
    /// edge-triggered, so it is drained again on the next poll tick.
    accept_retry: bool,
}

impl Reactor {
    /// Bind the listener and set up the reactor.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(socket::create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let now = Instant::now();
        let status_interval = config.status_interval();

        info!(
            max_connections = config.max_connections,
            poll_interval_ms = config.poll_interval_ms,
            "Starting mio runtime"
        );

        Ok(Self {
            poll,
            listener,
            listen: config.listen.clone(),
            dispatcher: Dispatcher::new(config.max_connections),
            poll_interval: config.poll_interval(),
            status_interval,
            next_poll: now + config.poll_interval(),
            next_status: status_interval.map(|interval| now + interval),
            accept_retry: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections forever.
    pub fn run(&mut self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "Listening");
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            self.turn(&mut events)?;
        }
    }

    fn turn(&mut self, events: &mut Events) -> io::Result<()> {
        let timeout = if self.dispatcher.has_pending_acks() {
            Duration::ZERO
        } else {
            self.next_deadline()
                .saturating_duration_since(Instant::now())
        };

        match self.poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_connections(),
                Token(id) => self.connection_ready(ConnId(id), event),
            }
        }

        let closed = self.dispatcher.acknowledge();
        self.disconnect_all(closed);

        let now = Instant::now();
        if now >= self.next_poll {
            if std::mem::take(&mut self.accept_retry) {
                self.accept_connections();
            }
            let closed = self.dispatcher.poll_all();
            self.disconnect_all(closed);
            self.next_poll = now + self.poll_interval;
        }

        if let (Some(at), Some(interval)) = (self.next_status, self.status_interval) {
            if now >= at {
                self.dispatcher.report_status(&self.listen);
                self.next_status = Some(now + interval);
            }
        }

        Ok(())
    }

    fn next_deadline(&self) -> Instant {
        match self.next_status {
            Some(at) => at.min(self.next_poll),
            None => self.next_poll,
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let conn = self
                        .dispatcher
                        .insert(MioConnection::new(stream, peer_addr));

                    let registered = match self.dispatcher.link_mut(conn) {
                        Some(link) => self.poll.registry().register(
                            &mut link.stream,
                            Token(conn.0),
                            Interest::READABLE | Interest::WRITABLE,
                        ),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        warn!(%conn, peer = %peer_addr, error = %e, "Failed to register connection");
                        self.dispatcher.disconnect(conn);
                        continue;
                    }

                    debug!(
                        %conn,
                        peer = %peer_addr,
                        open = self.dispatcher.len(),
                        "Accepted connection"
                    );
                    if self.dispatcher.dispatch(conn, EventKind::Accepted) {
                        self.disconnect(conn);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error, retrying on the next poll");
                    self.accept_retry = true;
                    break;
                }
            }
        }
    }

    fn connection_ready(&mut self, conn: ConnId, event: &Readiness) {
        let Some(link) = self.dispatcher.link_mut(conn) else {
            return;
        };

        if event.is_error() {
            let error = link.socket_error();
            self.dispatch(conn, EventKind::Error(error));
            return;
        }

        if event.is_readable() {
            match link.drain_input() {
                Ok(true) => {
                    self.disconnect(conn);
                    return;
                }
                Ok(false) => {}
                Err(error) => {
                    self.dispatch(conn, EventKind::Error(error));
                    return;
                }
            }
        }

        if event.is_writable() {
            self.dispatch(conn, EventKind::Acked { bytes: 0 });
        }
    }

    fn dispatch(&mut self, conn: ConnId, kind: EventKind) {
        if self.dispatcher.dispatch(conn, kind) {
            self.disconnect(conn);
        }
    }

    fn disconnect_all(&mut self, closed: Vec<ConnId>) {
        for conn in closed {
            self.disconnect(conn);
        }
    }

    fn disconnect(&mut self, conn: ConnId) {
        if let Some(mut link) = self.dispatcher.disconnect(conn) {
            let _ = self.poll.registry().deregister(&mut link.stream);
        }
    }
}
