//! Tokio engine task and connection readers.
//!
//! The engine task owns every write half. Each reader task discards peer
//! input and, when the engine held a line back, waits for the socket to
//! drain and reports it as `Acked`.

use crate::config::Config;
use crate::flow::{Event, EventKind, Peer};
use crate::pattern::FRAME_LEN;
use crate::runtime::connection::{Link, SendState};
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::socket;
use crate::slots::ConnId;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

const READ_CHUNK: usize = 4096;

/// Messages sent to the engine task.
#[derive(Debug)]
enum Message {
    /// A socket fresh from the acceptor.
    Connected {
        stream: TcpStream,
        peer_addr: SocketAddr,
    },
    /// Transport event for a registered connection.
    Event(Event),
}

/// Write side of a connection, owned by the engine task.
struct TokioConnection {
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    send: SendState,
    /// Shared with the reader task, which waits for writability when notified.
    wake: Arc<Notify>,
}

impl TokioConnection {
    fn new(writer: OwnedWriteHalf, peer_addr: SocketAddr, wake: Arc<Notify>) -> Self {
        Self {
            writer,
            peer_addr,
            send: SendState::default(),
            wake,
        }
    }

    fn stream(&self) -> &TcpStream {
        self.writer.as_ref()
    }
}

impl Peer for TokioConnection {
    fn is_disconnected(&self) -> bool {
        self.send.is_closed()
    }

    fn send_space(&self) -> usize {
        if self.send.is_idle() {
            socket::send_space(self.stream())
        } else {
            0
        }
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        let writer = &self.writer;
        self.send.submit(bytes, |b| writer.try_write(b))
    }

    /// Shutting down both directions wakes the reader, which then reports
    /// `Disconnected`.
    fn close(&mut self) {
        if self.send.mark_closed() {
            socket::shutdown(self.stream());
        }
    }
}

impl Link for TokioConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn flush(&mut self) -> io::Result<()> {
        let writer = &self.writer;
        self.send.flush(|b| writer.try_write(b))
    }

    fn take_fault(&mut self) -> Option<io::Error> {
        self.send.take_fault()
    }

    fn take_acked(&mut self) -> usize {
        self.send.take_acked()
    }

    fn wait_writable(&mut self) {
        self.wake.notify_one();
    }
}

/// Chargen server on the Tokio runtime.
pub struct Server {
    listener: TcpListener,
    config: Config,
}

impl Server {
    /// Bind the listener. Must be called from within a Tokio runtime.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::from_std(socket::create_listener(addr)?)?;

        info!(
            max_connections = config.max_connections,
            poll_interval_ms = config.poll_interval_ms,
            "Starting tokio runtime"
        );

        Ok(Self {
            listener,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, forwarding them to the engine task.
    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "Listening");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(engine_loop(rx, tx.clone(), self.config));

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if tx.send(Message::Connected { stream, peer_addr }).is_err() {
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "engine task stopped",
                        ));
                    }
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                }
            }
        }
    }
}

/// Owns the flow engine. Handles one message or timer at a time.
async fn engine_loop(
    mut rx: UnboundedReceiver<Message>,
    tx: UnboundedSender<Message>,
    config: Config,
) {
    let mut dispatcher: Dispatcher<TokioConnection> = Dispatcher::new(config.max_connections);

    let mut poll_tick = time::interval(config.poll_interval());
    poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut status_tick = config
        .status_interval()
        .map(|period| time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            biased;

            message = rx.recv() => match message {
                Some(Message::Connected { stream, peer_addr }) => {
                    let (reader, writer) = stream.into_split();
                    let wake = Arc::new(Notify::new());
                    let conn = dispatcher.insert(TokioConnection::new(writer, peer_addr, wake.clone()));
                    debug!(%conn, peer = %peer_addr, open = dispatcher.len(), "Accepted connection");
                    tokio::spawn(read_loop(conn, reader, wake, tx.clone()));
                    dispatcher.dispatch(conn, EventKind::Accepted);
                }
                Some(Message::Event(Event { conn, kind: EventKind::Disconnected })) => {
                    dispatcher.disconnect(conn);
                }
                Some(Message::Event(Event { conn, kind })) => {
                    dispatcher.dispatch(conn, kind);
                }
                None => break,
            },

            _ = poll_tick.tick() => {
                dispatcher.poll_all();
            }

            _ = next_tick(&mut status_tick) => {
                dispatcher.report_status(&config.listen);
            }

            _ = std::future::ready(()), if dispatcher.has_pending_acks() => {
                dispatcher.acknowledge();
                tokio::task::yield_now().await;
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Serve the read side of `conn` until EOF or error, then report the disconnect.
///
/// Peer data is discarded. After `wake` fires the task waits for room in the
/// send buffer and delivers `Acked`, so a stalled stream resumes without
/// waiting for the next poll tick.
async fn read_loop(
    conn: ConnId,
    reader: OwnedReadHalf,
    wake: Arc<Notify>,
    tx: UnboundedSender<Message>,
) {
    let mut scratch = [0u8; READ_CHUNK];
    let mut stalled = false;
    loop {
        let result = tokio::select! {
            ready = reader.readable() => match ready {
                Ok(()) => drain_input(&reader, &mut scratch),
                Err(error) => Err(error),
            },
            _ = wake.notified(), if !stalled => {
                stalled = true;
                Ok(false)
            }
            room = wait_for_room(reader.as_ref()), if stalled => match room {
                Ok(()) => {
                    stalled = false;
                    let acked = Event::new(conn, EventKind::Acked { bytes: 0 });
                    if tx.send(Message::Event(acked)).is_err() {
                        return;
                    }
                    Ok(false)
                }
                Err(error) => Err(error),
            },
        };

        match result {
            Ok(false) => {}
            Ok(true) => break,
            Err(error) => {
                let _ = tx.send(Message::Event(Event::new(conn, EventKind::Error(error))));
                break;
            }
        }
    }
    let _ = tx.send(Message::Event(Event::new(conn, EventKind::Disconnected)));
}

/// Read and discard whatever is buffered. Returns `true` on EOF.
fn drain_input(reader: &OwnedReadHalf, scratch: &mut [u8]) -> io::Result<bool> {
    loop {
        match reader.try_read(scratch) {
            Ok(0) => return Ok(true),
            Ok(_) => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Wait until the send buffer has room for a whole line.
///
/// Readiness is cleared while the buffer is still too full, so the next wait
/// parks until the kernel reports more space.
async fn wait_for_room(stream: &TcpStream) -> io::Result<()> {
    loop {
        stream.writable().await?;
        let room = stream.try_io(Interest::WRITABLE, || {
            if socket::send_space(stream) >= FRAME_LEN {
                Ok(())
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            }
        });
        match room {
            Ok(()) => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}
