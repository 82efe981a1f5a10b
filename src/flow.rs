//! Flow-controlled line generator.
//!
//! The transport delivers per-connection events in order:
//! `Accepted -> {Acked | Poll}* -> Error? -> Disconnected`.
//! For each event the engine decides whether to push the next line,
//! using the slot table for admission and rotation state.
//!
//! Emission is level-triggered: every `Acked` or `Poll` event re-runs the
//! same capacity check and writes at most one line.

use crate::pattern::{frame_at, FRAME_LEN};
use crate::slots::{ConnId, SlotTable};
use std::io;
use tracing::{info, trace, warn};

/// Capabilities the transport exposes for one connection.
pub trait Peer {
    /// Whether the connection has already gone away.
    fn is_disconnected(&self) -> bool;

    /// Bytes that can be written right now without overrunning the send buffer.
    fn send_space(&self) -> usize;

    /// Submit `bytes` for sending. Returns whether the transport accepted them.
    fn write(&mut self, bytes: &[u8]) -> bool;

    /// Close the connection. The transport follows up with `Disconnected`.
    fn close(&mut self);
}

/// What happened on a connection.
#[derive(Debug)]
pub enum EventKind {
    /// The transport accepted a new connection.
    Accepted,
    /// Previously sent data was acknowledged; buffer space may be available.
    Acked { bytes: usize },
    /// Periodic poll from the transport.
    Poll,
    /// Transport error.
    Error(io::Error),
    /// The connection is gone.
    Disconnected,
}

/// Event message routed to the engine.
#[derive(Debug)]
pub struct Event {
    pub conn: ConnId,
    pub kind: EventKind,
}

impl Event {
    pub fn new(conn: ConnId, kind: EventKind) -> Self {
        Self { conn, kind }
    }
}

/// Result of handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Connection admitted into a slot.
    Admitted { slot: usize, sent: bool },
    /// Table full; the connection was closed without data.
    Rejected,
    /// One line written.
    Sent,
    /// Not enough send space, or the write was refused. Retry on a later event.
    Deferred,
    /// Event for a connection that is not in the table.
    Ignored,
    /// Connection closed after an error; cleanup follows on disconnect.
    Closing,
    /// Slot freed.
    Released { slot: usize },
}

/// Per-connection chargen state machine.
#[derive(Debug)]
pub struct FlowEngine {
    slots: SlotTable,
}

impl FlowEngine {
    /// Create an engine owning a table of `max_connections` slots.
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: SlotTable::new(max_connections),
        }
    }

    /// Slot table, for diagnostics.
    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Dispatch one event for the connection behind `peer`.
    pub fn handle<P: Peer>(&mut self, event: Event, peer: &mut P) -> Outcome {
        let conn = event.conn;
        match event.kind {
            EventKind::Accepted => self.accept(conn, peer),
            EventKind::Acked { bytes } => {
                trace!(%conn, bytes, "Acknowledged");
                self.emit_line(conn, peer)
            }
            EventKind::Poll => self.emit_line(conn, peer),
            EventKind::Error(error) => self.fail(conn, error, peer),
            EventKind::Disconnected => self.disconnect(conn),
        }
    }

    fn accept<P: Peer>(&mut self, conn: ConnId, peer: &mut P) -> Outcome {
        match self.slots.admit(conn) {
            Ok(slot) => {
                info!(%conn, slot, active = self.slots.occupied(), "Client connected");
                let sent = self.emit_line(conn, peer) == Outcome::Sent;
                Outcome::Admitted { slot, sent }
            }
            Err(full) => {
                info!(%conn, capacity = self.slots.capacity(), "Connection rejected: {full}");
                peer.close();
                Outcome::Rejected
            }
        }
    }

    /// Push the next line for `conn` if the transport has room for it.
    pub fn emit_line<P: Peer>(&mut self, conn: ConnId, peer: &mut P) -> Outcome {
        if peer.is_disconnected() {
            return Outcome::Ignored;
        }

        let Some(slot) = self.slots.find_mut(conn) else {
            trace!(%conn, "Event for unknown connection");
            return Outcome::Ignored;
        };

        let space = peer.send_space();
        if space < FRAME_LEN {
            trace!(%conn, space, "Send buffer full, deferring line");
            return Outcome::Deferred;
        }

        let start = slot.cursor();
        let frame = frame_at(start);
        if !peer.write(&frame) {
            return Outcome::Deferred;
        }
        slot.advance();

        trace!(%conn, start, "Sent line");
        Outcome::Sent
    }

    fn fail<P: Peer>(&mut self, conn: ConnId, error: io::Error, peer: &mut P) -> Outcome {
        warn!(%conn, %error, "Connection error");
        peer.close();
        Outcome::Closing
    }

    fn disconnect(&mut self, conn: ConnId) -> Outcome {
        let rotation = self.slots.find(conn).map(|slot| slot.cursor());
        match self.slots.release(conn) {
            Some(slot) => {
                info!(%conn, slot, rotation = ?rotation, "Client disconnected");
                Outcome::Released { slot }
            }
            None => Outcome::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{line_at, ALPHABET_LEN, LINE_LENGTH};

    /// In-memory peer that records every accepted write.
    #[derive(Debug)]
    struct MockPeer {
        space: usize,
        refuse_writes: bool,
        closed: bool,
        writes: Vec<Vec<u8>>,
    }

    impl MockPeer {
        fn new(space: usize) -> Self {
            Self {
                space,
                refuse_writes: false,
                closed: false,
                writes: Vec::new(),
            }
        }

        fn roomy() -> Self {
            Self::new(64 * 1024)
        }

        fn bytes_sent(&self) -> usize {
            self.writes.iter().map(Vec::len).sum()
        }
    }

    impl Peer for MockPeer {
        fn is_disconnected(&self) -> bool {
            self.closed
        }

        fn send_space(&self) -> usize {
            self.space
        }

        fn write(&mut self, bytes: &[u8]) -> bool {
            if self.refuse_writes {
                return false;
            }
            self.writes.push(bytes.to_vec());
            true
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn expected_frame(start: usize) -> Vec<u8> {
        let mut frame = line_at(start, LINE_LENGTH);
        frame.extend_from_slice(b"\r\n");
        frame
    }

    fn ev(conn: usize, kind: EventKind) -> Event {
        Event::new(ConnId(conn), kind)
    }

    #[test]
    fn test_accept_sends_first_line() {
        let mut engine = FlowEngine::new(2);
        let mut peer = MockPeer::roomy();

        let outcome = engine.handle(ev(1, EventKind::Accepted), &mut peer);
        assert_eq!(outcome, Outcome::Admitted { slot: 0, sent: true });
        assert_eq!(peer.writes, vec![expected_frame(0)]);
        assert_eq!(engine.slots().find(ConnId(1)).unwrap().cursor(), 1);
    }

    #[test]
    fn test_rotation_over_many_lines() {
        let mut engine = FlowEngine::new(1);
        let mut peer = MockPeer::roomy();
        engine.handle(ev(1, EventKind::Accepted), &mut peer);

        for k in 1..300 {
            let kind = if k % 3 == 0 {
                EventKind::Poll
            } else {
                EventKind::Acked { bytes: FRAME_LEN }
            };
            assert_eq!(engine.handle(ev(1, kind), &mut peer), Outcome::Sent);
        }

        assert_eq!(peer.writes.len(), 300);
        for (k, frame) in peer.writes.iter().enumerate() {
            assert_eq!(frame, &expected_frame(k % ALPHABET_LEN), "line {k}");
        }
    }

    #[test]
    fn test_backpressure_gate() {
        let mut engine = FlowEngine::new(1);
        let mut peer = MockPeer::new(FRAME_LEN - 1);

        // First line is held back too; the slot is still taken
        let outcome = engine.handle(ev(1, EventKind::Accepted), &mut peer);
        assert_eq!(outcome, Outcome::Admitted { slot: 0, sent: false });
        assert!(peer.writes.is_empty());

        assert_eq!(engine.handle(ev(1, EventKind::Poll), &mut peer), Outcome::Deferred);
        assert_eq!(
            engine.handle(ev(1, EventKind::Acked { bytes: 10 }), &mut peer),
            Outcome::Deferred
        );
        assert!(peer.writes.is_empty());

        peer.space = FRAME_LEN;
        assert_eq!(engine.handle(ev(1, EventKind::Poll), &mut peer), Outcome::Sent);
        assert_eq!(peer.writes.len(), 1);

        // Plenty of room still means one line per event
        peer.space = 10 * FRAME_LEN;
        engine.handle(ev(1, EventKind::Acked { bytes: FRAME_LEN }), &mut peer);
        assert_eq!(peer.writes.len(), 2);
        assert_eq!(peer.writes[1], expected_frame(1));
    }

    #[test]
    fn test_refused_write_does_not_rotate() {
        let mut engine = FlowEngine::new(1);
        let mut peer = MockPeer::roomy();
        engine.handle(ev(1, EventKind::Accepted), &mut peer);

        peer.refuse_writes = true;
        assert_eq!(engine.handle(ev(1, EventKind::Poll), &mut peer), Outcome::Deferred);
        assert_eq!(engine.slots().find(ConnId(1)).unwrap().cursor(), 1);

        peer.refuse_writes = false;
        engine.handle(ev(1, EventKind::Poll), &mut peer);
        assert_eq!(peer.writes[1], expected_frame(1));
    }

    #[test]
    fn test_rejection_when_full() {
        let mut engine = FlowEngine::new(2);
        let mut a = MockPeer::roomy();
        let mut b = MockPeer::roomy();
        let mut c = MockPeer::roomy();
        engine.handle(ev(1, EventKind::Accepted), &mut a);
        engine.handle(ev(2, EventKind::Accepted), &mut b);

        let before = engine.slots().snapshot();
        assert_eq!(engine.handle(ev(3, EventKind::Accepted), &mut c), Outcome::Rejected);
        assert!(c.closed);
        assert_eq!(c.bytes_sent(), 0);
        assert_eq!(engine.slots().snapshot(), before);
        assert_eq!(engine.slots().occupied(), 2);

        // The transport's follow-up disconnect for the rejected handle is harmless
        assert_eq!(engine.handle(ev(3, EventKind::Disconnected), &mut c), Outcome::Ignored);
        assert_eq!(engine.slots().snapshot(), before);
    }

    #[test]
    fn test_error_closes_without_releasing() {
        let mut engine = FlowEngine::new(1);
        let mut peer = MockPeer::roomy();
        engine.handle(ev(1, EventKind::Accepted), &mut peer);

        let error = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(engine.handle(ev(1, EventKind::Error(error)), &mut peer), Outcome::Closing);
        assert!(peer.closed);
        assert_eq!(engine.slots().occupied(), 1);

        // Closed peers get no more lines
        assert_eq!(engine.handle(ev(1, EventKind::Poll), &mut peer), Outcome::Ignored);
        assert_eq!(peer.writes.len(), 1);

        assert_eq!(
            engine.handle(ev(1, EventKind::Disconnected), &mut peer),
            Outcome::Released { slot: 0 }
        );
        assert_eq!(engine.slots().occupied(), 0);
    }

    #[test]
    fn test_repeated_accept_does_not_leak_a_slot() {
        let mut engine = FlowEngine::new(2);
        let mut peer = MockPeer::roomy();

        assert_eq!(
            engine.handle(ev(1, EventKind::Accepted), &mut peer),
            Outcome::Admitted { slot: 0, sent: true }
        );
        assert_eq!(
            engine.handle(ev(1, EventKind::Accepted), &mut peer),
            Outcome::Admitted { slot: 0, sent: true }
        );
        assert_eq!(engine.slots().occupied(), 1);
        assert_eq!(peer.writes, vec![expected_frame(0), expected_frame(1)]);

        engine.handle(ev(1, EventKind::Disconnected), &mut peer);
        assert_eq!(engine.slots().occupied(), 0);
    }

    #[test]
    fn test_double_disconnect_is_idempotent() {
        let mut engine = FlowEngine::new(2);
        let mut a = MockPeer::roomy();
        let mut b = MockPeer::roomy();
        engine.handle(ev(1, EventKind::Accepted), &mut a);
        engine.handle(ev(2, EventKind::Accepted), &mut b);

        engine.handle(ev(1, EventKind::Disconnected), &mut a);
        let once = engine.slots().snapshot();
        assert_eq!(engine.handle(ev(1, EventKind::Disconnected), &mut a), Outcome::Ignored);
        assert_eq!(engine.slots().snapshot(), once);
    }

    #[test]
    fn test_event_after_release_is_ignored() {
        let mut engine = FlowEngine::new(1);
        let mut peer = MockPeer::roomy();
        engine.handle(ev(1, EventKind::Accepted), &mut peer);
        engine.handle(ev(1, EventKind::Disconnected), &mut peer);

        assert_eq!(
            engine.handle(ev(1, EventKind::Acked { bytes: FRAME_LEN }), &mut peer),
            Outcome::Ignored
        );
        assert_eq!(peer.writes.len(), 1);
    }

    #[test]
    fn test_cursors_are_per_connection() {
        let mut engine = FlowEngine::new(2);
        let mut x = MockPeer::roomy();
        let mut y = MockPeer::roomy();
        engine.handle(ev(1, EventKind::Accepted), &mut x);
        for _ in 0..5 {
            engine.handle(ev(1, EventKind::Poll), &mut x);
        }

        engine.handle(ev(2, EventKind::Accepted), &mut y);
        assert_eq!(y.writes, vec![expected_frame(0)]);
        assert_eq!(engine.slots().find(ConnId(1)).unwrap().cursor(), 6);
        assert_eq!(engine.slots().find(ConnId(2)).unwrap().cursor(), 1);
    }

    #[test]
    fn test_capacity_two_scenario() {
        let mut engine = FlowEngine::new(2);
        let mut x = MockPeer::roomy();
        let mut y = MockPeer::roomy();
        let mut z = MockPeer::roomy();
        let mut w = MockPeer::roomy();

        engine.handle(ev(1, EventKind::Accepted), &mut x);
        let first = b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefg\r\n";
        assert_eq!(x.writes[0], first.to_vec());

        assert_eq!(
            engine.handle(ev(2, EventKind::Accepted), &mut y),
            Outcome::Admitted { slot: 1, sent: true }
        );
        engine.handle(ev(1, EventKind::Poll), &mut x);
        engine.handle(ev(1, EventKind::Poll), &mut x);

        assert_eq!(engine.handle(ev(3, EventKind::Accepted), &mut z), Outcome::Rejected);
        assert!(z.closed);
        assert!(z.writes.is_empty());

        assert_eq!(
            engine.handle(ev(1, EventKind::Disconnected), &mut x),
            Outcome::Released { slot: 0 }
        );
        assert_eq!(
            engine.handle(ev(4, EventKind::Accepted), &mut w),
            Outcome::Admitted { slot: 0, sent: true }
        );
        assert_eq!(w.writes, vec![first.to_vec()]);
        assert_eq!(engine.slots().find(ConnId(2)).unwrap().cursor(), 1);
    }
}
