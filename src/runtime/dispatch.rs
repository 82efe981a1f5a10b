//! Routes transport events to the flow engine.
//!
//! Both transports share this loop body. The dispatcher owns the engine and
//! the transport's connection registry, and turns transport-level facts into
//! engine events:
//!
//! - a line accepted by the kernel is acknowledged on the next turn,
//! - every poll tick polls every connection,
//! - a write fault becomes an `Error` event,
//! - a link closed during dispatch is reported back so the transport can
//!   deliver `Disconnected` once its socket is gone.

use crate::flow::{Event, EventKind, FlowEngine, Outcome, Peer};
use crate::runtime::connection::{ConnectionRegistry, Link};
use crate::slots::ConnId;
use crate::status;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Event router shared by the mio and Tokio transports.
pub struct Dispatcher<L> {
    engine: FlowEngine,
    links: ConnectionRegistry<L>,
    /// Connections whose last line was accepted, acknowledged on the next turn.
    acks: VecDeque<ConnId>,
}

impl<L: Link> Dispatcher<L> {
    /// Create a dispatcher serving at most `max_connections` clients.
    pub fn new(max_connections: usize) -> Self {
        Self {
            engine: FlowEngine::new(max_connections),
            links: ConnectionRegistry::with_capacity(max_connections),
            acks: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    /// Register a freshly accepted link. Deliver `Accepted` with [`dispatch`](Self::dispatch).
    pub fn insert(&mut self, link: L) -> ConnId {
        self.links.insert(link)
    }

    /// Mutable access to a registered link.
    pub fn link_mut(&mut self, conn: ConnId) -> Option<&mut L> {
        self.links.get_mut(conn)
    }

    /// Whether any accepted line still awaits its acknowledgement.
    pub fn has_pending_acks(&self) -> bool {
        !self.acks.is_empty()
    }

    /// Deliver one event. Returns `true` if the link is now closed.
    pub fn dispatch(&mut self, conn: ConnId, kind: EventKind) -> bool {
        let Some(link) = self.links.get_mut(conn) else {
            return false;
        };

        let kind = match kind {
            EventKind::Acked { .. } | EventKind::Poll => match link.flush() {
                Ok(()) => kind,
                Err(error) => EventKind::Error(error),
            },
            other => other,
        };

        match self.engine.handle(Event::new(conn, kind), link) {
            Outcome::Sent => self.acks.push_back(conn),
            Outcome::Admitted { slot, sent } => {
                trace!(%conn, slot, sent, "Admitted");
                if sent {
                    self.acks.push_back(conn);
                } else {
                    link.wait_writable();
                }
            }
            Outcome::Deferred => link.wait_writable(),
            _ => {}
        }

        if let Some(error) = link.take_fault() {
            self.engine.handle(Event::new(conn, EventKind::Error(error)), link);
        }

        link.is_disconnected()
    }

    /// Acknowledge every line accepted since the previous turn.
    ///
    /// Returns the links that closed while doing so.
    pub fn acknowledge(&mut self) -> Vec<ConnId> {
        let due: Vec<ConnId> = self.acks.drain(..).collect();
        let mut closed = Vec::new();
        for conn in due {
            let Some(link) = self.links.get_mut(conn) else {
                continue;
            };
            let bytes = link.take_acked();
            if self.dispatch(conn, EventKind::Acked { bytes }) {
                closed.push(conn);
            }
        }
        closed
    }

    /// Deliver a poll to every connection. Returns the links that closed.
    pub fn poll_all(&mut self) -> Vec<ConnId> {
        self.links
            .ids()
            .into_iter()
            .filter(|&conn| self.dispatch(conn, EventKind::Poll))
            .collect()
    }

    /// Drop `conn` from the registry and deliver its final `Disconnected`.
    ///
    /// Returns the link so the transport can release the socket.
    pub fn disconnect(&mut self, conn: ConnId) -> Option<L> {
        let mut link = self.links.remove(conn)?;
        link.close();
        self.acks.retain(|&pending| pending != conn);
        let slot = match self
            .engine
            .handle(Event::new(conn, EventKind::Disconnected), &mut link)
        {
            Outcome::Released { slot } => Some(slot),
            _ => None,
        };
        debug!(%conn, peer = %link.peer_addr(), slot = ?slot, "Connection closed");
        Some(link)
    }

    /// Log the status report for the current slot table.
    pub fn report_status(&self, listen: &str) {
        status::report(listen, &self.engine.slots().snapshot(), |conn| {
            self.links.get(conn).map(Link::peer_addr)
        });
    }

    /// Number of open transport connections, admitted or not.
    pub fn len(&self) -> usize {
        self.links.len()
    }
}
