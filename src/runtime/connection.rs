//! Transport-side connection bookkeeping.
//!
//! Each transport wraps its socket in a [`Link`], stores it in a
//! slab-backed [`ConnectionRegistry`], and hands the engine a borrowed
//! reference for every event. The registry key doubles as the engine's
//! connection handle.

use crate::flow::Peer;
use crate::slots::ConnId;
use bytes::{Buf, BytesMut};
use slab::Slab;
use std::io;
use std::net::SocketAddr;

/// A transport connection as seen by the dispatcher.
pub trait Link: Peer {
    /// Remote address of the connection.
    fn peer_addr(&self) -> SocketAddr;

    /// Push out any partially written line. Called before every emission attempt.
    fn flush(&mut self) -> io::Result<()>;

    /// Error raised by a write since the last call.
    fn take_fault(&mut self) -> Option<io::Error>;

    /// Bytes handed to the kernel since the last call.
    fn take_acked(&mut self) -> usize;

    /// The engine held a line back. Transports without writable edges arm a
    /// wakeup here so an `Acked` follows once the socket drains.
    fn wait_writable(&mut self) {}
}

/// Outgoing byte bookkeeping shared by the socket-backed links.
///
/// A line the kernel only partly accepted keeps its tail in `pending`;
/// no new line is accepted until that tail has been flushed.
#[derive(Debug, Default)]
pub struct SendState {
    pending: BytesMut,
    fault: Option<io::Error>,
    acked: usize,
    closed: bool,
}

impl SendState {
    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark closed. Returns `true` the first time.
    pub fn mark_closed(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    /// Whether a new line may be submitted.
    pub fn is_idle(&self) -> bool {
        !self.closed && self.pending.is_empty()
    }

    /// Submit `bytes` through `try_write`, keeping any unwritten tail.
    pub fn submit<F>(&mut self, bytes: &[u8], mut try_write: F) -> bool
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        if !self.is_idle() {
            return false;
        }
        match try_write(bytes) {
            Ok(n) => {
                if n < bytes.len() {
                    self.pending.extend_from_slice(&bytes[n..]);
                }
                self.acked += n;
                true
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                false
            }
            Err(e) => {
                self.fault = Some(e);
                false
            }
        }
    }

    /// Write out the pending tail until done or the socket would block.
    pub fn flush<F>(&mut self, mut try_write: F) -> io::Result<()>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        while !self.pending.is_empty() {
            match try_write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.pending.advance(n);
                    self.acked += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Take the error recorded by the last failed write, if any.
    pub fn take_fault(&mut self) -> Option<io::Error> {
        self.fault.take()
    }

    /// Take the count of bytes the kernel accepted since the last call.
    pub fn take_acked(&mut self) -> usize {
        std::mem::take(&mut self.acked)
    }
}

/// Registry of live transport connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Admission limits
/// are enforced by the engine's slot table, not here.
#[derive(Debug)]
pub struct ConnectionRegistry<L> {
    connections: Slab<L>,
}

impl<L> ConnectionRegistry<L> {
    /// Create a registry with room for `capacity` connections before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
        }
    }

    /// Insert a new connection and return its handle.
    pub fn insert(&mut self, link: L) -> ConnId {
        ConnId(self.connections.insert(link))
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, conn: ConnId) -> Option<&L> {
        self.connections.get(conn.0)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, conn: ConnId) -> Option<&mut L> {
        self.connections.get_mut(conn.0)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, conn: ConnId) -> Option<L> {
        self.connections.try_remove(conn.0)
    }

    /// Handles of every registered connection.
    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.iter().map(|(key, _)| ConnId(key)).collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_whole_line() {
        let mut state = SendState::default();
        let mut sink = Vec::new();

        assert!(state.submit(b"hello", |b| {
            sink.extend_from_slice(b);
            Ok(b.len())
        }));
        assert_eq!(sink, b"hello");
        assert!(state.is_idle());
        assert_eq!(state.take_acked(), 5);
        assert_eq!(state.take_acked(), 0);
    }

    #[test]
    fn test_partial_write_keeps_tail() {
        let mut state = SendState::default();

        assert!(state.submit(b"abcdef", |_| Ok(2)));
        assert!(!state.is_idle());
        // Nothing new is accepted while the tail is pending
        assert!(!state.submit(b"xyz", |b| Ok(b.len())));

        let mut sink = Vec::new();
        state
            .flush(|b| {
                sink.extend_from_slice(b);
                Ok(b.len())
            })
            .unwrap();
        assert_eq!(sink, b"cdef");
        assert!(state.is_idle());
        assert_eq!(state.take_acked(), 6);
    }

    #[test]
    fn test_flush_stops_on_would_block() {
        let mut state = SendState::default();
        state.submit(b"abcdef", |_| Ok(0));

        let result = state.flush(|_| Err(io::ErrorKind::WouldBlock.into()));
        assert!(result.is_ok());
        assert!(!state.is_idle());
    }

    #[test]
    fn test_would_block_refuses_without_fault() {
        let mut state = SendState::default();
        assert!(!state.submit(b"abc", |_| Err(io::ErrorKind::WouldBlock.into())));
        assert!(state.take_fault().is_none());
        assert!(state.is_idle());
    }

    #[test]
    fn test_write_error_recorded_as_fault() {
        let mut state = SendState::default();
        assert!(!state.submit(b"abc", |_| Err(io::ErrorKind::BrokenPipe.into())));
        let fault = state.take_fault().unwrap();
        assert_eq!(fault.kind(), io::ErrorKind::BrokenPipe);
        assert!(state.take_fault().is_none());
    }

    #[test]
    fn test_closed_refuses() {
        let mut state = SendState::default();
        assert!(state.mark_closed());
        assert!(!state.mark_closed());
        assert!(!state.submit(b"abc", |b| Ok(b.len())));
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::with_capacity(2);

        let a = registry.insert("a");
        let b = registry.insert("b");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a), Some(&"a"));
        assert_eq!(registry.ids(), vec![a, b]);

        assert_eq!(registry.remove(a), Some("a"));
        assert_eq!(registry.remove(a), None);
        assert_eq!(registry.len(), 1);

        // Slab reuses the freed key
        let c = registry.insert("c");
        assert_eq!(c, a);
    }
}
