//! Fixed-capacity table of live chargen connections.
//!
//! Each slot holds at most one connection handle plus the rotation cursor
//! for that connection. Admission is first-fit by slot index and is rejected,
//! never queued, once every slot is occupied.

use crate::pattern::next_start;
use std::fmt;

/// Opaque handle for a transport-layer connection.
///
/// The transport owns the connection; the table only stores the handle and
/// compares handles by equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub usize);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionSlot {
    occupant: Option<ConnId>,
    /// Alphabet offset at which the next line starts.
    cursor: usize,
}

impl ConnectionSlot {
    /// Whether a connection occupies this slot.
    pub fn is_occupied(&self) -> bool {
        self.occupant.is_some()
    }

    /// Start offset of the next line.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Rotate the cursor by one position.
    pub fn advance(&mut self) {
        self.cursor = next_start(self.cursor);
    }

    fn occupy(&mut self, conn: ConnId) {
        self.occupant = Some(conn);
        self.cursor = 0;
    }

    fn clear(&mut self) {
        self.occupant = None;
        self.cursor = 0;
    }
}

/// Returned by [`SlotTable::admit`] when every slot is occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

impl fmt::Display for Full {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection table is full")
    }
}

impl std::error::Error for Full {}

/// Read-only view of one slot, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    pub index: usize,
    pub occupant: Option<ConnId>,
    pub cursor: usize,
}

impl SlotView {
    pub fn is_occupied(&self) -> bool {
        self.occupant.is_some()
    }
}

/// Fixed-size arena of connection slots indexed by slot number.
///
/// Lookups are linear scans; the table is small enough that no index is kept.
#[derive(Debug)]
pub struct SlotTable {
    slots: Box<[ConnectionSlot]>,
}

impl SlotTable {
    /// Create a table with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![ConnectionSlot::default(); capacity].into_boxed_slice(),
        }
    }

    /// Place `conn` into the lowest-numbered free slot.
    ///
    /// Returns the slot index, or [`Full`] without touching the table. A
    /// handle that is already admitted keeps its slot and cursor.
    pub fn admit(&mut self, conn: ConnId) -> Result<usize, Full> {
        if let Some(index) = self.position(conn) {
            return Ok(index);
        }
        let index = self
            .slots
            .iter()
            .position(|slot| !slot.is_occupied())
            .ok_or(Full)?;
        self.slots[index].occupy(conn);
        Ok(index)
    }

    /// Free the slot held by `conn`. Returns the freed index.
    ///
    /// Releasing a handle that is not in the table is a no-op.
    pub fn release(&mut self, conn: ConnId) -> Option<usize> {
        let index = self.position(conn)?;
        self.slots[index].clear();
        Some(index)
    }

    /// Index of the slot occupied by `conn`.
    pub fn position(&self, conn: ConnId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.occupant == Some(conn))
    }

    /// Slot occupied by `conn`.
    pub fn find(&self, conn: ConnId) -> Option<&ConnectionSlot> {
        self.slots.iter().find(|slot| slot.occupant == Some(conn))
    }

    /// Mutable slot occupied by `conn`.
    pub fn find_mut(&mut self, conn: ConnId) -> Option<&mut ConnectionSlot> {
        self.slots
            .iter_mut()
            .find(|slot| slot.occupant == Some(conn))
    }

    /// Ordered view of every slot.
    pub fn snapshot(&self) -> Vec<SlotView> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotView {
                index,
                occupant: slot.occupant,
                cursor: slot.cursor,
            })
            .collect()
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_occupied()).count()
    }

    /// Maximum number of concurrent connections.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
