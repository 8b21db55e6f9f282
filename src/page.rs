//! Serialized page: the unit of data moved between producer and consumer.

use crate::error::Result;
use crate::memory::{MemoryPool, Reservation};
use bytes::Bytes;
use std::sync::Arc;

/// An immutable, size-accounted span of serialized columnar data.
///
/// Handoff moves the page. Cloning the payload (`Bytes`) shares the buffer,
/// it never copies it.
#[derive(Debug)]
pub struct Page {
    data: Bytes,

    /// Position in the producer's stream, when known
    sequence: Option<u64>,

    /// Bytes charged to the pool of the component currently holding the page
    reservation: Option<Reservation>,
}

impl Page {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            sequence: None,
            reservation: None,
        }
    }

    pub fn with_sequence(data: Bytes, sequence: u64) -> Self {
        Self {
            data,
            sequence: Some(sequence),
            reservation: None,
        }
    }

    /// Page of `size` zero bytes. Handy for tests and load generation.
    pub fn zeroed(size: usize) -> Self {
        Self::new(Bytes::from(vec![0u8; size]))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub(crate) fn into_parts(self) -> (Bytes, Option<Reservation>) {
        (self.data, self.reservation)
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Pool currently charged for this page, if any.
    pub fn pool(&self) -> Option<&Arc<MemoryPool>> {
        self.reservation.as_ref().map(|r| r.pool())
    }

    /// Charge this page to `pool`, moving any existing reservation.
    pub fn transfer_to(&mut self, pool: &Arc<MemoryPool>) -> Result<()> {
        match self.reservation.as_mut() {
            Some(reservation) => reservation.transfer_to(pool),
            None => {
                self.reservation = Some(pool.reserve(self.size())?);
                Ok(())
            }
        }
    }
}
