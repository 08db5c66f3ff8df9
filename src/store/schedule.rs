use ulid::Ulid;

use crate::model::*;

/// Calendar footprint of one booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub booking_id: Ulid,
    pub code: String,
    pub span: Span,
    pub status: BookingStatus,
}

impl Slot {
    pub fn of(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id,
            code: booking.code.clone(),
            span: booking.span,
            status: booking.status,
        }
    }
}

/// A space plus its bookings, kept sorted by `span.start`. One of these sits
/// behind each per-space lock; holding the write lock is what makes
/// check-then-insert atomic.
#[derive(Debug, Clone)]
pub struct SpaceSchedule {
    pub space: Space,
    slots: Vec<Slot>,
}

impl SpaceSchedule {
    pub fn new(space: Space) -> Self {
        Self {
            space,
            slots: Vec::new(),
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Insert or replace by booking id, maintaining sort order.
    pub fn upsert_slot(&mut self, slot: Slot) {
        self.remove_slot(slot.booking_id);
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, booking_id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.booking_id == booking_id)?;
        Some(self.slots.remove(pos))
    }

    /// Slots whose span overlaps the query window. Binary search skips
    /// everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    /// First active booking inside `[span.start - buffer, span.end + buffer)`.
    pub fn find_overlap(&self, span: &Span, buffer: Ms) -> Option<&Slot> {
        let padded = span.expand(buffer);
        self.overlapping(&padded).find(|s| s.status.is_active())
    }

    /// Active slots in `query`, each widened by `buffer`, sorted by start.
    pub fn blocked_spans(&self, query: &Span, buffer: Ms) -> Vec<Span> {
        let padded = query.expand(buffer);
        self.overlapping(&padded)
            .filter(|s| s.status.is_active())
            .map(|s| s.span.expand(buffer))
            .collect()
    }
}
