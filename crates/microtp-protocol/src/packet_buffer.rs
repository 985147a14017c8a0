//! Wraparound-indexed packet window.
//!
//! A [`PacketBuffer`] is an ordered collection of slots addressed by 16-bit
//! sequence number. The same structure backs both sides of a socket: the
//! send window holds in-flight packets awaiting acknowledgment, the receive
//! window holds out-of-order packets awaiting reassembly.
//!
//! The window is described by a `cursor` (the oldest live sequence number)
//! and a `span` (`(last - first) mod 65536`), which keeps it correct across
//! 16-bit wraparound without a carry bit. Storage capacity is a power of two
//! and grows by doubling; a slot for sequence `s` lives at `s & (capacity -
//! 1)`, so lookup is O(1). Each occupied slot remembers its exact sequence
//! number so a stale occupant can never be mistaken for a live one.

use microtp_core::{
    constants::MAX_SEQUENCE_SPAN,
    error::{ErrorKind, Result},
};

use crate::packet::{sequence_distance, SequenceNumber};

/// Capacity never exceeds half the sequence space; beyond that two live
/// indices could not be ordered.
const MAX_CAPACITY: usize = MAX_SEQUENCE_SPAN as usize;

/// A wraparound-indexed window of ownership slots.
///
/// Generic over the stored packet type so the send window can hold owned
/// in-flight packets while tests exercise the arithmetic with plain values.
#[derive(Debug)]
pub struct PacketBuffer<T> {
    /// Power-of-two storage; slot for sequence `s` is `s & (capacity - 1)`.
    storage: Vec<Option<(SequenceNumber, T)>>,
    /// Oldest sequence number still considered live.
    cursor: SequenceNumber,
    /// Width of the active window in sequence-number space.
    span: u16,
    /// Number of occupied slots.
    occupied: usize,
}

impl<T> PacketBuffer<T> {
    /// Creates an empty buffer with the given initial capacity (rounded up
    /// to a power of two) and a cursor of zero.
    pub fn new(initial_capacity: usize) -> Self {
        Self::with_cursor(0, initial_capacity)
    }

    /// Creates an empty buffer whose window starts at `cursor`.
    ///
    /// Sockets anchor the receive window at the first sequence learned
    /// during the handshake.
    pub fn with_cursor(cursor: SequenceNumber, initial_capacity: usize) -> Self {
        let capacity = initial_capacity.next_power_of_two().min(MAX_CAPACITY).max(1);
        Self {
            storage: (0..capacity).map(|_| None).collect(),
            cursor,
            span: 0,
            occupied: 0,
        }
    }

    /// Returns the sequence number of the oldest live slot.
    pub fn cursor(&self) -> SequenceNumber {
        self.cursor
    }

    /// Re-anchors an empty window at `cursor`.
    ///
    /// Panics if any slot is occupied; the anchor of a live window moves
    /// only through [`advance_cursor_to`](Self::advance_cursor_to).
    pub fn reset_cursor(&mut self, cursor: SequenceNumber) {
        assert!(self.occupied == 0, "cannot re-anchor a non-empty window");
        self.cursor = cursor;
        self.span = 0;
    }

    /// Returns the width of the active window in sequence numbers.
    pub fn span(&self) -> u16 {
        self.span
    }

    /// Returns the number of occupied slots.
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Returns true if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Returns the current storage capacity.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn slot(&self, sequence: SequenceNumber) -> usize {
        sequence as usize & (self.storage.len() - 1)
    }

    /// Validates that `sequence` is addressable relative to the cursor,
    /// returning its forward distance.
    fn window_offset(&self, sequence: SequenceNumber) -> Result<u16> {
        let distance = sequence_distance(sequence, self.cursor);
        if distance < 0 {
            return Err(ErrorKind::OutOfWindow {
                sequence,
                cursor: self.cursor,
                span: self.span,
            });
        }
        Ok(distance as u16)
    }

    /// Stores `value` at `sequence`, growing capacity by doubling if the
    /// index falls outside current capacity relative to the cursor.
    ///
    /// Returns whatever previously occupied that slot so the caller can
    /// release it. Indices behind the cursor, or far enough ahead that they
    /// would require growth past half the sequence space, are rejected with
    /// [`ErrorKind::OutOfWindow`] rather than growing without bound or
    /// silently corrupting an unrelated slot.
    pub fn insert(&mut self, sequence: SequenceNumber, value: T) -> Result<Option<T>> {
        self.insert_or_reject(sequence, value).map_err(|(err, _)| err)
    }

    /// Variant of [`insert`](Self::insert) that hands the value back on
    /// rejection, for callers holding pooled storage that must be released
    /// rather than dropped.
    pub fn insert_or_reject(
        &mut self,
        sequence: SequenceNumber,
        value: T,
    ) -> std::result::Result<Option<T>, (ErrorKind, T)> {
        let offset = match self.window_offset(sequence) {
            Ok(offset) => offset,
            Err(err) => return Err((err, value)),
        };
        // A positive signed distance is at most 32767, so growth below is
        // bounded by MAX_CAPACITY.
        debug_assert!((offset as usize) < MAX_CAPACITY);
        while offset as usize >= self.storage.len() {
            self.grow();
        }

        let slot = self.slot(sequence);
        let previous = self.storage[slot].take();
        self.storage[slot] = Some((sequence, value));
        if previous.is_none() {
            self.occupied += 1;
        }
        if offset >= self.span {
            self.span = offset + 1;
        }
        Ok(previous.map(|(_, stored)| stored))
    }

    /// Doubles storage capacity, rehoming every occupied slot.
    fn grow(&mut self) {
        let new_capacity = (self.storage.len() * 2).min(MAX_CAPACITY);
        debug_assert!(new_capacity > self.storage.len());
        let mut new_storage: Vec<Option<(SequenceNumber, T)>> =
            (0..new_capacity).map(|_| None).collect();
        for entry in self.storage.drain(..) {
            if let Some((sequence, value)) = entry {
                let slot = sequence as usize & (new_capacity - 1);
                new_storage[slot] = Some((sequence, value));
            }
        }
        self.storage = new_storage;
    }

    /// Returns a reference to the packet at `sequence`, if the slot is
    /// occupied and the index is inside the window.
    pub fn at(&self, sequence: SequenceNumber) -> Option<&T> {
        if sequence_distance(sequence, self.cursor) < 0 {
            return None;
        }
        match &self.storage[self.slot(sequence)] {
            Some((stored, value)) if *stored == sequence => Some(value),
            _ => None,
        }
    }

    /// Mutable variant of [`at`](Self::at).
    pub fn at_mut(&mut self, sequence: SequenceNumber) -> Option<&mut T> {
        if sequence_distance(sequence, self.cursor) < 0 {
            return None;
        }
        let slot = self.slot(sequence);
        match &mut self.storage[slot] {
            Some((stored, value)) if *stored == sequence => Some(value),
            _ => None,
        }
    }

    /// Clears and returns the slot at `sequence` without shrinking capacity.
    pub fn remove(&mut self, sequence: SequenceNumber) -> Option<T> {
        let slot = self.slot(sequence);
        match &self.storage[slot] {
            Some((stored, _)) if *stored == sequence => {
                self.occupied -= 1;
                self.storage[slot].take().map(|(_, value)| value)
            }
            _ => None,
        }
    }

    /// Removes and returns the packet at the cursor, advancing the cursor
    /// past it. Returns `None` if the cursor slot is empty (a gap).
    pub fn pop_front(&mut self) -> Option<T> {
        let value = self.remove(self.cursor)?;
        self.cursor = self.cursor.wrapping_add(1);
        self.span = self.span.saturating_sub(1);
        Some(value)
    }

    /// Moves the cursor forward to `new_cursor`, modulo 65536.
    ///
    /// Slots between the old and new cursor that are still occupied are
    /// dropped: send-window callers remove acknowledged packets before
    /// advancing, receive-window callers advance only past delivered data.
    /// Backward moves are ignored. Returns the number of live entries
    /// dropped, which is zero in correct usage.
    pub fn advance_cursor_to(&mut self, new_cursor: SequenceNumber) -> usize {
        let distance = sequence_distance(new_cursor, self.cursor);
        if distance <= 0 {
            return 0;
        }
        let distance = distance as u16;
        let mut dropped = 0;
        for step in 0..distance.min(self.span) {
            let sequence = self.cursor.wrapping_add(step);
            if self.remove(sequence).is_some() {
                dropped += 1;
            }
        }
        self.cursor = new_cursor;
        self.span = self.span.saturating_sub(distance);
        if dropped > 0 {
            tracing::debug!(
                "Dropped {} live window entries while advancing cursor to {}",
                dropped,
                new_cursor
            );
        }
        dropped
    }

    /// Iterates over occupied sequence numbers from the cursor, in window
    /// order.
    pub fn occupied_sequences(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        (0..self.span)
            .map(move |step| self.cursor.wrapping_add(step))
            .filter(move |sequence| self.at(*sequence).is_some())
    }

    /// Removes every packet from the window, yielding them for release.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.occupied);
        for entry in self.storage.iter_mut() {
            if let Some((_, value)) = entry.take() {
                drained.push(value);
            }
        }
        self.occupied = 0;
        self.span = 0;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_at() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::new(16);
        assert!(buffer.insert(0, 100).unwrap().is_none());
        assert!(buffer.insert(3, 103).unwrap().is_none());

        assert_eq!(buffer.at(0), Some(&100));
        assert_eq!(buffer.at(1), None);
        assert_eq!(buffer.at(3), Some(&103));
        assert_eq!(buffer.span(), 4);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_insert_returns_previous_occupant() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::new(16);
        buffer.insert(5, 1).unwrap();
        let previous = buffer.insert(5, 2).unwrap();
        assert_eq!(previous, Some(1));
        assert_eq!(buffer.at(5), Some(&2));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_insert_behind_cursor_fails() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::with_cursor(100, 16);
        let result = buffer.insert(99, 1);
        assert!(matches!(result, Err(ErrorKind::OutOfWindow { .. })));
    }

    #[test]
    fn test_rejected_insert_hands_the_value_back() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::with_cursor(100, 16);
        let (err, value) = buffer.insert_or_reject(99, 7).unwrap_err();
        assert!(matches!(err, ErrorKind::OutOfWindow { .. }));
        assert_eq!(value, 7);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_insert_too_far_ahead_fails() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::new(16);
        // Growth is bounded at half the sequence space; a stale or malicious
        // index beyond it must fail rather than allocate without bound.
        let result = buffer.insert(40000, 1);
        assert!(matches!(result, Err(ErrorKind::OutOfWindow { .. })));
        assert!(buffer.capacity() <= 32768);
    }

    #[test]
    fn test_growth_by_doubling_preserves_entries() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::new(4);
        assert_eq!(buffer.capacity(), 4);

        for sequence in 0..12u16 {
            buffer.insert(sequence, sequence as u32).unwrap();
        }
        assert!(buffer.capacity() >= 12);
        for sequence in 0..12u16 {
            assert_eq!(buffer.at(sequence), Some(&(sequence as u32)));
        }
    }

    #[test]
    fn test_wraparound_indexing() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::with_cursor(65534, 8);
        buffer.insert(65534, 1).unwrap();
        buffer.insert(65535, 2).unwrap();
        buffer.insert(0, 3).unwrap();
        buffer.insert(1, 4).unwrap();

        assert_eq!(buffer.span(), 4);
        assert_eq!(buffer.at(0), Some(&3));

        assert_eq!(buffer.pop_front(), Some(1));
        assert_eq!(buffer.pop_front(), Some(2));
        assert_eq!(buffer.pop_front(), Some(3));
        assert_eq!(buffer.pop_front(), Some(4));
        assert_eq!(buffer.cursor(), 2);
    }

    #[test]
    fn test_remove_leaves_gap() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::new(8);
        buffer.insert(0, 1).unwrap();
        buffer.insert(1, 2).unwrap();

        assert_eq!(buffer.remove(0), Some(1));
        assert_eq!(buffer.remove(0), None);
        assert_eq!(buffer.at(1), Some(&2));
        // Span is unchanged by remove; only cursor movement shrinks it.
        assert_eq!(buffer.span(), 2);
    }

    #[test]
    fn test_pop_front_stops_at_gap() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::with_cursor(5, 16);
        buffer.insert(5, 50).unwrap();
        buffer.insert(7, 70).unwrap();

        assert_eq!(buffer.pop_front(), Some(50));
        // Sequence 6 is a gap.
        assert_eq!(buffer.pop_front(), None);
        assert_eq!(buffer.cursor(), 6);

        buffer.insert(6, 60).unwrap();
        assert_eq!(buffer.pop_front(), Some(60));
        assert_eq!(buffer.pop_front(), Some(70));
        assert_eq!(buffer.cursor(), 8);
    }

    #[test]
    fn test_advance_cursor_drops_stragglers() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::new(8);
        buffer.insert(0, 1).unwrap();
        buffer.insert(1, 2).unwrap();
        buffer.insert(4, 5).unwrap();

        let dropped = buffer.advance_cursor_to(3);
        assert_eq!(dropped, 2);
        assert_eq!(buffer.cursor(), 3);
        assert_eq!(buffer.span(), 2);
        assert_eq!(buffer.at(4), Some(&5));
    }

    #[test]
    fn test_advance_cursor_backward_is_ignored() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::with_cursor(10, 8);
        buffer.insert(10, 1).unwrap();
        buffer.advance_cursor_to(5);
        assert_eq!(buffer.cursor(), 10);
        assert_eq!(buffer.at(10), Some(&1));
    }

    #[test]
    fn test_reusable_after_cursor_passes() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::new(8);
        // Push the cursor through many multiples of the capacity; every slot
        // must be reusable after the cursor passes it.
        for round in 0u32..100 {
            let base = buffer.cursor();
            buffer.insert(base, round).unwrap();
            assert_eq!(buffer.pop_front(), Some(round));
        }
        assert!(buffer.capacity() <= 8);
    }

    #[test]
    fn test_drain_all_empties_window() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::new(8);
        buffer.insert(0, 1).unwrap();
        buffer.insert(2, 3).unwrap();

        let mut drained = buffer.drain_all();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 3]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.span(), 0);
    }

    #[test]
    fn test_occupied_sequences_in_window_order() {
        let mut buffer: PacketBuffer<u32> = PacketBuffer::with_cursor(65533, 16);
        buffer.insert(65533, 0).unwrap();
        buffer.insert(0, 0).unwrap();
        buffer.insert(65535, 0).unwrap();

        let order: Vec<u16> = buffer.occupied_sequences().collect();
        assert_eq!(order, vec![65533, 65535, 0]);
    }
}
