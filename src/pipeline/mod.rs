//! The slot pipeline: a fixed ring of per-format byte buffers.
//!
//! ```text
//! producer -> write slot -> ... -> read slot -> worker -> device
//! ```
//!
//! The producer mutates only the slot at the write index, the worker only
//! the slot at the read index; they alias only when `filled == 0`, at which
//! point each side keeps to its own end of the slot's byte ring. A slot
//! becomes visible to the worker through the `filled` counter: the
//! producer's release increment publishes the slot fields and buffered
//! bytes, the worker's acquire load pairs with it. Slot fields themselves
//! therefore use relaxed atomics.

mod byte_ring;

pub(crate) use byte_ring::{sample_bytes, ByteRing};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};

use crate::clock::NO_PTS;

/// Number of slots in the pipeline ring.
pub(crate) const SLOT_COUNT: usize = 8;

/// Byte capacity of each slot's ring: ~2s of 8-channel 16-bit audio.
pub(crate) const SLOT_BUFFER_SIZE: usize = 3 * 5 * 7 * 8 * 2 * 1000;

/// Playback format of one slot, as delivered to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotFormat {
    pub passthrough: bool,
    pub rate: u32,
    pub channels: u32,
}

/// One entry of the pipeline ring. Carries exactly one format and an
/// independent byte FIFO holding samples in hardware format.
pub(crate) struct Slot {
    /// Drain the device before playing this slot.
    flush: AtomicBool,
    /// Opaque pass-through: bytes go to the device verbatim, filters bypassed.
    passthrough: AtomicBool,
    /// Size of the first producer packet; informational.
    packet_size: AtomicUsize,
    in_rate: AtomicU32,
    in_channels: AtomicU32,
    hw_rate: AtomicU32,
    hw_channels: AtomicU32,
    /// Timestamp of the next sample to be written into the slot.
    pts: AtomicI64,
    pub(crate) buffer: ByteRing,
}

impl Slot {
    fn new() -> Self {
        Self {
            flush: AtomicBool::new(false),
            passthrough: AtomicBool::new(false),
            packet_size: AtomicUsize::new(0),
            in_rate: AtomicU32::new(0),
            in_channels: AtomicU32::new(0),
            hw_rate: AtomicU32::new(0),
            hw_channels: AtomicU32::new(0),
            pts: AtomicI64::new(NO_PTS),
            buffer: ByteRing::new(SLOT_BUFFER_SIZE),
        }
    }

    /// Reinitializes the slot header for a new format. Producer side,
    /// before publication. `flush` marks the slot as a flush request:
    /// the worker discards everything older, including device-side
    /// samples, as soon as it sees the marker. Plain format changes do
    /// not set it, so buffered audio drains before the switch.
    pub(crate) fn prepare(&self, format: SlotFormat, in_rate: u32, in_channels: u32, flush: bool) {
        self.flush.store(flush, Ordering::Relaxed);
        self.passthrough.store(format.passthrough, Ordering::Relaxed);
        self.packet_size.store(0, Ordering::Relaxed);
        self.in_rate.store(in_rate, Ordering::Relaxed);
        self.in_channels.store(in_channels, Ordering::Relaxed);
        self.hw_rate.store(format.rate, Ordering::Relaxed);
        self.hw_channels.store(format.channels, Ordering::Relaxed);
        self.pts.store(NO_PTS, Ordering::Relaxed);
        self.buffer.reset();
    }

    pub(crate) fn format(&self) -> SlotFormat {
        SlotFormat {
            passthrough: self.passthrough(),
            rate: self.hw_rate(),
            channels: self.hw_channels(),
        }
    }

    pub(crate) fn passthrough(&self) -> bool {
        self.passthrough.load(Ordering::Relaxed)
    }

    pub(crate) fn hw_rate(&self) -> u32 {
        self.hw_rate.load(Ordering::Relaxed)
    }

    pub(crate) fn hw_channels(&self) -> u32 {
        self.hw_channels.load(Ordering::Relaxed)
    }

    pub(crate) fn in_rate(&self) -> u32 {
        self.in_rate.load(Ordering::Relaxed)
    }

    pub(crate) fn in_channels(&self) -> u32 {
        self.in_channels.load(Ordering::Relaxed)
    }

    /// Marks the slot unplayable after a failed device setup; the worker
    /// loop stops on it and enqueued data is dropped.
    pub(crate) fn invalidate(&self) {
        self.hw_rate.store(0, Ordering::Relaxed);
        self.in_rate.store(0, Ordering::Relaxed);
    }

    pub(crate) fn pts(&self) -> i64 {
        self.pts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pts(&self, pts: i64) {
        self.pts.store(pts, Ordering::Relaxed);
    }

    #[allow(dead_code)] // observational, kept for diagnostics
    pub(crate) fn packet_size(&self) -> usize {
        self.packet_size.load(Ordering::Relaxed)
    }

    pub(crate) fn note_packet_size(&self, size: usize) {
        if self.packet_size.load(Ordering::Relaxed) == 0 {
            self.packet_size.store(size, Ordering::Relaxed);
            tracing::debug!(bytes = size, "a/v packet size");
        }
    }
}

/// The fixed ring of slots with its read/write indices and the atomic
/// `filled` publication counter.
pub(crate) struct SlotRing {
    slots: [Slot; SLOT_COUNT],
    /// Worker-owned slot index.
    read: AtomicUsize,
    /// Producer-owned slot index.
    write: AtomicUsize,
    /// Published slots between read and write, 0..=SLOT_COUNT.
    filled: AtomicUsize,
}

impl SlotRing {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::new()),
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            filled: AtomicUsize::new(0),
        }
    }

    pub(crate) fn filled(&self) -> usize {
        self.filled.load(Ordering::Acquire)
    }

    pub(crate) fn write_slot(&self) -> &Slot {
        &self.slots[self.write.load(Ordering::Relaxed) % SLOT_COUNT]
    }

    pub(crate) fn read_slot(&self) -> &Slot {
        &self.slots[self.read.load(Ordering::Relaxed) % SLOT_COUNT]
    }

    /// Producer side: rotates to the next slot and returns it for
    /// initialization. Callers must check [`filled`](Self::filled) against
    /// [`SLOT_COUNT`] first and call [`publish`](Self::publish) after.
    pub(crate) fn advance_write(&self) -> &Slot {
        let next = self.write.load(Ordering::Relaxed) + 1;
        self.write.store(next, Ordering::Relaxed);
        &self.slots[next % SLOT_COUNT]
    }

    /// Producer side: publishes the freshly initialized write slot to the
    /// worker. Release pairs with the worker's acquire of `filled`.
    pub(crate) fn publish(&self) {
        self.filled.fetch_add(1, Ordering::AcqRel);
    }

    /// Worker side: consumes the read slot and moves to the next
    /// published one.
    pub(crate) fn advance_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
        self.filled.fetch_sub(1, Ordering::AcqRel);
    }

    /// Worker side: scans the published range for flush markers. When any
    /// are present, consumes every slot up to and including the latest
    /// marked one (clearing all markers on the way) and returns `true`;
    /// the caller must then drain the device and re-setup.
    ///
    /// This is how producer-requested flushes are applied without racing
    /// the producer: markers are only ever set on unpublished slots.
    pub(crate) fn take_flush(&self) -> bool {
        let published = self.filled.load(Ordering::Acquire);
        let start = self.read.load(Ordering::Relaxed);
        let mut latest = 0;
        for step in 1..=published {
            let slot = &self.slots[(start + step) % SLOT_COUNT];
            if slot.flush.swap(false, Ordering::Relaxed) {
                latest = step;
            }
        }
        if latest == 0 {
            return false;
        }
        self.read.store(start + latest, Ordering::Relaxed);
        self.filled.fetch_sub(latest, Ordering::AcqRel);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(rate: u32, channels: u32) -> SlotFormat {
        SlotFormat {
            passthrough: false,
            rate,
            channels,
        }
    }

    fn add_slot(ring: &SlotRing, rate: u32, channels: u32, flush: bool) {
        let slot = ring.advance_write();
        slot.prepare(format(rate, channels), rate, channels, flush);
        ring.publish();
    }

    #[test]
    fn test_new_ring_is_empty() {
        let ring = SlotRing::new();
        assert_eq!(ring.filled(), 0);
        assert_eq!(ring.read_slot().hw_rate(), 0);
        assert_eq!(ring.read_slot().pts(), NO_PTS);
    }

    #[test]
    fn test_publish_and_consume() {
        let ring = SlotRing::new();
        add_slot(&ring, 48_000, 2, false);
        assert_eq!(ring.filled(), 1);

        // worker advances onto the new slot
        ring.advance_read();
        assert_eq!(ring.filled(), 0);
        assert_eq!(ring.read_slot().hw_rate(), 48_000);
        // quiescent: read and write alias
        assert!(std::ptr::eq(ring.read_slot(), ring.write_slot()));
    }

    #[test]
    fn test_prepare_resets_slot_state() {
        let ring = SlotRing::new();
        let slot = ring.write_slot();
        slot.buffer.write(&[1, 2, 3, 4]);
        slot.set_pts(1234);
        slot.note_packet_size(4);

        slot.prepare(format(44_100, 6), 44_100, 6, false);
        assert_eq!(slot.buffer.used(), 0);
        assert_eq!(slot.pts(), NO_PTS);
        assert_eq!(slot.packet_size(), 0);
        assert_eq!(slot.hw_channels(), 6);
    }

    #[test]
    fn test_packet_size_is_recorded_once() {
        let slot = Slot::new();
        slot.note_packet_size(4608);
        slot.note_packet_size(1536);
        assert_eq!(slot.packet_size(), 4608);
    }

    #[test]
    fn test_take_flush_jumps_to_latest_marker() {
        let ring = SlotRing::new();
        add_slot(&ring, 48_000, 2, true);
        add_slot(&ring, 48_000, 2, true);
        add_slot(&ring, 44_100, 6, true);
        assert_eq!(ring.filled(), 3);

        // all three carry markers; the scan consumes up to the last one
        assert!(ring.take_flush());
        assert_eq!(ring.filled(), 0);
        assert_eq!(ring.read_slot().hw_rate(), 44_100);
        assert!(!ring.take_flush());
    }

    #[test]
    fn test_take_flush_ignores_unpublished_slots() {
        let ring = SlotRing::new();
        assert!(!ring.take_flush());

        // a prepared but unpublished slot must not be consumed
        let slot = ring.advance_write();
        slot.prepare(format(48_000, 2), 48_000, 2, true);
        assert!(!ring.take_flush());
    }

    #[test]
    fn test_filled_bounds() {
        let ring = SlotRing::new();
        for _ in 0..SLOT_COUNT {
            add_slot(&ring, 48_000, 2, false);
        }
        assert_eq!(ring.filled(), SLOT_COUNT);
    }

    #[test]
    fn test_invalidate_marks_slot_unplayable() {
        let slot = Slot::new();
        slot.prepare(format(48_000, 2), 48_000, 2, false);
        slot.invalidate();
        assert_eq!(slot.hw_rate(), 0);
        assert_eq!(slot.in_rate(), 0);
    }
}
