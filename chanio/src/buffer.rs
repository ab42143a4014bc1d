//! Channel buffers and the per-channel recycling policy.
//!
//! A [`ChannelBuffer`] is one node of a channel's input or output queue:
//! owned storage with an append cursor, a remove cursor, and reserved
//! padding at both ends. The front padding is load bearing: when a
//! multi-byte character is split across two buffers, the undecoded tail is
//! copied in front of the next buffer's data so the decoder sees it
//! contiguously, without a separate allocation.

use crate::channel::ChannelCore;

/// Reserved bytes at each end of a buffer's storage.
pub(crate) const BUFFER_PADDING: usize = 16;

/// Capacity used when no explicit `-buffersize` was configured.
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Smallest accepted `-buffersize`.
pub(crate) const MIN_BUFFER_SIZE: usize = 1;

/// Largest accepted `-buffersize`.
pub(crate) const MAX_BUFFER_SIZE: usize = 1 << 20;

/// One queue node of buffered channel data.
pub(crate) struct ChannelBuffer {
    /// Offset of the next byte to hand out.
    removed: usize,
    /// Offset one past the last byte filled in.
    added: usize,
    storage: Box<[u8]>,
}

impl ChannelBuffer {
    /// Allocates a buffer able to hold `capacity` bytes plus padding,
    /// cursors reset to the front padding offset.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        ChannelBuffer {
            removed: BUFFER_PADDING,
            added: BUFFER_PADDING,
            storage: vec![0u8; capacity + 2 * BUFFER_PADDING].into_boxed_slice(),
        }
    }

    /// Nominal capacity, excluding padding.
    pub(crate) fn capacity(&self) -> usize {
        self.storage.len() - 2 * BUFFER_PADDING
    }

    /// Number of unconsumed bytes.
    pub(crate) fn len(&self) -> usize {
        self.added - self.removed
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.added == self.removed
    }

    /// Free space left for appending, excluding the back padding.
    pub(crate) fn space(&self) -> usize {
        self.storage.len() - BUFFER_PADDING - self.added
    }

    /// The unconsumed bytes.
    pub(crate) fn readable(&self) -> &[u8] {
        &self.storage[self.removed..self.added]
    }

    /// The writable region after the append cursor.
    pub(crate) fn writable_slice(&mut self) -> &mut [u8] {
        let end = self.storage.len() - BUFFER_PADDING;
        &mut self.storage[self.added..end]
    }

    /// Marks `n` appended bytes as filled in.
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.space());
        self.added += n;
    }

    /// Marks `n` bytes as consumed.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.removed += n;
    }

    /// Restores the remove cursor to an earlier offset, un-consuming bytes.
    pub(crate) fn set_removed(&mut self, offset: usize) {
        debug_assert!(offset <= self.added);
        self.removed = offset;
    }

    /// Current remove-cursor offset, for later restoration.
    pub(crate) fn removed_offset(&self) -> usize {
        self.removed
    }

    /// Copies `bytes` immediately in front of the unconsumed data, using
    /// the front padding. The caller guarantees the padding is large
    /// enough; this only ever carries a partial character or a partial
    /// line terminator.
    pub(crate) fn prepend(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.removed,
            "prepend of {} bytes exceeds front padding",
            bytes.len()
        );
        self.removed -= bytes.len();
        self.storage[self.removed..self.removed + bytes.len()].copy_from_slice(bytes);
    }

    /// Resets both cursors, discarding contents.
    pub(crate) fn reset(&mut self) {
        self.removed = BUFFER_PADDING;
        self.added = BUFFER_PADDING;
    }
}

/// Returns a buffer to the channel or frees it.
///
/// With `force_discard` the buffer is always dropped. Otherwise at most a
/// small bounded number of buffers is retained per channel: one spare input
/// buffer, one current output buffer, or the head of a now-empty input
/// queue. Anything beyond that is freed. Buffers whose capacity no longer
/// matches the configured size are never retained.
pub(crate) fn recycle_buffer(core: &mut ChannelCore, mut buf: ChannelBuffer, force_discard: bool) {
    if !force_discard && buf.capacity() == core.buffer_size {
        if core.flags.readable && core.spare_in.is_none() {
            buf.reset();
            core.spare_in = Some(buf);
            return;
        }
        if core.flags.writable && core.cur_out.is_none() {
            buf.reset();
            core.cur_out = Some(buf);
            return;
        }
        if core.flags.readable && core.in_queue.is_empty() {
            buf.reset();
            core.in_queue.push_back(buf);
            return;
        }
    }
    drop(buf);
}
