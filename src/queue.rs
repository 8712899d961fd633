//! Rewindable byte queue used for filter accumulation and uplink buffering.
//!
//! `MemQueue` keeps two cursors over an unbounded byte timeline: data is
//! written at the write index and read at the read index. Bytes behind the
//! read index are kept as history (up to `max_rewind`) so the read cursor can
//! be moved back and data replayed. Any position that holds no data reads as
//! the silence pattern, which is how overlap at stream start gets padded.

use std::collections::VecDeque;

use crate::error::QueueError;
use crate::sample::SampleSpec;

/// Maximum number of queued (written, unread) bytes.
pub const QUEUE_MAX_LENGTH: usize = 16 * 1024 * 1024;

pub struct MemQueue {
    data: VecDeque<u8>,
    /// Absolute index of `data[0]`
    base: i64,
    read: i64,
    write: i64,

    max_length: usize,
    max_rewind: usize,

    /// One frame of silence, repeated for every position that holds no data
    silence: Vec<u8>,
    /// Incomplete trailing frame held back by `push_align`
    partial: Vec<u8>,
}

impl MemQueue {
    /// Create a queue for frames of `silence.len()` bytes.
    ///
    /// `silence` is the fill pattern for underruns and for reads before the
    /// start of the stream.
    pub fn new(max_length: usize, silence: Vec<u8>) -> Self {
        let frame_size = silence.len().max(1);
        Self {
            data: VecDeque::new(),
            base: 0,
            read: 0,
            write: 0,
            max_length,
            max_rewind: 0,
            silence: if silence.is_empty() { vec![0] } else { silence },
            partial: Vec::with_capacity(frame_size),
        }
    }

    /// A queue whose silence pattern and frame size follow `spec`.
    pub fn for_spec(spec: &SampleSpec, max_length: usize) -> Self {
        Self::new(max_length, vec![spec.format.silence_byte(); spec.frame_size()])
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.silence.len()
    }

    pub fn silence_frame(&self) -> &[u8] {
        &self.silence
    }

    /// Number of written bytes not yet read.
    #[inline]
    pub fn length(&self) -> usize {
        (self.write - self.read).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    pub fn read_index(&self) -> i64 {
        self.read
    }

    pub fn write_index(&self) -> i64 {
        self.write
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    /// How much history behind the read cursor is retained.
    pub fn set_max_rewind(&mut self, nbytes: usize) {
        self.max_rewind = nbytes;
        self.trim();
    }

    /// Write `chunk` at the write index.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), QueueError> {
        let queued = self.length();
        if queued + chunk.len() > self.max_length {
            return Err(QueueError::Overflow { queued, pushed: chunk.len(), max: self.max_length });
        }

        let mut src = chunk;
        let mut pos = self.write;
        self.write += chunk.len() as i64;

        if pos < self.base {
            let skip = ((self.base - pos) as usize).min(src.len());
            src = &src[skip..];
            pos += skip as i64;
        }

        let end = self.end();
        if pos > end {
            let fs = self.silence.len() as i64;
            for p in end..pos {
                self.data.push_back(self.silence[p.rem_euclid(fs) as usize]);
            }
        }

        // overwrite whatever was already stored past the write index
        let start = (pos - self.base) as usize;
        let overlap = self.data.len().saturating_sub(start).min(src.len());
        self.copy_in(start, &src[..overlap]);
        self.data.extend(&src[overlap..]);

        self.trim();
        Ok(())
    }

    /// Push whole frames, holding back any trailing partial frame until the
    /// next call completes it.
    pub fn push_align(&mut self, chunk: &[u8]) -> Result<(), QueueError> {
        let fs = self.frame_size();
        let mut rest = chunk;

        if !self.partial.is_empty() {
            let take = (fs - self.partial.len()).min(rest.len());
            self.partial.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.partial.len() < fs {
                return Ok(());
            }

            let frame = std::mem::take(&mut self.partial);
            let res = self.push(&frame);
            self.partial = frame;
            self.partial.clear();
            res?;
        }

        let whole = rest.len() - rest.len() % fs;
        self.push(&rest[..whole])?;
        self.partial.extend_from_slice(&rest[whole..]);
        Ok(())
    }

    /// Copy `out.len()` bytes starting at the read index into `out` without
    /// consuming them. Positions without data read as silence.
    pub fn peek_fixed(&self, out: &mut [u8]) {
        let fs = self.silence.len() as i64;
        let start = self.read;
        let stop = start + out.len() as i64;

        let lo = start.max(self.base);
        let hi = stop.min(self.end());

        for p in start..lo.min(stop) {
            out[(p - start) as usize] = self.silence[p.rem_euclid(fs) as usize];
        }

        if lo < hi {
            let from = (lo - self.base) as usize;
            self.copy_out(from, &mut out[(lo - start) as usize..(hi - start) as usize]);
        }

        for p in hi.max(start)..stop {
            out[(p - start) as usize] = self.silence[p.rem_euclid(fs) as usize];
        }
    }

    /// Advance the read index by `nbytes`.
    pub fn drop(&mut self, nbytes: usize) {
        self.read += nbytes as i64;
        self.trim();
    }

    /// Move the read cursor. Negative offsets re-expose history.
    ///
    /// Without `allow_grow` the cursor stops at the oldest retained byte; with
    /// it, the cursor may move past it and those positions read as silence.
    pub fn seek_relative(&mut self, offset: i64, allow_grow: bool) {
        let mut target = self.read + offset;
        if offset < 0 && !allow_grow {
            target = target.max(self.base.min(self.read));
        }
        self.read = target;
        self.trim();
    }

    /// Move the write cursor back by up to `nbytes`, discarding the most
    /// recently written unread data. Returns how much was discarded.
    pub fn retract(&mut self, nbytes: usize) -> usize {
        let n = nbytes.min(self.length());
        self.write -= n as i64;
        self.truncate_at(self.write);
        n
    }

    /// Discard all unread data. History behind the read index is kept only
    /// when `keep_history` is set.
    pub fn flush_write(&mut self, keep_history: bool) {
        self.write = self.read;
        self.partial.clear();
        if keep_history {
            self.truncate_at(self.read);
        } else {
            self.data.clear();
            self.base = self.read;
        }
    }

    /// Copy stored bytes starting at offset `from` into `dst`.
    fn copy_out(&self, from: usize, dst: &mut [u8]) {
        let (a, b) = self.data.as_slices();
        let n = dst.len();
        if from < a.len() {
            let head = (a.len() - from).min(n);
            dst[..head].copy_from_slice(&a[from..from + head]);
            dst[head..].copy_from_slice(&b[..n - head]);
        } else {
            let off = from - a.len();
            dst.copy_from_slice(&b[off..off + n]);
        }
    }

    /// Overwrite stored bytes starting at offset `from` with `src`.
    fn copy_in(&mut self, from: usize, src: &[u8]) {
        let (a, b) = self.data.as_mut_slices();
        let n = src.len();
        if from < a.len() {
            let head = (a.len() - from).min(n);
            a[from..from + head].copy_from_slice(&src[..head]);
            b[..n - head].copy_from_slice(&src[head..]);
        } else {
            let off = from - a.len();
            b[off..off + n].copy_from_slice(src);
        }
    }

    #[inline]
    fn end(&self) -> i64 {
        self.base + self.data.len() as i64
    }

    fn truncate_at(&mut self, pos: i64) {
        if pos < self.end() {
            let keep = (pos - self.base).max(0) as usize;
            self.data.truncate(keep);
        }
    }

    /// Forget history older than `max_rewind` behind the read index.
    fn trim(&mut self) {
        let keep_from = self.read - self.max_rewind as i64;
        let cut = keep_from - self.base;
        if cut > 0 {
            let n = (cut as usize).min(self.data.len());
            self.data.drain(..n);
            self.base += n as i64;
        }
        if self.data.is_empty() {
            self.base = self.write;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> MemQueue {
        MemQueue::new(1024, vec![0xAA, 0xBB])
    }

    fn peek(q: &MemQueue, n: usize) -> Vec<u8> {
        let mut out = vec![0; n];
        q.peek_fixed(&mut out);
        out
    }

    #[test]
    fn push_peek_drop() {
        let mut q = queue();
        q.push(&[1, 2, 3, 4]).unwrap();
        assert_eq!(q.length(), 4);
        assert_eq!(peek(&q, 4), vec![1, 2, 3, 4]);

        q.drop(2);
        assert_eq!(q.length(), 2);
        assert_eq!(peek(&q, 2), vec![3, 4]);
    }

    #[test]
    fn reads_past_data_are_silence() {
        let mut q = queue();
        q.push(&[1, 2]).unwrap();
        assert_eq!(peek(&q, 6), vec![1, 2, 0xAA, 0xBB, 0xAA, 0xBB]);
    }

    #[test]
    fn rewind_before_stream_start_reads_silence() {
        let mut q = queue();
        q.set_max_rewind(4);
        q.push(&[1, 2, 3, 4]).unwrap();
        q.seek_relative(-4, true);
        assert_eq!(q.length(), 8);
        assert_eq!(peek(&q, 8), vec![0xAA, 0xBB, 0xAA, 0xBB, 1, 2, 3, 4]);
    }

    #[test]
    fn history_is_bounded_by_max_rewind() {
        let mut q = queue();
        q.set_max_rewind(2);
        q.push(&[1, 2, 3, 4, 5, 6]).unwrap();
        q.drop(6);

        // only the last two bytes survive as history
        q.seek_relative(-6, false);
        assert_eq!(q.read_index(), 4);
        assert_eq!(peek(&q, 2), vec![5, 6]);
    }

    #[test]
    fn seek_zero_is_a_no_op() {
        let mut q = queue();
        q.push(&[1, 2, 3, 4]).unwrap();
        q.drop(2);
        let before = q.read_index();
        q.seek_relative(0, true);
        assert_eq!(q.read_index(), before);
        assert_eq!(peek(&q, 2), vec![3, 4]);
    }

    #[test]
    fn reads_follow_the_ring_across_wraps() {
        let mut q = MemQueue::new(1024, vec![0]);
        q.set_max_rewind(3);

        let mut all = Vec::new();
        for round in 0..50u8 {
            let chunk: Vec<u8> = (0..7).map(|i| round.wrapping_mul(7).wrapping_add(i)).collect();
            q.push(&chunk).unwrap();
            all.extend_from_slice(&chunk);

            let read = q.read_index() as usize;
            assert_eq!(peek(&q, q.length()), all[read..]);
            q.drop(5);
        }

        q.seek_relative(-3, false);
        let read = q.read_index() as usize;
        assert_eq!(peek(&q, q.length()), all[read..]);
    }

    #[test]
    fn push_align_holds_partial_frames() {
        let mut q = queue();
        q.push_align(&[1, 2, 3]).unwrap();
        assert_eq!(q.length(), 2);
        q.push_align(&[4]).unwrap();
        assert_eq!(q.length(), 4);
        assert_eq!(peek(&q, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn retract_discards_newest_unread() {
        let mut q = queue();
        q.push(&[1, 2, 3, 4]).unwrap();
        assert_eq!(q.retract(10), 4);
        assert_eq!(q.length(), 0);
        q.push(&[9, 9]).unwrap();
        assert_eq!(peek(&q, 2), vec![9, 9]);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut q = MemQueue::new(4, vec![0]);
        q.push(&[1, 2, 3]).unwrap();
        let err = q.push(&[4, 5]).unwrap_err();
        assert_eq!(err, QueueError::Overflow { queued: 3, pushed: 2, max: 4 });
        assert_eq!(q.length(), 3);
    }

    #[test]
    fn flush_write_drops_unread() {
        let mut q = queue();
        q.set_max_rewind(4);
        q.push(&[1, 2, 3, 4]).unwrap();
        q.drop(2);
        q.flush_write(true);
        assert_eq!(q.length(), 0);
        q.seek_relative(-2, false);
        assert_eq!(peek(&q, 2), vec![1, 2]);
    }
}
