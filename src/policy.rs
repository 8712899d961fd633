//! Block-size and latency arithmetic.
//!
//! Everything in here is a pure function of the configured block sizes and
//! what the master device reports, so it can be checked in isolation from the
//! threads that use it.

use serde::Deserialize;

use crate::error::BlockSizeError;
use crate::sample::{SampleSpec, Usec, USEC_PER_MSEC};

/// Smallest nonzero fixed block a filter may ask for, in frames.
pub const MIN_BLOCK_FRAMES: usize = 16;

/// Lower bound added to the latency requested of the master when a fixed
/// block already buffers part of the total latency inside the node.
pub const LATENCY_MARGIN: Usec = 5 * USEC_PER_MSEC;

/// Largest single block the node hands around, in bytes.
pub const DEFAULT_MAX_BLOCK_BYTES: usize = 64 * 1024;

/// Block-size parameters of a filter. Zero means "not fixed".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BlockSizes {
    /// Output frames produced by every filter call
    pub fixed_output_frames: usize,
    /// Total input frames consumed by every filter call (new + history)
    pub fixed_input_frames: usize,
    /// History frames re-supplied in front of the new ones
    pub overlap_frames: usize,
}

impl BlockSizes {
    pub fn new(fixed_output_frames: usize, fixed_input_frames: usize, overlap_frames: usize) -> Self {
        Self { fixed_output_frames, fixed_input_frames, overlap_frames }
    }

    pub fn fixed_output(frames: usize) -> Self {
        Self { fixed_output_frames: frames, ..Self::default() }
    }

    pub fn with_overlap(mut self, frames: usize) -> Self {
        self.overlap_frames = frames;
        self
    }

    pub fn with_fixed_input(mut self, frames: usize) -> Self {
        self.fixed_input_frames = frames;
        self
    }

    pub fn validate(&self, max_block_frames: usize) -> Result<(), BlockSizeError> {
        validate(self.fixed_output_frames, self.fixed_input_frames, self.overlap_frames, max_block_frames)
    }

    /// History the accumulation queue has to retain, in input bytes.
    pub fn queue_max_rewind(&self, in_frame_size: usize) -> usize {
        self.fixed_input_frames.max(self.overlap_frames) * in_frame_size
    }
}

/// Check a block-size combination against the device block ceiling.
pub fn validate(
    fixed_output: usize,
    fixed_input: usize,
    overlap: usize,
    max_block_frames: usize,
) -> Result<(), BlockSizeError> {
    if let Some(frames) = [fixed_output, fixed_input].into_iter().find(|f| *f > max_block_frames) {
        return Err(BlockSizeError::ExceedsMaximum { frames, max: max_block_frames });
    }
    if overlap + MIN_BLOCK_FRAMES > max_block_frames {
        return Err(BlockSizeError::ExceedsMaximum { frames: overlap + MIN_BLOCK_FRAMES, max: max_block_frames });
    }

    if let Some(frames) = [fixed_output, fixed_input].into_iter().find(|f| *f > 0 && *f < MIN_BLOCK_FRAMES) {
        return Err(BlockSizeError::TooSmall { frames, min: MIN_BLOCK_FRAMES });
    }

    if fixed_output + overlap > max_block_frames {
        return Err(BlockSizeError::SumExceedsMaximum { output: fixed_output, overlap, max: max_block_frames });
    }

    if fixed_input != 0 && fixed_output > fixed_input {
        return Err(BlockSizeError::OutputExceedsInput { output: fixed_output, input: fixed_input });
    }

    Ok(())
}

/// Device block ceiling in frames, measured in the larger of the two frame sizes.
#[inline]
pub fn max_block_frames(max_block_bytes: usize, in_frame_size: usize, out_frame_size: usize) -> usize {
    max_block_bytes / in_frame_size.max(out_frame_size).max(1)
}

/// Whether a queue holding `queued_bytes` has at least one unit to process.
///
/// Without a fixed output block any nonzero amount counts; with one, a whole
/// block must be queued.
#[inline]
pub fn has_processable_unit(queued_bytes: usize, fixed_output_frames: usize, in_frame_size: usize) -> bool {
    let block = fixed_output_frames * in_frame_size;
    queued_bytes > block || (fixed_output_frames > 0 && queued_bytes == block)
}

/// Frame counts for one filter call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPlan {
    /// New frames consumed, and output frames produced
    pub new_frames: usize,
    /// History frames re-read in front of the new ones
    pub overlap_frames: usize,
}

impl BlockPlan {
    /// Total input frames handed to the filter.
    #[inline]
    pub fn in_count(&self) -> usize {
        self.new_frames + self.overlap_frames
    }
}

/// Work out how many frames the next filter call consumes.
///
/// `current_overlap` is the filter's per-call override; it can only lower the
/// configured overlap.
pub fn plan_block(
    available_frames: usize,
    sizes: &BlockSizes,
    max_chunk_frames: usize,
    current_overlap: Option<usize>,
    max_block_frames: usize,
) -> BlockPlan {
    let mut n = available_frames;
    if sizes.fixed_input_frames > 0 {
        n = n.min(sizes.fixed_input_frames);
    }
    if sizes.fixed_output_frames > 0 {
        n = n.min(sizes.fixed_output_frames);
    }
    n = n.min(max_chunk_frames);

    let mut overlap = sizes.overlap_frames;
    if let Some(current) = current_overlap {
        overlap = overlap.min(current);
    }

    // fixed input: whatever new data falls short of the block comes from history
    if sizes.fixed_input_frames > 0 {
        overlap = 0;
        if n > sizes.fixed_input_frames {
            n = sizes.fixed_input_frames;
        } else {
            overlap = sizes.fixed_input_frames - n;
        }
    }

    if n + overlap > max_block_frames {
        n = max_block_frames.saturating_sub(overlap);
    }

    BlockPlan { new_frames: n, overlap_frames: overlap }
}

/// Minimum and maximum latency an endpoint can be configured for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LatencyRange {
    pub min: Usec,
    pub max: Usec,
}

impl LatencyRange {
    pub fn new(min: Usec, max: Usec) -> Self {
        Self { min, max }
    }
}

/// Latency range of the public endpoint derived from the master's.
///
/// Only endpoints with dynamic latency are adjusted: the max is capped by the
/// configured maximum and the min raised to one fixed output block.
pub fn latency_range(
    master: LatencyRange,
    dynamic_latency: bool,
    max_latency: Option<Usec>,
    fixed_output_frames: usize,
    public_spec: &SampleSpec,
) -> LatencyRange {
    let LatencyRange { mut min, mut max } = master;

    if dynamic_latency {
        if let Some(cap) = max_latency {
            max = max.min(cap);
        }
        if fixed_output_frames > 0 {
            min = min.max(public_spec.bytes_to_usec(fixed_output_frames * public_spec.frame_size()));
        }
        max = max.max(min);
    }

    LatencyRange { min, max }
}

/// Fixed latency of the public endpoint: a fixed block holds back up to one
/// block minus a frame on endpoints that cannot adjust their latency.
pub fn fixed_latency(
    master_fixed: Usec,
    fixed_output_frames: usize,
    dynamic_latency: bool,
    public_spec: &SampleSpec,
) -> Usec {
    if fixed_output_frames > 0 && !dynamic_latency {
        master_fixed + public_spec.bytes_to_usec((fixed_output_frames - 1) * public_spec.frame_size())
    } else {
        master_fixed
    }
}

/// Latency to request from the master for a consumer-requested `latency`.
///
/// `None` means no consumer has asked for anything. Part of the latency of a
/// fixed-block filter lives inside the node, so that much is subtracted,
/// without going below the master's minimum (plus margin when that minimum is
/// tiny).
pub fn master_requested_latency(
    requested: Option<Usec>,
    max_latency: Option<Usec>,
    fixed_output_frames: usize,
    attach_spec: &SampleSpec,
    master_min_latency: Usec,
) -> Option<Usec> {
    let mut latency = match (requested, max_latency) {
        (Some(l), Some(cap)) => l.min(cap),
        (Some(l), None) => l,
        (None, Some(cap)) => cap,
        (None, None) => return None,
    };

    if fixed_output_frames > 0 {
        let block_latency = attach_spec.bytes_to_usec(fixed_output_frames * attach_spec.frame_size());
        let mut min = master_min_latency;
        if min < LATENCY_MARGIN {
            min += LATENCY_MARGIN;
        }

        latency = if latency < block_latency + min { min } else { latency - block_latency };
    }

    Some(latency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleFormat;

    const MAX: usize = 1024;

    #[test]
    fn test_validate_accepts_valid_combinations() {
        assert_eq!(validate(0, 0, 0, MAX), Ok(()));
        assert_eq!(validate(256, 0, 64, MAX), Ok(()));
        assert_eq!(validate(256, 512, 0, MAX), Ok(()));
        assert_eq!(validate(MIN_BLOCK_FRAMES, MIN_BLOCK_FRAMES, 0, MAX), Ok(()));
        assert_eq!(validate(MAX - 16, 0, 16, MAX), Ok(()));
    }

    #[test]
    fn test_validate_exceeds_maximum() {
        assert!(matches!(validate(MAX + 1, 0, 0, MAX), Err(BlockSizeError::ExceedsMaximum { .. })));
        assert!(matches!(validate(0, MAX + 1, 0, MAX), Err(BlockSizeError::ExceedsMaximum { .. })));
        assert!(matches!(validate(0, 0, MAX - 8, MAX), Err(BlockSizeError::ExceedsMaximum { .. })));
    }

    #[test]
    fn test_validate_too_small() {
        // output 8 frames with a floor of 16
        assert_eq!(validate(8, 0, 0, MAX), Err(BlockSizeError::TooSmall { frames: 8, min: MIN_BLOCK_FRAMES }));
        assert_eq!(validate(0, 4, 0, MAX), Err(BlockSizeError::TooSmall { frames: 4, min: MIN_BLOCK_FRAMES }));
    }

    #[test]
    fn test_validate_sum_exceeds_maximum() {
        assert_eq!(
            validate(1000, 0, 100, MAX),
            Err(BlockSizeError::SumExceedsMaximum { output: 1000, overlap: 100, max: MAX })
        );
    }

    #[test]
    fn test_validate_output_exceeds_input() {
        assert_eq!(
            validate(512, 256, 0, MAX),
            Err(BlockSizeError::OutputExceedsInput { output: 512, input: 256 })
        );
    }

    #[test]
    fn test_processable_unit() {
        // variable block size: anything counts
        assert!(!has_processable_unit(0, 0, 4));
        assert!(has_processable_unit(4, 0, 4));

        // fixed block: a full block is needed
        assert!(!has_processable_unit(255 * 4, 256, 4));
        assert!(has_processable_unit(256 * 4, 256, 4));
        assert!(has_processable_unit(257 * 4, 256, 4));
    }

    #[test]
    fn test_plan_fixed_output_with_overlap() {
        let sizes = BlockSizes::fixed_output(256).with_overlap(64);
        let plan = plan_block(600, &sizes, 4096, None, MAX);
        assert_eq!(plan, BlockPlan { new_frames: 256, overlap_frames: 64 });
        assert_eq!(plan.in_count(), 320);

        // the filter may lower the overlap for a single call
        let plan = plan_block(600, &sizes, 4096, Some(10), MAX);
        assert_eq!(plan.overlap_frames, 10);
        let plan = plan_block(600, &sizes, 4096, Some(100), MAX);
        assert_eq!(plan.overlap_frames, 64);
    }

    #[test]
    fn test_plan_fixed_input_pads_from_history() {
        let sizes = BlockSizes::new(128, 512, 32);
        let plan = plan_block(300, &sizes, 4096, None, MAX);
        assert_eq!(plan, BlockPlan { new_frames: 128, overlap_frames: 384 });
        assert_eq!(plan.in_count(), 512);
    }

    #[test]
    fn test_plan_respects_block_ceiling() {
        let sizes = BlockSizes::default().with_overlap(100);
        let plan = plan_block(5000, &sizes, 4096, None, MAX);
        assert_eq!(plan.new_frames + plan.overlap_frames, MAX);
        assert_eq!(plan.overlap_frames, 100);
    }

    #[test]
    fn test_latency_range_dynamic() {
        let spec = SampleSpec::new(SampleFormat::F32Le, 48_000, 2);
        let master = LatencyRange::new(1_000, 2_000_000);

        // 480 frames = 10ms
        let range = latency_range(master, true, Some(500_000), 480, &spec);
        assert_eq!(range, LatencyRange::new(10_000, 500_000));

        // max never ends up below min
        let range = latency_range(master, true, Some(5_000), 480, &spec);
        assert_eq!(range, LatencyRange::new(10_000, 10_000));

        // fixed latency endpoints take the master range as is
        assert_eq!(latency_range(master, false, Some(5_000), 480, &spec), master);
    }

    #[test]
    fn test_fixed_latency() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 1_000, 1);
        assert_eq!(fixed_latency(5_000, 11, false, &spec), 15_000);
        assert_eq!(fixed_latency(5_000, 11, true, &spec), 5_000);
        assert_eq!(fixed_latency(5_000, 0, false, &spec), 5_000);
    }

    #[test]
    fn test_master_requested_latency() {
        let spec = SampleSpec::new(SampleFormat::F32Le, 48_000, 2);

        assert_eq!(master_requested_latency(None, None, 480, &spec, 0), None);
        assert_eq!(master_requested_latency(Some(40_000), None, 0, &spec, 0), Some(40_000));
        assert_eq!(master_requested_latency(Some(40_000), Some(20_000), 0, &spec, 0), Some(20_000));

        // 10ms block is buffered internally
        assert_eq!(master_requested_latency(Some(40_000), None, 480, &spec, 1_000), Some(30_000));

        // too small: fall back to the master minimum plus margin
        assert_eq!(
            master_requested_latency(Some(12_000), None, 480, &spec, 1_000),
            Some(1_000 + LATENCY_MARGIN)
        );
        assert_eq!(master_requested_latency(Some(12_000), None, 480, &spec, 8_000), Some(8_000));
    }

    #[test]
    fn test_queue_max_rewind() {
        assert_eq!(BlockSizes::fixed_output(256).with_overlap(64).queue_max_rewind(8), 512);
        assert_eq!(BlockSizes::new(128, 512, 32).queue_max_rewind(4), 2048);
    }
}
