//! Filter variants and the plugin-side processing trait.

use crate::error::BlockSizeError;
use crate::policy::BlockSizes;
use crate::sample::Usec;

/// The realtime part of a filter plugin.
///
/// Everything here runs on the io thread while audio is flowing, apart from
/// [`BlockProcessor::release_parameters`], which runs on the control thread.
/// None of the `&mut self` methods may allocate or block.
pub trait BlockProcessor: Send + 'static {
    /// Payload of a runtime parameter update.
    type Params: Send + 'static;

    /// Turn `in_frames` input frames into `out_frames` output frames.
    ///
    /// The first `in_frames - out_frames` input frames are history (overlap)
    /// the filter has seen before; the rest are new.
    fn process(&mut self, input: &[u8], output: &mut [u8], in_frames: usize, out_frames: usize);

    /// Latency the filter adds on top of the buffering done by the node.
    fn extra_latency(&self) -> Usec {
        0
    }

    /// Overlap to use for the next call, if the filter wants less than configured.
    fn current_overlap(&self) -> Option<usize> {
        None
    }

    /// Apply `params`. May change `sizes`; the change is validated afterwards
    /// and rolled back if invalid.
    ///
    /// Returns whatever should be released on the control thread.
    fn update_parameters(&mut self, params: Self::Params, sizes: &mut BlockSizes) -> Option<Self::Params> {
        let _ = sizes;
        Some(params)
    }

    /// The block sizes in effect after a parameter update.
    fn block_sizes_changed(&mut self, _sizes: &BlockSizes) {}

    /// Dispose of a parameter blob handed back by `update_parameters`.
    fn release_parameters(params: Self::Params) {
        drop(params);
    }
}

/// Copies the new (non-history) part of the input to the output.
///
/// Input and output must share a frame size.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl BlockProcessor for Passthrough {
    /// New block sizes to switch to.
    type Params = BlockSizes;

    fn process(&mut self, input: &[u8], output: &mut [u8], in_frames: usize, out_frames: usize) {
        copy_tail(input, output, in_frames, out_frames);
    }

    fn update_parameters(&mut self, params: BlockSizes, sizes: &mut BlockSizes) -> Option<BlockSizes> {
        *sizes = params;
        None
    }
}

#[inline]
fn copy_tail(input: &[u8], output: &mut [u8], in_frames: usize, out_frames: usize) {
    if in_frames == 0 {
        return;
    }
    let fs = input.len() / in_frames;
    let start = in_frames.saturating_sub(out_frames) * fs;
    let n = output.len().min(input.len() - start);
    output[..n].copy_from_slice(&input[start..start + n]);
}

/// How a node transforms audio between its attachment and its public endpoint.
pub enum FilterKind<P: BlockProcessor = Passthrough> {
    /// Chunks go straight through. No accumulation queue, rewinds are
    /// forwarded upstream.
    None,

    /// Chunks go through the accumulation queue and are copied out in
    /// whatever sizes are available.
    Copy,

    /// The processor is called with blocks of `block_frames` output frames.
    /// With a nonzero `input_block_frames` every call receives exactly that
    /// many input frames, the shortfall coming from history.
    FixedBlock {
        processor: P,
        block_frames: usize,
        input_block_frames: usize,
    },

    /// The processor is called with `block_frames` new frames preceded by
    /// `overlap_frames` of history.
    FixedBlockOverlap {
        processor: P,
        block_frames: usize,
        overlap_frames: usize,
    },
}

impl<P: BlockProcessor> FilterKind<P> {
    pub fn fixed_block(processor: P, block_frames: usize) -> Self {
        FilterKind::FixedBlock { processor, block_frames, input_block_frames: 0 }
    }

    pub fn fixed_block_overlap(processor: P, block_frames: usize, overlap_frames: usize) -> Self {
        FilterKind::FixedBlockOverlap { processor, block_frames, overlap_frames }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::None => "none",
            FilterKind::Copy => "copy",
            FilterKind::FixedBlock { .. } => "fixed-block",
            FilterKind::FixedBlockOverlap { .. } => "fixed-block-overlap",
        }
    }

    /// Whether audio is buffered in an accumulation queue.
    #[inline]
    pub fn uses_queue(&self) -> bool {
        !matches!(self, FilterKind::None)
    }

    pub fn block_sizes(&self) -> BlockSizes {
        match self {
            FilterKind::None | FilterKind::Copy => BlockSizes::default(),
            FilterKind::FixedBlock { block_frames, input_block_frames, .. } => {
                BlockSizes::new(*block_frames, *input_block_frames, 0)
            }
            FilterKind::FixedBlockOverlap { block_frames, overlap_frames, .. } => {
                BlockSizes::new(*block_frames, 0, *overlap_frames)
            }
        }
    }

    /// Check that `sizes` can be expressed by this variant.
    pub fn check_shape(&self, sizes: &BlockSizes) -> Result<(), BlockSizeError> {
        let ok = match self {
            FilterKind::None | FilterKind::Copy => *sizes == BlockSizes::default(),
            FilterKind::FixedBlock { .. } => sizes.overlap_frames == 0,
            FilterKind::FixedBlockOverlap { .. } => sizes.fixed_input_frames == 0,
        };

        if ok {
            Ok(())
        } else {
            Err(BlockSizeError::UnsupportedByFilter { filter: self.name() })
        }
    }

    /// Store `sizes` in the variant after a shape check.
    pub fn apply_block_sizes(&mut self, sizes: BlockSizes) -> Result<(), BlockSizeError> {
        self.check_shape(&sizes)?;

        match self {
            FilterKind::None | FilterKind::Copy => {}
            FilterKind::FixedBlock { block_frames, input_block_frames, .. } => {
                *block_frames = sizes.fixed_output_frames;
                *input_block_frames = sizes.fixed_input_frames;
            }
            FilterKind::FixedBlockOverlap { block_frames, overlap_frames, .. } => {
                *block_frames = sizes.fixed_output_frames;
                *overlap_frames = sizes.overlap_frames;
            }
        }
        Ok(())
    }

    pub fn processor(&self) -> Option<&P> {
        match self {
            FilterKind::FixedBlock { processor, .. } | FilterKind::FixedBlockOverlap { processor, .. } => {
                Some(processor)
            }
            FilterKind::None | FilterKind::Copy => None,
        }
    }

    pub fn processor_mut(&mut self) -> Option<&mut P> {
        match self {
            FilterKind::FixedBlock { processor, .. } | FilterKind::FixedBlockOverlap { processor, .. } => {
                Some(processor)
            }
            FilterKind::None | FilterKind::Copy => None,
        }
    }

    /// Run one filter call.
    #[inline]
    pub fn process(&mut self, input: &[u8], output: &mut [u8], in_frames: usize, out_frames: usize) {
        match self {
            FilterKind::None | FilterKind::Copy => copy_tail(input, output, in_frames, out_frames),
            FilterKind::FixedBlock { processor, .. } | FilterKind::FixedBlockOverlap { processor, .. } => {
                processor.process(input, output, in_frames, out_frames)
            }
        }
    }

    pub fn extra_latency(&self) -> Usec {
        self.processor().map_or(0, |p| p.extra_latency())
    }

    pub fn current_overlap(&self) -> Option<usize> {
        self.processor().and_then(|p| p.current_overlap())
    }
}
