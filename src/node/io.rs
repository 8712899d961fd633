//! Realtime half of a virtual source.

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::control::{IoChannel, IoEvent, IoRequest, IoSnapshot, Released};
use crate::endpoint::{
    AttachmentId, AttachmentState, EndpointFlags, EndpointState, MasterEndpoint, SourceOutput, SuspendCause,
};
use crate::error::{BlockSizeError, QueueError};
use crate::filter::{BlockProcessor, FilterKind, Passthrough};
use crate::mix::{mix, MixInput};
use crate::policy::{self, BlockSizes, LatencyRange};
use crate::queue::MemQueue;
use crate::sample::{ChannelVolumes, SampleSpec, Usec};
use crate::uplink::UplinkIo;

/// The public endpoint as seen from the io thread: where processed audio goes.
pub(super) struct PublicIo {
    pub(super) spec: SampleSpec,
    pub(super) output: Box<dyn SourceOutput>,
    pub(super) uplink: Option<UplinkIo>,
    unity: Vec<f32>,
    mix_buf: Vec<u8>,
}

impl PublicIo {
    pub(super) fn new(spec: SampleSpec, output: Box<dyn SourceOutput>, uplink: Option<UplinkIo>, max_block_bytes: usize) -> Self {
        Self {
            spec,
            output,
            unity: ChannelVolumes::norm(spec.channels as usize).values().to_vec(),
            mix_buf: if uplink.is_some() { vec![0; spec.block_bytes(max_block_bytes)] } else { Vec::new() },
            uplink,
        }
    }

    /// Hand `chunk` to the consumer, mixed with the uplink when it is playing.
    fn post(&mut self, chunk: &[u8]) {
        let Some(uplink) = self.uplink.as_mut().filter(|u| u.is_opened()) else {
            self.output.push(chunk);
            return;
        };

        // oversized chunks are mixed in pieces that fit the preallocated buffer
        for piece in chunk.chunks(self.mix_buf.len()) {
            let n = piece.len();

            // volumes were applied upstream of both streams
            let rendered = uplink.render(n);
            let streams = [MixInput::new(piece, &self.unity), MixInput::new(rendered, &self.unity)];
            mix(&streams, &self.spec, &mut self.mix_buf[..n]);

            self.output.push(&self.mix_buf[..n]);
        }
    }
}

/// Everything a virtual source does on the realtime thread.
///
/// Obtained from [`VirtualSource::activate`](super::VirtualSource::activate).
/// The thread driving the master calls [`SourceIo::push`] with every chunk it
/// captures; control requests are picked up at the start of each push, or
/// explicitly through [`SourceIo::process_messages`].
pub struct SourceIo<P: BlockProcessor = Passthrough> {
    pub(super) filter: FilterKind<P>,
    pub(super) queue: Option<MemQueue>,
    pub(super) public: PublicIo,
    pub(super) channel: IoChannel<P>,

    pub(super) master: Arc<dyn MasterEndpoint>,
    pub(super) attachment: AttachmentId,
    pub(super) attach_spec: SampleSpec,
    pub(super) flags: EndpointFlags,

    pub(super) state: EndpointState,
    pub(super) suspend_cause: SuspendCause,
    pub(super) attachment_state: AttachmentState,
    pub(super) attached: bool,

    pub(super) max_latency: Option<Usec>,
    pub(super) max_block_bytes: usize,
    pub(super) requested_latency: Option<Usec>,
    pub(super) latency_range: LatencyRange,
    pub(super) fixed_latency: Usec,
    pub(super) max_rewind: usize,

    pub(super) scratch_in: Vec<u8>,
    pub(super) scratch_out: Vec<u8>,
}

impl<P: BlockProcessor> SourceIo<P> {
    #[inline]
    fn in_fs(&self) -> usize {
        self.attach_spec.frame_size()
    }

    #[inline]
    fn out_fs(&self) -> usize {
        self.public.spec.frame_size()
    }

    pub fn max_block_frames(&self) -> usize {
        policy::max_block_frames(self.max_block_bytes, self.in_fs(), self.out_fs())
    }

    pub fn block_sizes(&self) -> BlockSizes {
        self.filter.block_sizes()
    }

    pub fn check_block_sizes(&self) -> Result<(), BlockSizeError> {
        self.block_sizes().validate(self.max_block_frames())
    }

    pub fn filter(&self) -> &FilterKind<P> {
        &self.filter
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn latency_range(&self) -> LatencyRange {
        self.latency_range
    }

    pub fn fixed_latency(&self) -> Usec {
        self.fixed_latency
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    pub fn queue(&self) -> Option<&MemQueue> {
        self.queue.as_ref()
    }

    /// Drain and apply all pending control requests.
    pub fn process_messages(&mut self) {
        while let Some(req) = self.channel.next_request() {
            self.handle(req);
        }
    }

    fn handle(&mut self, req: IoRequest<P>) {
        match req {
            IoRequest::UpdateParameters { params, reply } => self.update_parameters(params, reply),
            IoRequest::SetState { state, cause } => {
                let was_opened = self.state.is_opened();
                self.state = state;
                self.suspend_cause = cause;
                if state.is_opened() && !was_opened {
                    self.update_latency_range();
                }
            }
            IoRequest::SetAttachmentState(state) => self.attachment_state = state,
            IoRequest::SetRequestedLatency(latency) => {
                self.requested_latency = latency;
                self.update_requested_latency();
            }
            IoRequest::Rebind { master, attachment, flags } => {
                self.detach();
                self.master = master;
                self.attachment = attachment;
                self.flags = flags;
                self.attach();
            }
            IoRequest::UplinkState(state) => {
                if let Some(uplink) = self.public.uplink.as_mut() {
                    uplink.set_state(state);
                }
            }
            IoRequest::UplinkRequestedLatency(latency) => {
                if let Some(uplink) = self.public.uplink.as_mut() {
                    uplink.set_requested_latency(latency);
                }
            }
            IoRequest::UplinkRewind(nbytes) => {
                if let Some(uplink) = self.public.uplink.as_mut() {
                    uplink.request_rewind(nbytes);
                }
            }
            IoRequest::ConnectUplinkInput(producer) => {
                if let Some(uplink) = self.public.uplink.as_mut() {
                    uplink.connect(producer);
                }
            }
            IoRequest::Query { reply } => {
                let _ = reply.send(self.snapshot());
            }
            IoRequest::Unlink { reply } => {
                self.state = EndpointState::Unlinked;
                self.attachment_state = AttachmentState::Unlinked;
                self.attached = false;

                let released = Released { queue: self.queue.take(), uplink: self.public.uplink.take() };
                if reply.send(released).is_err() {
                    debug!("control side gone, releasing buffers on the io thread");
                }
            }
        }
    }

    /// Apply a parameter update. The control thread is parked on `reply`
    /// while this runs.
    fn update_parameters(&mut self, params: P::Params, reply: Sender<Result<BlockSizes, BlockSizeError>>) {
        let mut sizes = self.filter.block_sizes();

        let retired = match self.filter.processor_mut() {
            Some(processor) => processor.update_parameters(params, &mut sizes),
            None => Some(params),
        };
        if let Some(blob) = retired {
            self.channel.post(IoEvent::FreeParameters(blob));
        }

        // a failed check leaves the variant untouched
        let result = sizes
            .validate(self.max_block_frames())
            .and_then(|()| self.filter.apply_block_sizes(sizes));
        if let Err(e) = &result {
            warn!("Invalid new block sizes ({}), keeping old values", e);
        }

        self.set_queue_rewind();

        let current = self.filter.block_sizes();
        if let Some(processor) = self.filter.processor_mut() {
            processor.block_sizes_changed(&current);
        }

        self.update_latency_range();

        let _ = reply.send(result.map(|()| current));
    }

    fn set_queue_rewind(&mut self) {
        let rewind = self.filter.block_sizes().queue_max_rewind(self.in_fs());
        if let Some(queue) = self.queue.as_mut() {
            queue.set_max_rewind(rewind);
        }
    }

    /// Recompute the public latency range from the master's. Also applied to
    /// the uplink.
    pub fn update_latency_range(&mut self) {
        let range = policy::latency_range(
            self.master.latency_range(),
            self.flags.contains(EndpointFlags::DYNAMIC_LATENCY),
            self.max_latency,
            self.filter.block_sizes().fixed_output_frames,
            &self.public.spec,
        );
        self.latency_range = range;

        if let Some(uplink) = self.public.uplink.as_mut() {
            uplink.set_latency_range(range);
        }

        self.update_requested_latency();
    }

    pub fn update_fixed_latency(&mut self) {
        self.fixed_latency = policy::fixed_latency(
            self.master.fixed_latency(),
            self.filter.block_sizes().fixed_output_frames,
            self.flags.contains(EndpointFlags::DYNAMIC_LATENCY),
            &self.public.spec,
        );
    }

    /// Forward the consumers' requested latency to the master, minus what a
    /// fixed block buffers inside the node.
    pub fn update_requested_latency(&mut self) {
        if !self.state.is_linked() || !self.attachment_state.is_linked() {
            return;
        }

        let latency = policy::master_requested_latency(
            self.requested_latency,
            self.max_latency,
            self.filter.block_sizes().fixed_output_frames,
            &self.attach_spec,
            self.master.latency_range().min,
        );
        self.master.set_requested_latency(self.attachment, latency);
    }

    /// The master's rewind capability changed to `nbytes` attachment bytes.
    pub fn update_max_rewind(&mut self, nbytes: usize) {
        self.set_queue_rewind();
        if self.queue.is_none() {
            self.max_rewind = nbytes / self.in_fs() * self.out_fs();
        }
    }

    /// Wire the io side to the current master.
    pub fn attach(&mut self) {
        self.update_latency_range();
        self.update_fixed_latency();

        // with a queue, rewinds are served locally and the endpoint itself can't rewind
        self.max_rewind = if self.queue.is_some() {
            0
        } else {
            let master_fs = self.master.sample_spec().frame_size().max(1);
            self.master.max_rewind() / master_fs * self.out_fs()
        };
        self.set_queue_rewind();

        self.attached = true;
        self.channel.post(IoEvent::OutputAttached);
    }

    pub fn detach(&mut self) {
        self.attached = false;
    }

    /// Latency of the public endpoint: the master's own, plus everything
    /// queued between the master and the consumers.
    pub fn latency(&self) -> Usec {
        if !self.state.is_linked() || !self.attachment_state.is_linked() {
            return 0;
        }

        let master_spec = self.master.sample_spec();
        let mut latency = self.master.latency() + master_spec.bytes_to_usec(self.master.delay_bytes(self.attachment));

        if let Some(queue) = self.queue.as_ref() {
            latency += self.attach_spec.bytes_to_usec(queue.length());
        }

        latency + self.master.resampler_delay(self.attachment) + self.filter.extra_latency()
    }

    pub fn snapshot(&self) -> IoSnapshot {
        let latency = self.latency();
        let uplink = self.public.uplink.as_ref();

        IoSnapshot {
            latency,
            latency_range: self.latency_range,
            fixed_latency: self.fixed_latency,
            max_rewind: self.max_rewind,
            requested_latency: self.requested_latency,
            block_sizes: self.filter.block_sizes(),
            queue_length: self.queue.as_ref().map_or(0, |q| q.length()),
            queue_max_rewind: self.queue.as_ref().map_or(0, |q| q.max_rewind()),
            uplink_latency: uplink.map_or(0, |u| u.latency(latency)),
            uplink_queue_length: uplink.map_or(0, |u| u.queue_length()),
            uplink_max_rewind: uplink.map_or(0, |u| u.max_rewind()),
        }
    }

    /// Take a chunk captured by the master (attachment format) and run it
    /// through the filter.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), QueueError> {
        self.process_messages();

        if !self.state.is_linked() || !self.attachment_state.is_linked() || !self.attached {
            return Ok(());
        }

        let in_fs = self.in_fs();
        let max_block_frames = self.max_block_frames();
        let max_chunk_frames = self.public.spec.frame_align(self.max_block_bytes) / in_fs;
        let out_fs = self.out_fs();

        let Self { filter, queue, public, scratch_in, scratch_out, .. } = self;

        let Some(queue) = queue.as_mut() else {
            public.post(chunk);
            return Ok(());
        };

        queue.push_align(chunk)?;

        let sizes = filter.block_sizes();
        let mut length = queue.length();

        while policy::has_processable_unit(length, sizes.fixed_output_frames, in_fs) {
            let plan = policy::plan_block(
                length / in_fs,
                &sizes,
                max_chunk_frames,
                filter.current_overlap(),
                max_block_frames,
            );

            let in_count = plan.in_count();
            let in_bytes = in_count * in_fs;
            let out_bytes = plan.new_frames * out_fs;
            if plan.new_frames == 0 || in_bytes > scratch_in.len() || out_bytes > scratch_out.len() {
                warn!("Unprocessable block of {} + {} frames", plan.new_frames, plan.overlap_frames);
                break;
            }

            if plan.overlap_frames > 0 {
                queue.seek_relative(-((plan.overlap_frames * in_fs) as i64), true);
            }

            let input = &mut scratch_in[..in_bytes];
            queue.peek_fixed(input);
            queue.drop(in_bytes);

            let output = &mut scratch_out[..out_bytes];
            filter.process(input, output, in_count, plan.new_frames);

            public.post(output);

            length = queue.length();
        }

        Ok(())
    }

    /// A consumer wants the last `nbytes` (public bytes) delivered again.
    pub fn rewind(&mut self, nbytes: usize) {
        self.process_messages();

        if nbytes == 0 || !self.state.is_linked() || self.attachment_state == AttachmentState::Corked {
            return;
        }

        // only whole frames are rewound
        let frames = nbytes / self.out_fs();
        if frames == 0 {
            return;
        }

        let in_bytes = frames * self.in_fs();
        match self.queue.as_mut() {
            Some(queue) => queue.seek_relative(-(in_bytes as i64), true),
            None => {
                self.master.request_rewind(self.attachment, in_bytes);

                let out_bytes = frames * self.out_fs();
                if let Some(uplink) = self.public.uplink.as_mut() {
                    uplink.rewind_read(out_bytes);
                }
            }
        }
    }
}
