//! In-memory stand-ins for the outside world: a master endpoint, a consumer
//! and uplink producers.
//!
//! Used to drive nodes without an audio server, in tests, benchmarks and
//! offline rendering.

use std::sync::Arc;

use dasp_sample::Sample;
use hashbrown::HashMap;
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::warn;

use crate::endpoint::{
    AttachRequest, AttachmentId, EndpointFlags, EndpointId, EndpointState, MasterEndpoint, SourceOutput, SuspendCause,
};
use crate::error::VsourceError;
use crate::policy::LatencyRange;
use crate::registry::{EndpointKind, EndpointLookup};
use crate::sample::{ChannelMap, ChannelVolumes, SampleFormat, SampleSpec, Usec};
use crate::uplink::UplinkProducer;

/// Something a node asked of a [`SimMaster`].
#[derive(Clone, Debug, PartialEq)]
pub enum SimCall {
    Attach(AttachmentId),
    Detach(AttachmentId),
    Cork(AttachmentId, bool),
    RequestRewind(AttachmentId, usize),
    SetRequestedLatency(AttachmentId, Option<Usec>),
    SetVolume(AttachmentId, ChannelVolumes),
    SetMute(AttachmentId, bool),
}

/// An attachment as seen by a [`SimMaster`].
#[derive(Clone, Debug)]
pub struct SimAttachment {
    pub request: AttachRequest,
    pub corked: bool,
    pub volume: Option<ChannelVolumes>,
    pub muted: bool,
    pub requested_latency: Option<Usec>,
    /// Sum of all rewinds requested so far
    pub rewound: usize,
}

struct SimState {
    description: Option<String>,
    channel_map: ChannelMap,
    flags: EndpointFlags,
    state: EndpointState,
    suspend_cause: SuspendCause,
    has_io: bool,
    fail_attach: bool,

    latency: Usec,
    latency_range: LatencyRange,
    fixed_latency: Usec,
    max_rewind: usize,
    delay_bytes: usize,
    resampler_delay: Usec,

    attachments: HashMap<AttachmentId, SimAttachment>,
    next_attachment: u32,
    calls: Vec<SimCall>,
}

/// A master endpoint that records everything done to it.
pub struct SimMaster {
    id: EndpointId,
    name: String,
    spec: SampleSpec,
    state: Mutex<SimState>,
}

impl SimMaster {
    pub fn new(name: impl Into<String>, spec: SampleSpec) -> Self {
        Self {
            id: EndpointId(u32::MAX),
            name: name.into(),
            spec,
            state: Mutex::new(SimState {
                description: None,
                channel_map: ChannelMap::default_for(spec.channels),
                flags: EndpointFlags::LATENCY | EndpointFlags::DYNAMIC_LATENCY,
                state: EndpointState::Running,
                suspend_cause: SuspendCause::EMPTY,
                has_io: true,
                fail_attach: false,
                latency: 0,
                latency_range: LatencyRange::new(500, 2_000_000),
                fixed_latency: 0,
                max_rewind: 0,
                delay_bytes: 0,
                resampler_delay: 0,
                attachments: HashMap::new(),
                next_attachment: 0,
                calls: Vec::new(),
            }),
        }
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.state.lock().description = Some(description.into());
        self
    }

    pub fn with_channel_map(self, map: ChannelMap) -> Self {
        self.state.lock().channel_map = map;
        self
    }

    pub fn with_flags(self, flags: EndpointFlags) -> Self {
        self.state.lock().flags = flags;
        self
    }

    pub fn with_latency(self, latency: Usec) -> Self {
        self.state.lock().latency = latency;
        self
    }

    pub fn with_latency_range(self, range: LatencyRange) -> Self {
        self.state.lock().latency_range = range;
        self
    }

    pub fn with_fixed_latency(self, latency: Usec) -> Self {
        self.state.lock().fixed_latency = latency;
        self
    }

    pub fn with_max_rewind(self, nbytes: usize) -> Self {
        self.state.lock().max_rewind = nbytes;
        self
    }

    pub fn with_delay_bytes(self, nbytes: usize) -> Self {
        self.state.lock().delay_bytes = nbytes;
        self
    }

    pub fn with_resampler_delay(self, delay: Usec) -> Self {
        self.state.lock().resampler_delay = delay;
        self
    }

    /// Every attach request fails.
    pub fn failing_attach(self) -> Self {
        self.state.lock().fail_attach = true;
        self
    }

    /// Pose as the endpoint `id` without registering.
    pub fn with_id(mut self, id: EndpointId) -> Self {
        self.id = id;
        self
    }

    /// Claim the master's name in `lookup`.
    pub fn register(mut self, lookup: &dyn EndpointLookup) -> Result<Arc<Self>, VsourceError> {
        self.id = lookup.register(&self.name, EndpointKind::Source)?;
        Ok(Arc::new(self))
    }

    pub fn set_state(&self, state: EndpointState, cause: SuspendCause) {
        let mut s = self.state.lock();
        s.state = state;
        s.suspend_cause = cause;
    }

    pub fn set_has_io(&self, has_io: bool) {
        self.state.lock().has_io = has_io;
    }

    pub fn set_latency(&self, latency: Usec) {
        self.state.lock().latency = latency;
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn attachment(&self, id: AttachmentId) -> Option<SimAttachment> {
        self.state.lock().attachments.get(&id).cloned()
    }

    pub fn attachment_count(&self) -> usize {
        self.state.lock().attachments.len()
    }

    fn with_attachment(&self, id: AttachmentId, call: SimCall, f: impl FnOnce(&mut SimAttachment)) {
        let mut s = self.state.lock();
        s.calls.push(call);
        match s.attachments.get_mut(&id) {
            Some(attachment) => f(attachment),
            None => warn!(master = %self.name, ?id, "unknown attachment"),
        }
    }
}

impl MasterEndpoint for SimMaster {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> Option<String> {
        self.state.lock().description.clone()
    }

    fn sample_spec(&self) -> SampleSpec {
        self.spec
    }

    fn channel_map(&self) -> ChannelMap {
        self.state.lock().channel_map.clone()
    }

    fn flags(&self) -> EndpointFlags {
        self.state.lock().flags
    }

    fn state(&self) -> EndpointState {
        self.state.lock().state
    }

    fn suspend_cause(&self) -> SuspendCause {
        self.state.lock().suspend_cause
    }

    fn has_io(&self) -> bool {
        self.state.lock().has_io
    }

    fn attach(&self, request: AttachRequest) -> Result<AttachmentId, VsourceError> {
        let mut s = self.state.lock();
        if s.fail_attach {
            return Err(VsourceError::resource_exhausted(format!("{} refuses attachments", self.name)));
        }

        let id = AttachmentId(s.next_attachment);
        s.next_attachment += 1;
        s.attachments.insert(
            id,
            SimAttachment {
                corked: request.start_corked,
                request,
                volume: None,
                muted: false,
                requested_latency: None,
                rewound: 0,
            },
        );
        s.calls.push(SimCall::Attach(id));
        Ok(id)
    }

    fn detach(&self, attachment: AttachmentId) {
        let mut s = self.state.lock();
        s.attachments.remove(&attachment);
        s.calls.push(SimCall::Detach(attachment));
    }

    fn set_corked(&self, attachment: AttachmentId, corked: bool) {
        self.with_attachment(attachment, SimCall::Cork(attachment, corked), |a| a.corked = corked);
    }

    fn set_attachment_volume(&self, attachment: AttachmentId, volume: &ChannelVolumes) {
        self.with_attachment(attachment, SimCall::SetVolume(attachment, volume.clone()), |a| {
            a.volume = Some(volume.clone())
        });
    }

    fn set_attachment_mute(&self, attachment: AttachmentId, muted: bool) {
        self.with_attachment(attachment, SimCall::SetMute(attachment, muted), |a| a.muted = muted);
    }

    fn latency(&self) -> Usec {
        self.state.lock().latency
    }

    fn latency_range(&self) -> LatencyRange {
        self.state.lock().latency_range
    }

    fn fixed_latency(&self) -> Usec {
        self.state.lock().fixed_latency
    }

    fn max_rewind(&self) -> usize {
        self.state.lock().max_rewind
    }

    fn delay_bytes(&self, _attachment: AttachmentId) -> usize {
        self.state.lock().delay_bytes
    }

    fn resampler_delay(&self, _attachment: AttachmentId) -> Usec {
        self.state.lock().resampler_delay
    }

    fn request_rewind(&self, attachment: AttachmentId, nbytes: usize) {
        self.with_attachment(attachment, SimCall::RequestRewind(attachment, nbytes), |a| a.rewound += nbytes);
    }

    fn set_requested_latency(&self, attachment: AttachmentId, latency: Option<Usec>) {
        self.with_attachment(attachment, SimCall::SetRequestedLatency(attachment, latency), |a| {
            a.requested_latency = latency
        });
    }
}

/// A [`SourceOutput`] that pushes everything it receives into a ring buffer.
pub struct CaptureOutput {
    producer: Producer<u8>,
}

/// Reading end of a [`CaptureOutput`].
pub struct CaptureReceiver {
    consumer: Consumer<u8>,
}

impl CaptureOutput {
    /// Create an output able to hold `capacity` unread bytes.
    pub fn new(capacity: usize) -> (Self, CaptureReceiver) {
        let (producer, consumer) = RingBuffer::new(capacity);
        (Self { producer }, CaptureReceiver { consumer })
    }

    /// Free space in bytes
    #[inline]
    pub fn available(&self) -> usize {
        self.producer.slots()
    }
}

impl SourceOutput for CaptureOutput {
    fn push(&mut self, chunk: &[u8]) {
        if chunk.len() > self.producer.slots() {
            warn!(len = chunk.len(), free = self.producer.slots(), "capture buffer full, dropping data");
        }
        for byte in chunk {
            if self.producer.push(*byte).is_err() {
                break;
            }
        }
    }
}

impl CaptureReceiver {
    /// Everything captured since the last call.
    pub fn drain(&mut self) -> Vec<u8> {
        core::iter::from_fn(|| self.consumer.pop().ok()).collect()
    }

    pub fn len(&self) -> usize {
        self.consumer.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [`SourceOutput`] that throws everything away.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullOutput;

impl SourceOutput for NullOutput {
    fn push(&mut self, _chunk: &[u8]) {}
}

/// Plays a fixed buffer into an uplink once, then falls silent.
pub struct BufferProducer {
    data: Vec<u8>,
    pos: usize,
}

impl BufferProducer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl UplinkProducer for BufferProducer {
    fn render(&mut self, nbytes: usize, out: &mut Vec<u8>) {
        let end = (self.pos + nbytes).min(self.data.len());
        out.extend_from_slice(&self.data[self.pos..end]);
        self.pos = end;
    }
}

/// Sine tone on every channel, for feeding an uplink.
pub struct ToneProducer {
    spec: SampleSpec,
    frequency: f32,
    amplitude: f32,
    phase: f32,
}

impl ToneProducer {
    pub fn new(spec: SampleSpec, frequency: f32) -> Self {
        Self {
            spec,
            frequency,
            amplitude: 0.25,
            phase: 0.0,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }
}

impl UplinkProducer for ToneProducer {
    fn render(&mut self, nbytes: usize, out: &mut Vec<u8>) {
        let frames = nbytes / self.spec.frame_size().max(1);
        let phase_inc = self.frequency / self.spec.rate as f32;

        for _ in 0..frames {
            let value = (self.phase * core::f32::consts::TAU).sin() * self.amplitude;
            for _ in 0..self.spec.channels {
                match self.spec.format {
                    SampleFormat::F32Le => out.extend_from_slice(&value.to_le_bytes()),
                    SampleFormat::S16Le => out.extend_from_slice(&value.to_sample::<i16>().to_le_bytes()),
                    SampleFormat::U8 => out.push(value.to_sample::<u8>()),
                }
            }

            self.phase += phase_inc;
            self.phase -= (self.phase >= 1.0) as u32 as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointRegistry;

    #[test]
    fn capture_round_trip() {
        let (mut output, mut rx) = CaptureOutput::new(8);
        output.push(&[1, 2, 3]);
        output.push(&[4]);
        assert_eq!(rx.len(), 4);
        assert_eq!(rx.drain(), vec![1, 2, 3, 4]);
        assert!(rx.is_empty());
    }

    #[test]
    fn tone_renders_whole_frames() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 48_000, 2);
        let mut tone = ToneProducer::new(spec, 440.0);
        let mut out = Vec::new();
        tone.render(4 * 10 + 3, &mut out);
        assert_eq!(out.len(), 40);
    }

    #[test]
    fn tone_peaks_follow_the_format() {
        let mut out = Vec::new();
        let s16 = SampleSpec::new(SampleFormat::S16Le, 4, 1);
        ToneProducer::new(s16, 1.0).with_amplitude(0.5).render(4, &mut out);
        // a quarter period in: sin = 1
        let peak = i16::from_le_bytes([out[2], out[3]]);
        assert!((16_000..=16_400).contains(&peak), "{peak}");

        out.clear();
        let u8_spec = SampleSpec::new(SampleFormat::U8, 4, 1);
        ToneProducer::new(u8_spec, 1.0).with_amplitude(0.5).render(2, &mut out);
        assert_eq!(out[0], 0x80);
        assert!((0xBE..=0xC2).contains(&out[1]), "{}", out[1]);
    }

    #[test]
    fn master_records_calls() {
        let reg = EndpointRegistry::new();
        let master = SimMaster::new("hw", SampleSpec::new(SampleFormat::F32Le, 48_000, 2))
            .register(&reg)
            .unwrap();
        assert_eq!(reg.find("hw"), Some(master.id()));

        let id = master
            .attach(AttachRequest {
                properties: Default::default(),
                sample_spec: master.sample_spec(),
                channel_map: master.channel_map(),
                resample_method: Default::default(),
                remix: true,
                start_corked: true,
            })
            .unwrap();
        master.set_corked(id, false);
        master.detach(id);

        assert_eq!(master.calls(), vec![SimCall::Attach(id), SimCall::Cork(id, false), SimCall::Detach(id)]);
        assert_eq!(master.attachment_count(), 0);
    }
}
