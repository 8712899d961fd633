//! Uplink companion sink.
//!
//! A playback endpoint living next to a virtual source. Whatever is played
//! into it gets mixed into the source's captured stream, which is how echo
//! reference and monitoring paths are built. The control half tracks identity
//! and suspend state; the io half owns the buffer the producer renders into.

use tracing::debug;

use crate::endpoint::{props, EndpointFlags, EndpointId, EndpointState, Properties, SuspendCause};
use crate::error::QueueError;
use crate::policy::LatencyRange;
use crate::queue::{MemQueue, QUEUE_MAX_LENGTH};
use crate::sample::{SampleSpec, Usec};

/// Whatever plays into the uplink sink.
pub trait UplinkProducer: Send + 'static {
    /// Append about `nbytes` bytes of audio to `out`. Appending nothing means
    /// the producer has nothing to play; the uplink fills with silence.
    fn render(&mut self, nbytes: usize, out: &mut Vec<u8>);
}

/// Control-thread state of the uplink sink.
pub struct UplinkControl {
    sink_id: EndpointId,
    monitor_id: EndpointId,
    name: String,
    state: EndpointState,
    suspend_cause: SuspendCause,
    flags: EndpointFlags,
    properties: Properties,
}

impl UplinkControl {
    pub fn new(
        sink_id: EndpointId,
        monitor_id: EndpointId,
        name: impl Into<String>,
        flags: EndpointFlags,
        master_name: &str,
        master_description: Option<&str>,
    ) -> Self {
        let name = name.into();
        let mut properties = Properties::new();
        properties.insert(props::DEVICE_MASTER_DEVICE.to_owned(), master_name.to_owned());
        properties.insert(props::DEVICE_CLASS.to_owned(), "uplink sink".to_owned());
        properties.insert(props::UPLINK_SINK_NAME.to_owned(), name.clone());

        let mut uplink = Self {
            sink_id,
            monitor_id,
            name,
            state: EndpointState::Init,
            suspend_cause: SuspendCause::EMPTY,
            flags: flags & EndpointFlags::INHERITED,
            properties,
        };
        uplink.set_master(master_name, master_description, flags);
        uplink
    }

    pub fn sink_id(&self) -> EndpointId {
        self.sink_id
    }

    pub fn monitor_id(&self) -> EndpointId {
        self.monitor_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn suspend_cause(&self) -> SuspendCause {
        self.suspend_cause
    }

    pub fn flags(&self) -> EndpointFlags {
        self.flags
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn description(&self) -> Option<&str> {
        self.properties.get(props::DEVICE_DESCRIPTION).map(String::as_str)
    }

    /// Regenerate master-derived properties and flags.
    pub fn set_master(&mut self, master_name: &str, master_description: Option<&str>, master_flags: EndpointFlags) {
        self.flags = self.flags.update(EndpointFlags::INHERITED, master_flags);
        self.properties.insert(props::DEVICE_MASTER_DEVICE.to_owned(), master_name.to_owned());
        self.properties.insert(
            props::DEVICE_DESCRIPTION.to_owned(),
            format!("Uplink Sink {} on {}", self.name, master_description.unwrap_or(master_name)),
        );
    }

    pub(crate) fn set_state(&mut self, state: EndpointState) {
        self.state = state;
    }

    /// Add or remove suspend causes. Returns the new state if it changed.
    pub fn suspend(&mut self, suspend: bool, cause: SuspendCause) -> Option<EndpointState> {
        if !self.state.is_linked() || cause.is_empty() {
            return None;
        }

        if suspend {
            self.suspend_cause.insert(cause);
        } else {
            self.suspend_cause.remove(cause);
        }

        let state = if self.suspend_cause.is_empty() {
            match self.state {
                EndpointState::Suspended => EndpointState::Idle,
                s => s,
            }
        } else {
            EndpointState::Suspended
        };

        if state == self.state {
            return None;
        }
        self.state = state;
        Some(state)
    }
}

/// Realtime-thread state of the uplink sink.
pub struct UplinkIo {
    queue: MemQueue,
    spec: SampleSpec,
    state: EndpointState,
    producer: Option<Box<dyn UplinkProducer>>,

    requested_latency: Option<Usec>,
    latency_range: LatencyRange,
    max_request: usize,
    max_rewind: usize,
    pending_rewind: usize,

    render_buf: Vec<u8>,
    out_buf: Vec<u8>,
}

impl UplinkIo {
    pub fn new(spec: SampleSpec, max_block_bytes: usize) -> Self {
        let block = spec.block_bytes(max_block_bytes);
        Self {
            queue: MemQueue::for_spec(&spec, QUEUE_MAX_LENGTH),
            spec,
            state: EndpointState::Init,
            producer: None,
            requested_latency: None,
            latency_range: LatencyRange::default(),
            max_request: 0,
            max_rewind: 0,
            pending_rewind: 0,
            render_buf: Vec::with_capacity(block),
            out_buf: vec![0; block],
        }
    }

    #[inline]
    pub fn is_opened(&self) -> bool {
        self.state.is_opened()
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn queue_length(&self) -> usize {
        self.queue.length()
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    pub fn max_request(&self) -> usize {
        self.max_request
    }

    pub fn latency_range(&self) -> LatencyRange {
        self.latency_range
    }

    pub fn connect(&mut self, producer: Box<dyn UplinkProducer>) {
        self.producer = Some(producer);
    }

    pub fn set_state(&mut self, state: EndpointState) {
        if !state.is_opened() && self.state.is_opened() {
            self.queue.flush_write(true);
            self.max_request = 0;
            self.max_rewind = 0;
        }
        let was_linked = self.state.is_linked();
        self.state = state;
        if state.is_linked() && !was_linked {
            self.update_requested_latency();
        }
    }

    pub fn set_latency_range(&mut self, range: LatencyRange) {
        self.latency_range = range;
        self.update_requested_latency();
    }

    pub fn set_requested_latency(&mut self, latency: Option<Usec>) {
        self.requested_latency = latency;
        self.update_requested_latency();
    }

    /// Size the queue history (and the sink's request/rewind limits) after
    /// the requested latency, or the range maximum when nothing is requested.
    pub fn update_requested_latency(&mut self) {
        if !self.state.is_linked() {
            return;
        }

        let latency = self.requested_latency.unwrap_or(self.latency_range.max);
        let rewind_size = self.spec.usec_to_bytes(latency);
        self.queue.set_max_rewind(rewind_size);
        self.max_request = rewind_size;
        self.max_rewind = rewind_size;
    }

    /// A client asked for `nbytes` to be rendered again. Handled on the next
    /// render.
    pub fn request_rewind(&mut self, nbytes: usize) {
        self.pending_rewind = self.pending_rewind.max(nbytes);
    }

    /// Discard the most recently rendered unread data.
    pub fn process_rewind(&mut self) {
        let nbytes = std::mem::take(&mut self.pending_rewind);
        if !self.is_opened() || nbytes == 0 {
            return;
        }

        debug!(nbytes, "uplink rewind requested");

        let queued = self.queue.length();
        if queued == 0 {
            debug!("uplink queue empty, cannot rewind");
            return;
        }

        let rewound = self.queue.retract(nbytes.min(queued));
        debug!(rewound, "uplink rewound");
    }

    /// Replay `nbytes` already mixed into the source, keeping the uplink in
    /// lock-step with a rewinding master.
    pub fn rewind_read(&mut self, nbytes: usize) {
        if self.is_opened() && nbytes > 0 {
            self.queue.seek_relative(-(nbytes as i64), true);
        }
    }

    /// Pull `nbytes` out of the uplink, asking the producer for what the
    /// queue is missing. At most one block is returned per call.
    pub fn render(&mut self, nbytes: usize) -> &[u8] {
        self.process_rewind();

        let nbytes = nbytes.min(self.out_buf.len());
        while self.queue.length() < nbytes {
            let missing = (nbytes - self.queue.length()).min(self.render_buf.capacity());

            self.render_buf.clear();
            if let Some(producer) = self.producer.as_mut() {
                producer.render(missing, &mut self.render_buf);
            }
            if self.render_buf.is_empty() {
                self.render_buf.resize(missing, self.spec.format.silence_byte());
            }

            if let Err(QueueError::Overflow { .. }) = self.queue.push(&self.render_buf) {
                // peek pads the rest with silence
                break;
            }
        }

        let out = &mut self.out_buf[..nbytes];
        self.queue.peek_fixed(out);
        self.queue.drop(nbytes);
        out
    }

    /// Latency of the uplink relative to the source it feeds.
    pub fn latency(&self, source_latency: Usec) -> i64 {
        if !self.is_opened() {
            return 0;
        }
        self.spec.bytes_to_usec(self.queue.length()) as i64 - source_latency as i64
    }
}
