//! The virtual source node.
//!
//! A node attaches to a master capture endpoint, runs what it captures through
//! a [`FilterKind`] and exposes the result as a new capture endpoint of its
//! own, optionally mixing in whatever is played into an uplink sink.
//!
//! The node is split the way the audio graph is: [`VirtualSource`] lives on the
//! control thread and owns identity, properties and the lifecycle, while
//! [`SourceIo`] lives on the realtime thread and owns the queue, the filter and
//! the output. They only talk through the [`control`](crate::control) channel.
//!
//! ```
//! use std::sync::Arc;
//! use vsource::config::VirtualSourceConfig;
//! use vsource::filter::FilterKind;
//! use vsource::node::VirtualSource;
//! use vsource::registry::EndpointRegistry;
//! use vsource::sample::{SampleFormat, SampleSpec};
//! use vsource::sim::{CaptureOutput, SimMaster};
//!
//! let registry = Arc::new(EndpointRegistry::new());
//! let master = SimMaster::new("mic", SampleSpec::new(SampleFormat::F32Le, 48_000, 2))
//!     .register(&*registry)
//!     .unwrap();
//! let (output, mut captured) = CaptureOutput::new(1024);
//!
//! let config = VirtualSourceConfig::new("copy", "Copied");
//! let mut source: VirtualSource =
//!     VirtualSource::create(master, registry, config, FilterKind::Copy, Box::new(output)).unwrap();
//! let mut io = source.activate().unwrap();
//!
//! io.push(&[0u8; 8 * 32]).unwrap();
//! assert_eq!(captured.drain().len(), 8 * 32);
//! ```

mod io;

pub use io::SourceIo;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::{ResampleMethod, VirtualSourceConfig};
use crate::control::{self, ControlChannel, IoEvent, IoRequest, IoSnapshot, DEFAULT_QUEUE_SIZE};
use crate::endpoint::{
    props, AttachRequest, AttachmentId, AttachmentState, EndpointFlags, EndpointId, EndpointState, MasterEndpoint,
    Properties, SourceOutput, SuspendCause,
};
use crate::error::{MoveDeniedReason, VsourceError};
use crate::filter::{BlockProcessor, FilterKind, Passthrough};
use crate::policy::{self, BlockSizes, LatencyRange};
use crate::queue::{MemQueue, QUEUE_MAX_LENGTH};
use crate::registry::{EndpointKind, EndpointLookup};
use crate::sample::{ChannelMap, ChannelVolumes, SampleSpec, Usec};
use crate::uplink::{UplinkControl, UplinkIo, UplinkProducer};

use io::PublicIo;

/// How often a waiting control thread checks whether the io side went away.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on waiting for the io side during teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Returned by [`VirtualSource::kill`]: the module owning the node should be
/// unloaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnloadRequest {
    pub source_name: String,
}

/// Control-thread view of the public endpoint.
#[derive(Clone, Debug)]
pub struct PublicEndpoint {
    pub id: EndpointId,
    pub name: String,
    pub state: EndpointState,
    pub suspend_cause: SuspendCause,
    pub flags: EndpointFlags,
    pub properties: Properties,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub volume: ChannelVolumes,
    pub muted: bool,
}

impl PublicEndpoint {
    pub fn description(&self) -> Option<&str> {
        self.properties.get(props::DEVICE_DESCRIPTION).map(String::as_str)
    }
}

/// Control-thread view of the attachment to the master.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub id: AttachmentId,
    pub state: AttachmentState,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub properties: Properties,
    pub volume: ChannelVolumes,
    pub muted: bool,
}

/// Control half of a virtual source.
pub struct VirtualSource<P: BlockProcessor = Passthrough> {
    public: PublicEndpoint,
    attachment: Attachment,
    master: Arc<dyn MasterEndpoint>,
    lookup: Arc<dyn EndpointLookup>,
    uplink: Option<UplinkControl>,

    channel: ControlChannel<P>,
    /// The io half while nobody else drives it
    io: Option<SourceIo<P>>,

    source_type: String,
    desc_prefix: String,
    auto_desc: bool,
    autoloaded: bool,
    use_volume_sharing: bool,
    resample_method: ResampleMethod,
    remix: bool,
    max_latency: Option<Usec>,
    max_block_bytes: usize,

    /// Set by a move, cleared by the next attachment volume change
    moving: bool,
    torn_down: bool,
}

impl<P: BlockProcessor> VirtualSource<P> {
    /// Build a node on top of `master`.
    ///
    /// Nothing flows until [`VirtualSource::activate`]. On error, everything
    /// registered or attached so far has been released again.
    pub fn create(
        master: Arc<dyn MasterEndpoint>,
        lookup: Arc<dyn EndpointLookup>,
        config: VirtualSourceConfig,
        filter: FilterKind<P>,
        output: Box<dyn SourceOutput>,
    ) -> Result<Self, VsourceError> {
        config.validate()?;

        let master_spec = master.sample_spec();
        let sample_spec = config.sample_spec.unwrap_or(master_spec);
        let channel_map = match (&config.channel_map, &config.sample_spec) {
            (Some(map), _) => map.clone(),
            (None, None) => master.channel_map(),
            (None, Some(spec)) => ChannelMap::default_for(spec.channels),
        };
        let attach_spec = config.master_sample_spec.unwrap_or(sample_spec);
        let attach_map = match (&config.master_channel_map, &config.master_sample_spec) {
            (Some(map), _) => map.clone(),
            (None, None) => channel_map.clone(),
            (None, Some(spec)) => ChannelMap::default_for(spec.channels),
        };

        for (what, spec, map) in [("source", &sample_spec, &channel_map), ("master", &attach_spec, &attach_map)] {
            if !spec.is_valid() {
                return Err(VsourceError::invalid_config(format!("invalid {what} sample spec {spec:?}")));
            }
            if map.channels() != spec.channels as usize {
                return Err(VsourceError::invalid_config(format!(
                    "{what} channel map has {} channels, sample spec has {}",
                    map.channels(),
                    spec.channels
                )));
            }
        }

        if sample_spec.rate != attach_spec.rate {
            return Err(VsourceError::invalid_config(format!(
                "source rate {} differs from master rate {}",
                sample_spec.rate, attach_spec.rate
            )));
        }
        let passes_bytes = matches!(filter, FilterKind::None | FilterKind::Copy);
        if passes_bytes && sample_spec.frame_size() != attach_spec.frame_size() {
            return Err(VsourceError::invalid_config(format!(
                "{} filter needs equal frame sizes on both sides",
                filter.name()
            )));
        }

        let max_block_frames =
            policy::max_block_frames(config.max_block_bytes, attach_spec.frame_size(), sample_spec.frame_size());
        if let Err(e) = filter.block_sizes().validate(max_block_frames) {
            warn!("Invalid block sizes: {}", e);
            return Err(e.into());
        }

        let name = config
            .source_name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", master.name(), config.source_type));

        let public_id = lookup.register(&name, EndpointKind::Source)?;
        lookup.set_upstream(public_id, Some(master.id()));

        let mut properties = Properties::new();
        properties.insert(props::DEVICE_MASTER_DEVICE.to_owned(), master.name());
        properties.insert(props::DEVICE_CLASS.to_owned(), "filter".to_owned());
        properties.extend(config.source_properties.clone());
        properties.insert(props::device_type_name(&config.source_type), name.clone());

        let mut auto_desc = false;
        if let Some(description) = &config.description {
            properties.insert(props::DEVICE_DESCRIPTION.to_owned(), description.clone());
        } else if !properties.contains_key(props::DEVICE_DESCRIPTION) {
            auto_desc = true;
            properties.insert(
                props::DEVICE_DESCRIPTION.to_owned(),
                generated_description(&config.description_prefix, &name, master.as_ref()),
            );
        }

        let mut flags = master.flags() & EndpointFlags::INHERITED;
        if config.use_volume_sharing {
            flags.insert(EndpointFlags::SHARE_VOLUME_WITH_MASTER);
        }
        if config.force_flat_volume {
            flags.insert(EndpointFlags::FLAT_VOLUME);
        }

        let public = PublicEndpoint {
            id: public_id,
            name: name.clone(),
            state: EndpointState::Init,
            suspend_cause: SuspendCause::EMPTY,
            flags,
            properties,
            sample_spec,
            channel_map: channel_map.clone(),
            volume: ChannelVolumes::norm(sample_spec.channels as usize),
            muted: false,
        };

        let mut attach_props = config.attachment_properties.clone();
        attach_props.insert(
            props::MEDIA_NAME.to_owned(),
            format!("{} Stream of {}", config.description_prefix, public.description().unwrap_or(&name)),
        );
        attach_props.insert(props::MEDIA_ROLE.to_owned(), "filter".to_owned());

        let attachment_id = match master.attach(AttachRequest {
            properties: attach_props.clone(),
            sample_spec: attach_spec,
            channel_map: attach_map.clone(),
            resample_method: config.resample_method,
            remix: config.remix,
            start_corked: true,
        }) {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to attach to master {}: {}", master.name(), e);
                lookup.unregister(public_id);
                return Err(e);
            }
        };

        let attachment = Attachment {
            id: attachment_id,
            state: AttachmentState::Init,
            sample_spec: attach_spec,
            channel_map: attach_map,
            properties: attach_props,
            volume: ChannelVolumes::norm(attach_spec.channels as usize),
            muted: false,
        };

        let (uplink, uplink_io) = match &config.uplink_sink {
            Some(uplink_name) => {
                let registered = lookup.register(uplink_name, EndpointKind::Sink).and_then(|sink_id| {
                    lookup
                        .register(&format!("{uplink_name}.monitor"), EndpointKind::Monitor)
                        .inspect_err(|_| lookup.unregister(sink_id))
                        .map(|monitor_id| (sink_id, monitor_id))
                });

                let (sink_id, monitor_id) = match registered {
                    Ok(ids) => ids,
                    Err(e) => {
                        warn!("Failed to create uplink sink {}: {}", uplink_name, e);
                        lookup.unregister(public_id);
                        master.detach(attachment_id);
                        return Err(e);
                    }
                };

                let description = master.description();
                let control = UplinkControl::new(
                    sink_id,
                    monitor_id,
                    uplink_name.clone(),
                    master.flags(),
                    &master.name(),
                    description.as_deref(),
                );
                (Some(control), Some(UplinkIo::new(sample_spec, config.max_block_bytes)))
            }
            None => (None, None),
        };

        let queue = filter
            .uses_queue()
            .then(|| MemQueue::for_spec(&attach_spec, QUEUE_MAX_LENGTH));

        let (channel, io_channel) = control::channel(DEFAULT_QUEUE_SIZE);

        let io = SourceIo {
            filter,
            queue,
            public: PublicIo::new(sample_spec, output, uplink_io, config.max_block_bytes),
            channel: io_channel,
            master: master.clone(),
            attachment: attachment_id,
            attach_spec,
            flags,
            state: EndpointState::Init,
            suspend_cause: SuspendCause::EMPTY,
            attachment_state: AttachmentState::Init,
            attached: false,
            max_latency: config.max_latency_usec,
            max_block_bytes: config.max_block_bytes,
            requested_latency: None,
            latency_range: LatencyRange::default(),
            fixed_latency: 0,
            max_rewind: 0,
            scratch_in: vec![0; max_block_frames * attach_spec.frame_size()],
            scratch_out: vec![0; max_block_frames * sample_spec.frame_size()],
        };

        info!(
            name = %name,
            master = %master.name(),
            filter = io.filter.name(),
            uplink = config.uplink_sink.as_deref(),
            "created virtual source"
        );

        Ok(Self {
            public,
            attachment,
            master,
            lookup,
            uplink,
            channel,
            io: Some(io),
            source_type: config.source_type,
            desc_prefix: config.description_prefix,
            auto_desc,
            autoloaded: config.autoloaded,
            use_volume_sharing: config.use_volume_sharing,
            resample_method: config.resample_method,
            remix: config.remix,
            max_latency: config.max_latency_usec,
            max_block_bytes: config.max_block_bytes,
            moving: false,
            torn_down: false,
        })
    }

    /// Start the node and hand out its realtime half.
    ///
    /// The returned [`SourceIo`] must be driven by whoever receives audio from
    /// the master. It can be given back with [`VirtualSource::return_io`].
    pub fn activate(&mut self) -> Result<SourceIo<P>, VsourceError> {
        let Some(io) = self.io.as_ref() else {
            return Err(VsourceError::invalid_config("virtual source is already active"));
        };
        if let Err(e) = io.check_block_sizes() {
            warn!("Invalid block sizes: {}", e);
            return Err(e.into());
        }

        // the uplink has to be able to play before anything captures
        if self.uplink.is_some() {
            self.set_uplink_state(EndpointState::Idle);
        }

        if let Some(latency) = self.max_latency {
            self.master.set_requested_latency(self.attachment.id, Some(latency));
        }

        self.attachment.state = AttachmentState::Corked;
        self.send(IoRequest::SetAttachmentState(AttachmentState::Corked));
        if let Some(io) = self.io.as_mut() {
            io.attach();
        }

        self.public.state = EndpointState::Idle;
        self.send(IoRequest::SetState { state: EndpointState::Idle, cause: self.public.suspend_cause });

        if !self.use_volume_sharing && !self.master.flat_volume() {
            self.apply_public_volume();
        }

        self.master.set_corked(self.attachment.id, false);
        self.attachment.state = AttachmentState::Running;
        self.send(IoRequest::SetAttachmentState(AttachmentState::Running));

        self.process_events();

        debug!(name = %self.public.name, "virtual source active");
        self.io
            .take()
            .ok_or_else(|| VsourceError::invalid_config("virtual source is already active"))
    }

    /// Take back the realtime half, e.g. after its thread stopped. Requests
    /// are then handled inline again.
    pub fn return_io(&mut self, io: SourceIo<P>) {
        self.io = Some(io);
        self.process_events();
    }

    pub fn public(&self) -> &PublicEndpoint {
        &self.public
    }

    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    pub fn master(&self) -> &Arc<dyn MasterEndpoint> {
        &self.master
    }

    pub fn uplink(&self) -> Option<&UplinkControl> {
        self.uplink.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.public.name
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn max_block_bytes(&self) -> usize {
        self.max_block_bytes
    }

    /// The realtime half, while it is held by the node.
    pub fn io(&self) -> Option<&SourceIo<P>> {
        self.io.as_ref()
    }

    pub fn io_mut(&mut self) -> Option<&mut SourceIo<P>> {
        self.io.as_mut()
    }

    fn send(&mut self, req: IoRequest<P>) {
        if self.channel.send(req).is_err() {
            warn!("io request queue full, dropping request");
        }
        if let Some(io) = self.io.as_mut() {
            io.process_messages();
        }
    }

    /// Send a synchronous request and park until the io side answered it.
    fn call<T>(
        &mut self,
        build: impl FnOnce(Sender<T>) -> IoRequest<P>,
        timeout: Option<Duration>,
    ) -> Result<T, VsourceError> {
        let rx = self.channel.request(build)?;
        if let Some(io) = self.io.as_mut() {
            io.process_messages();
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match rx.recv_timeout(SYNC_POLL_INTERVAL) {
                Ok(reply) => return Ok(reply),
                Err(RecvTimeoutError::Disconnected) => return Err(VsourceError::AttachmentLost),
                Err(RecvTimeoutError::Timeout) => {
                    if self.channel.is_abandoned() || deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(VsourceError::AttachmentLost);
                    }
                }
            }
        }
    }

    /// Apply events posted by the io side.
    pub fn process_events(&mut self) {
        let events: Vec<_> = self.channel.events().collect();
        for event in events {
            match event {
                IoEvent::FreeParameters(params) => P::release_parameters(params),
                IoEvent::OutputAttached => {
                    // suspend causes may be stale after a move away from an unavailable master
                    if !self.torn_down && self.public.state.is_linked() {
                        self.suspend(self.master.is_unavailable(), SuspendCause::UNAVAILABLE);
                    }
                }
            }
        }
    }

    /// Change the public endpoint's state. A no-op (returning false) until
    /// both the endpoint and the attachment are linked.
    pub fn set_state(&mut self, state: EndpointState, cause: SuspendCause) -> bool {
        if !state.is_linked() || !self.public.state.is_linked() || !self.attachment.state.is_linked() {
            return false;
        }

        let old_state = self.public.state;
        let old_cause = self.public.suspend_cause;
        self.public.state = state;
        self.public.suspend_cause = cause;
        self.send(IoRequest::SetState { state, cause });

        if self.uplink.as_ref().is_some_and(|u| u.state().is_linked()) {
            // the uplink carries our causes minus IDLE: an idle capture path
            // does not silence the reference path
            let old_mask = uplink_causes(old_state, old_cause);
            let new_mask = uplink_causes(state, cause);
            let added = new_mask & !old_mask;
            let dropped = old_mask & !new_mask;
            if !added.is_empty() {
                self.suspend_uplink(true, added);
            }
            if !dropped.is_empty() {
                self.suspend_uplink(false, dropped);
            }
        }

        let corked = state == EndpointState::Suspended;
        let attachment_state = if corked { AttachmentState::Corked } else { AttachmentState::Running };
        if attachment_state != self.attachment.state {
            self.master.set_corked(self.attachment.id, corked);
            self.attachment.state = attachment_state;
            self.send(IoRequest::SetAttachmentState(attachment_state));
        }

        true
    }

    /// Add (`suspend`) or remove a suspend cause. Returns whether anything changed.
    pub fn suspend(&mut self, suspend: bool, cause: SuspendCause) -> bool {
        let old_cause = self.public.suspend_cause;
        let mut new_cause = old_cause;
        if suspend {
            new_cause.insert(cause);
        } else {
            new_cause.remove(cause);
        }

        let state = if !new_cause.is_empty() {
            EndpointState::Suspended
        } else if self.public.state == EndpointState::Suspended {
            EndpointState::Idle
        } else {
            self.public.state
        };

        if new_cause == old_cause && state == self.public.state {
            return false;
        }
        self.set_state(state, new_cause)
    }

    /// The master changed state.
    pub fn master_state_changed(&mut self) {
        self.suspend(self.master.is_unavailable(), SuspendCause::UNAVAILABLE);
    }

    /// Set the public endpoint's volume. Forwarded to the attachment unless
    /// the volume is shared with the master.
    pub fn set_volume(&mut self, volume: ChannelVolumes) {
        self.public.volume = volume;
        if self.use_volume_sharing {
            return;
        }
        self.apply_public_volume();
    }

    fn apply_public_volume(&mut self) {
        let volume = self.public.volume.remap(&self.public.channel_map, &self.attachment.channel_map);
        self.master.set_attachment_volume(self.attachment.id, &volume);
        self.attachment.volume = volume;
    }

    pub fn set_mute(&mut self, muted: bool) {
        self.public.muted = muted;
        self.attachment.muted = muted;
        self.master.set_attachment_mute(self.attachment.id, muted);
    }

    /// The attachment's volume was changed on the master side.
    pub fn attachment_volume_changed(&mut self, volume: ChannelVolumes) {
        self.attachment.volume = volume;

        // the public volume survives moves
        if std::mem::take(&mut self.moving) || self.use_volume_sharing {
            return;
        }
        self.public.volume = self.attachment.volume.remap(&self.attachment.channel_map, &self.public.channel_map);
    }

    pub fn attachment_mute_changed(&mut self, muted: bool) {
        self.attachment.muted = muted;
        self.public.muted = muted;
    }

    /// Latency requested by the public endpoint's consumers.
    pub fn set_requested_latency(&mut self, latency: Option<Usec>) {
        self.send(IoRequest::SetRequestedLatency(latency));
    }

    /// Hand new parameters to the filter and wait until the io side applied
    /// them. Invalid block sizes are rejected and the old ones kept.
    pub fn request_parameter_update(&mut self, params: P::Params) -> Result<BlockSizes, VsourceError> {
        let result = self.call(|reply| IoRequest::UpdateParameters { params, reply }, None);
        self.process_events();
        Ok(result??)
    }

    pub fn query(&mut self) -> Result<IoSnapshot, VsourceError> {
        let snapshot = self.call(|reply| IoRequest::Query { reply }, None);
        self.process_events();
        snapshot
    }

    pub fn latency(&mut self) -> Result<Usec, VsourceError> {
        self.query().map(|s| s.latency)
    }

    /// The uplink sink changed state.
    pub fn set_uplink_state(&mut self, state: EndpointState) {
        let Some(uplink) = self.uplink.as_mut() else {
            return;
        };
        if uplink.state() == state {
            return;
        }
        uplink.set_state(state);
        self.send(IoRequest::UplinkState(state));

        if state.is_opened() && self.public.state.is_linked() && !self.public.state.is_opened() {
            debug!(name = %self.public.name, "uplink opened, resuming source");
            self.suspend(false, SuspendCause::IDLE);
        }
    }

    /// Add or remove suspend causes on the uplink sink.
    pub fn suspend_uplink(&mut self, suspend: bool, cause: SuspendCause) {
        let Some(uplink) = self.uplink.as_mut() else {
            return;
        };
        if let Some(state) = uplink.suspend(suspend, cause) {
            debug!(uplink = uplink.name(), ?state, ?cause, "uplink state changed");
            self.send(IoRequest::UplinkState(state));
        }
    }

    /// Connect whatever plays into the uplink sink.
    pub fn connect_uplink_input(&mut self, producer: Box<dyn UplinkProducer>) -> Result<(), VsourceError> {
        if self.uplink.is_none() {
            return Err(VsourceError::invalid_config("virtual source has no uplink sink"));
        }
        self.send(IoRequest::ConnectUplinkInput(producer));
        Ok(())
    }

    pub fn set_uplink_requested_latency(&mut self, latency: Option<Usec>) {
        if self.uplink.is_some() {
            self.send(IoRequest::UplinkRequestedLatency(latency));
        }
    }

    pub fn request_uplink_rewind(&mut self, nbytes: usize) {
        if self.uplink.is_some() {
            self.send(IoRequest::UplinkRewind(nbytes));
        }
    }

    /// Whether the node may be moved onto `dest`.
    pub fn may_move_to(&self, dest: &dyn MasterEndpoint) -> Result<(), MoveDeniedReason> {
        if self.autoloaded {
            return Err(MoveDeniedReason::Autoloaded);
        }
        if dest.id() == self.public.id {
            return Err(MoveDeniedReason::SelfTarget);
        }
        if let Some(uplink) = self.uplink.as_ref() {
            if self.lookup.chain_root(dest.id()) == uplink.monitor_id() {
                return Err(MoveDeniedReason::UplinkLoop);
            }
        }
        Ok(())
    }

    /// Move the attachment onto a new master. On failure nothing changes.
    pub fn move_to(&mut self, dest: Arc<dyn MasterEndpoint>) -> Result<(), VsourceError> {
        self.may_move_to(dest.as_ref())?;

        let dest_name = dest.name();
        let dest_desc = dest.description();

        let mut properties = self.public.properties.clone();
        properties.insert(props::DEVICE_MASTER_DEVICE.to_owned(), dest_name.clone());
        if self.auto_desc {
            let name = properties
                .get(&props::device_type_name(&self.source_type))
                .cloned()
                .unwrap_or_else(|| self.public.name.clone());
            properties.insert(
                props::DEVICE_DESCRIPTION.to_owned(),
                generated_description(&self.desc_prefix, &name, dest.as_ref()),
            );
        }
        let description = properties
            .get(props::DEVICE_DESCRIPTION)
            .cloned()
            .unwrap_or_else(|| self.public.name.clone());

        let mut attach_props = self.attachment.properties.clone();
        attach_props.insert(props::MEDIA_NAME.to_owned(), format!("{} Stream from {}", self.desc_prefix, description));

        let new_attachment = dest.attach(AttachRequest {
            properties: attach_props.clone(),
            sample_spec: self.attachment.sample_spec,
            channel_map: self.attachment.channel_map.clone(),
            resample_method: self.resample_method,
            remix: self.remix,
            start_corked: self.attachment.state != AttachmentState::Running,
        })?;

        self.master.detach(self.attachment.id);
        info!(name = %self.public.name, from = %self.master.name(), to = %dest_name, "moving virtual source");

        self.public.properties = properties;
        self.public.flags = self.public.flags.update(EndpointFlags::INHERITED, dest.flags());
        self.attachment.id = new_attachment;
        self.attachment.properties = attach_props;
        self.master = dest.clone();
        self.moving = true;

        if let Some(uplink) = self.uplink.as_mut() {
            uplink.set_master(&dest_name, dest_desc.as_deref(), dest.flags());
        }
        self.lookup.set_upstream(self.public.id, Some(dest.id()));

        self.send(IoRequest::Rebind { master: dest, attachment: new_attachment, flags: self.public.flags });
        self.process_events();
        Ok(())
    }

    /// Tear the node down in order.
    pub fn destroy(mut self) {
        self.teardown(true);
    }

    /// The master went away. Tears the node down and asks for the owning
    /// module to be unloaded.
    pub fn kill(mut self) -> UnloadRequest {
        let cork = self.master.has_io();
        self.teardown(cork);
        UnloadRequest { source_name: self.public.name.clone() }
    }

    fn teardown(&mut self, cork: bool) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        debug!(name = %self.public.name, "tearing down virtual source");

        if cork && self.attachment.state.is_linked() {
            self.master.set_corked(self.attachment.id, true);
        }

        // no new consumers from here on
        if self.public.state != EndpointState::Unlinked {
            self.public.state = EndpointState::Unlinked;
            self.lookup.unregister(self.public.id);
            self.send(IoRequest::SetState { state: EndpointState::Unlinked, cause: self.public.suspend_cause });
        }

        if self.attachment.state != AttachmentState::Unlinked {
            self.master.detach(self.attachment.id);
            self.attachment.state = AttachmentState::Unlinked;
            self.send(IoRequest::SetAttachmentState(AttachmentState::Unlinked));
        }

        let released = match self.call(|reply| IoRequest::Unlink { reply }, Some(TEARDOWN_TIMEOUT)) {
            Ok(released) => released,
            Err(e) => {
                debug!("io side did not release its buffers: {}", e);
                Default::default()
            }
        };
        drop(released.queue);
        drop(released.uplink);

        if let Some(uplink) = self.uplink.as_mut() {
            uplink.set_state(EndpointState::Unlinked);
            self.lookup.unregister(uplink.monitor_id());
            self.lookup.unregister(uplink.sink_id());
        }

        self.process_events();
        self.io = None;
        info!(name = %self.public.name, "virtual source removed");
    }
}

impl<P: BlockProcessor> Drop for VirtualSource<P> {
    fn drop(&mut self) {
        self.teardown(true);
    }
}

/// Suspend causes a node in `state` imposes on its uplink.
fn uplink_causes(state: EndpointState, cause: SuspendCause) -> SuspendCause {
    if state == EndpointState::Suspended {
        cause & !SuspendCause::IDLE
    } else {
        SuspendCause::EMPTY
    }
}

fn generated_description(prefix: &str, name: &str, master: &dyn MasterEndpoint) -> String {
    let master_desc = master.description().unwrap_or_else(|| master.name());
    format!("{prefix} {name} on {master_desc}")
}
