//! Messages between the control thread and the realtime thread.
//!
//! Requests flow control → io over one rtrb queue and are drained at the start
//! of every io callback. Events flow io → control over a second queue and are
//! drained whenever the control side calls
//! [`VirtualSource::process_events`](crate::node::VirtualSource::process_events).
//!
//! Synchronous requests carry a crossbeam `bounded(1)` sender. The control
//! thread blocks on the matching receiver until the io thread has handled the
//! request, so the handler has the node's io state to itself while it runs.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::warn;

use crate::endpoint::{AttachmentId, AttachmentState, EndpointFlags, EndpointState, MasterEndpoint, SuspendCause};
use crate::error::{BlockSizeError, VsourceError};
use crate::filter::BlockProcessor;
use crate::policy::{BlockSizes, LatencyRange};
use crate::queue::MemQueue;
use crate::sample::Usec;
use crate::uplink::{UplinkIo, UplinkProducer};

pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// control → io
pub enum IoRequest<P: BlockProcessor> {
    /// Hand new parameters to the filter. Synchronous.
    UpdateParameters {
        params: P::Params,
        reply: Sender<Result<BlockSizes, BlockSizeError>>,
    },
    /// State of the public endpoint
    SetState { state: EndpointState, cause: SuspendCause },
    SetAttachmentState(AttachmentState),
    /// Latency requested by the public endpoint's consumers
    SetRequestedLatency(Option<Usec>),
    /// Switch to a new master after a move
    Rebind {
        master: Arc<dyn MasterEndpoint>,
        attachment: AttachmentId,
        flags: EndpointFlags,
    },
    UplinkState(EndpointState),
    UplinkRequestedLatency(Option<Usec>),
    /// A client of the uplink sink wants `nbytes` re-rendered
    UplinkRewind(usize),
    ConnectUplinkInput(Box<dyn UplinkProducer>),
    /// Read out timing state. Synchronous.
    Query { reply: Sender<IoSnapshot> },
    /// Stop processing and give up the buffers. Synchronous.
    Unlink { reply: Sender<Released> },
}

/// io → control
pub enum IoEvent<P: BlockProcessor> {
    /// Parameters handed back by the filter, released on the control thread
    FreeParameters(P::Params),
    /// The io side finished attaching to a master
    OutputAttached,
}

/// Timing state of the io side at the moment of a [`IoRequest::Query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoSnapshot {
    pub latency: Usec,
    pub latency_range: LatencyRange,
    pub fixed_latency: Usec,
    /// Public endpoint max rewind, in public bytes
    pub max_rewind: usize,
    pub requested_latency: Option<Usec>,
    pub block_sizes: BlockSizes,
    pub queue_length: usize,
    pub queue_max_rewind: usize,
    pub uplink_latency: i64,
    pub uplink_queue_length: usize,
    pub uplink_max_rewind: usize,
}

/// Buffers owned by the io side, handed back on unlink so they are dropped on
/// the control thread.
#[derive(Default)]
pub struct Released {
    pub queue: Option<MemQueue>,
    pub uplink: Option<UplinkIo>,
}

/// Control-thread end.
pub struct ControlChannel<P: BlockProcessor> {
    requests: Producer<IoRequest<P>>,
    events: Consumer<IoEvent<P>>,
}

/// Realtime-thread end.
pub struct IoChannel<P: BlockProcessor> {
    requests: Consumer<IoRequest<P>>,
    events: Producer<IoEvent<P>>,
}

pub fn channel<P: BlockProcessor>(queue_size: usize) -> (ControlChannel<P>, IoChannel<P>) {
    let (req_tx, req_rx) = RingBuffer::new(queue_size);
    let (ev_tx, ev_rx) = RingBuffer::new(queue_size);

    (
        ControlChannel { requests: req_tx, events: ev_rx },
        IoChannel { requests: req_rx, events: ev_tx },
    )
}

impl<P: BlockProcessor> ControlChannel<P> {
    /// Queue a request; hands it back if the queue is full.
    pub fn send(&mut self, req: IoRequest<P>) -> Result<(), IoRequest<P>> {
        self.requests.push(req).map_err(|rtrb::PushError::Full(r)| r)
    }

    /// Whether the io end has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.requests.is_abandoned()
    }

    /// Send a request built around a fresh reply channel and return the
    /// receiving end. The caller must make sure the io side gets to run.
    pub fn request<T>(
        &mut self,
        build: impl FnOnce(Sender<T>) -> IoRequest<P>,
    ) -> Result<Receiver<T>, VsourceError> {
        if self.is_abandoned() {
            return Err(VsourceError::AttachmentLost);
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.send(build(tx))
            .map_err(|_| VsourceError::resource_exhausted("io request queue full"))?;
        Ok(rx)
    }

    pub fn events(&mut self) -> impl Iterator<Item = IoEvent<P>> + '_ {
        core::iter::from_fn(move || self.events.pop().ok())
    }
}

impl<P: BlockProcessor> IoChannel<P> {
    pub fn next_request(&mut self) -> Option<IoRequest<P>> {
        self.requests.pop().ok()
    }

    /// Fire-and-forget event to the control thread.
    pub fn post(&mut self, event: IoEvent<P>) {
        if self.events.push(event).is_err() {
            warn!("control event queue full, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Passthrough;

    #[test]
    fn test_sync_request_round_trip() {
        let (mut ctl, mut io) = channel::<Passthrough>(4);

        let rx = ctl
            .request(|reply| IoRequest::UpdateParameters { params: BlockSizes::fixed_output(64), reply })
            .unwrap();

        match io.next_request() {
            Some(IoRequest::UpdateParameters { params, reply }) => reply.send(Ok(params)).unwrap(),
            _ => panic!("expected a parameter update"),
        }
        assert_eq!(rx.recv().unwrap(), Ok(BlockSizes::fixed_output(64)));
    }

    #[test]
    fn test_abandoned_io_side() {
        let (mut ctl, io) = channel::<Passthrough>(4);
        drop(io);
        let res = ctl.request(|reply| IoRequest::Query { reply });
        assert!(matches!(res, Err(VsourceError::AttachmentLost)));
    }

    #[test]
    fn test_events_drain_in_order() {
        let (mut ctl, mut io) = channel::<Passthrough>(4);
        io.post(IoEvent::OutputAttached);
        io.post(IoEvent::FreeParameters(BlockSizes::default()));

        let events: Vec<_> = ctl.events().collect();
        assert!(matches!(events[0], IoEvent::OutputAttached));
        assert!(matches!(events[1], IoEvent::FreeParameters(_)));
        assert_eq!(ctl.events().count(), 0);
    }
}
