//! Endpoint states, flag sets and the interfaces a node consumes.
//!
//! A node talks to three kinds of outside parties: the master it captures
//! from ([`MasterEndpoint`]), the consumer its own output is posted to
//! ([`SourceOutput`]) and, with an uplink, whoever plays into the uplink sink
//! ([`UplinkProducer`](crate::uplink::UplinkProducer)).

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use hashbrown::HashMap;

use crate::config::ResampleMethod;
use crate::error::VsourceError;
use crate::policy::LatencyRange;
use crate::sample::{ChannelMap, ChannelVolumes, SampleSpec, Usec};

/// Property list of an endpoint or attachment.
pub type Properties = HashMap<String, String>;

/// Well-known property keys.
pub mod props {
    pub const DEVICE_MASTER_DEVICE: &str = "device.master_device";
    pub const DEVICE_CLASS: &str = "device.class";
    pub const DEVICE_DESCRIPTION: &str = "device.description";
    pub const MEDIA_NAME: &str = "media.name";
    pub const MEDIA_ROLE: &str = "media.role";
    pub const UPLINK_SINK_NAME: &str = "device.uplink_sink.name";

    /// `device.<type>.name`
    pub fn device_type_name(source_type: &str) -> String {
        format!("device.{source_type}.name")
    }
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            pub const EMPTY: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self(1 << $bit);)*

            #[inline]
            pub fn bits(self) -> u32 {
                self.0
            }

            #[inline]
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            #[inline]
            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[inline]
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// `self` with the bits of `mask` replaced by those of `value`.
            #[inline]
            pub fn update(self, mask: Self, value: Self) -> Self {
                Self((self.0 & !mask.0) | (value.0 & mask.0))
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl Not for $name {
            type Output = Self;
            fn not(self) -> Self {
                Self(!self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut set = f.debug_set();
                $(if self.contains(Self::$flag) { set.entry(&stringify!($flag)); })*
                set.finish()
            }
        }
    };
}

flag_set! {
    /// Reasons an endpoint is suspended. An endpoint is suspended while any cause is set.
    SuspendCause {
        USER = 0,
        APPLICATION = 1,
        IDLE = 2,
        SESSION = 3,
        PASSTHROUGH = 4,
        INTERNAL = 5,
        /// The master went away or is suspended for something other than idleness
        UNAVAILABLE = 6,
    }
}

flag_set! {
    /// Capabilities of an endpoint.
    EndpointFlags {
        /// Latency can be queried
        LATENCY = 0,
        /// Latency can be adjusted at runtime
        DYNAMIC_LATENCY = 1,
        /// Volume is that of the master
        SHARE_VOLUME_WITH_MASTER = 2,
        FLAT_VOLUME = 3,
    }
}

impl EndpointFlags {
    /// Flags a virtual endpoint inherits from its master.
    pub const INHERITED: Self = Self(Self::LATENCY.0 | Self::DYNAMIC_LATENCY.0);
}

/// Lifecycle state of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum EndpointState {
    #[default]
    Init,
    Idle,
    Running,
    Suspended,
    Unlinked,
}

impl EndpointState {
    #[inline]
    pub fn is_linked(self) -> bool {
        matches!(self, EndpointState::Idle | EndpointState::Running | EndpointState::Suspended)
    }

    #[inline]
    pub fn is_opened(self) -> bool {
        matches!(self, EndpointState::Idle | EndpointState::Running)
    }
}

/// Lifecycle state of an attachment to a master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum AttachmentState {
    #[default]
    Init,
    Corked,
    Running,
    Unlinked,
}

impl AttachmentState {
    #[inline]
    pub fn is_linked(self) -> bool {
        matches!(self, AttachmentState::Corked | AttachmentState::Running)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u32);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentId(pub u32);

/// What a node asks of a master when it attaches.
#[derive(Clone, Debug)]
pub struct AttachRequest {
    pub properties: Properties,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub resample_method: ResampleMethod,
    pub remix: bool,
    pub start_corked: bool,
}

/// The capture endpoint a node is attached to.
///
/// Methods marked io are called from the realtime thread and must not block
/// for long; the rest are called from the control thread.
pub trait MasterEndpoint: Send + Sync {
    fn id(&self) -> EndpointId;
    fn name(&self) -> String;
    fn description(&self) -> Option<String>;
    fn sample_spec(&self) -> SampleSpec;
    fn channel_map(&self) -> ChannelMap;
    fn flags(&self) -> EndpointFlags;
    fn state(&self) -> EndpointState;
    fn suspend_cause(&self) -> SuspendCause;

    fn flat_volume(&self) -> bool {
        self.flags().contains(EndpointFlags::FLAT_VOLUME)
    }

    /// Whether the master still has a realtime context to talk to.
    fn has_io(&self) -> bool {
        true
    }

    /// Whether the master is suspended for a reason other than idleness.
    fn is_unavailable(&self) -> bool {
        self.state() == EndpointState::Suspended && self.suspend_cause() != SuspendCause::IDLE
    }

    fn attach(&self, request: AttachRequest) -> Result<AttachmentId, VsourceError>;
    fn detach(&self, attachment: AttachmentId);
    fn set_corked(&self, attachment: AttachmentId, corked: bool);
    fn set_attachment_volume(&self, attachment: AttachmentId, volume: &ChannelVolumes);
    fn set_attachment_mute(&self, attachment: AttachmentId, muted: bool);

    /// io: current latency of the master itself.
    fn latency(&self) -> Usec;
    /// io
    fn latency_range(&self) -> LatencyRange;
    /// io
    fn fixed_latency(&self) -> Usec;
    /// io: how far the master can rewind, in master bytes.
    fn max_rewind(&self) -> usize;
    /// io: bytes captured but not yet delivered to `attachment`, in master bytes.
    fn delay_bytes(&self, attachment: AttachmentId) -> usize;
    /// io
    fn resampler_delay(&self, attachment: AttachmentId) -> Usec;
    /// io: replay `nbytes` (attachment bytes) to `attachment`.
    fn request_rewind(&self, attachment: AttachmentId, nbytes: usize);
    /// io
    fn set_requested_latency(&self, attachment: AttachmentId, latency: Option<Usec>);
}

/// Where a node's public endpoint posts its audio.
pub trait SourceOutput: Send + 'static {
    fn push(&mut self, chunk: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_cause_set_ops() {
        let mut cause = SuspendCause::IDLE | SuspendCause::USER;
        assert!(cause.contains(SuspendCause::IDLE));
        assert_eq!(cause & !SuspendCause::IDLE, SuspendCause::USER);

        cause.remove(SuspendCause::USER);
        assert_eq!(cause, SuspendCause::IDLE);
        cause.remove(SuspendCause::IDLE);
        assert!(cause.is_empty());
    }

    #[test]
    fn flag_update_replaces_masked_bits() {
        let flags = EndpointFlags::LATENCY | EndpointFlags::SHARE_VOLUME_WITH_MASTER;
        let updated = flags.update(EndpointFlags::INHERITED, EndpointFlags::DYNAMIC_LATENCY);
        assert_eq!(updated, EndpointFlags::DYNAMIC_LATENCY | EndpointFlags::SHARE_VOLUME_WITH_MASTER);
    }

    #[test]
    fn state_predicates() {
        assert!(!EndpointState::Init.is_linked());
        assert!(EndpointState::Suspended.is_linked());
        assert!(!EndpointState::Suspended.is_opened());
        assert!(EndpointState::Running.is_opened());
        assert!(!EndpointState::Unlinked.is_linked());
        assert!(AttachmentState::Corked.is_linked());
    }
}
