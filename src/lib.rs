//! vsource - virtual capture endpoints with block-aligned filtering
//!
//! A [`VirtualSource`] attaches to a master capture endpoint, feeds what it
//! captures through a filter and exposes the result as a new capture endpoint.
//!
//! Design principles:
//! - Filters declare their block sizes; the node buffers until a block is full
//!   and re-supplies history for overlapping windows
//! - Consumers rewind from the node's own history when it has one, otherwise
//!   the rewind is forwarded to the master
//! - The control thread and the realtime thread only talk through message
//!   ring buffers; synchronous requests park the control thread until applied
//! - An optional uplink sink is mixed into the captured stream

pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod mix;
pub mod node;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod sample;
pub mod sim;
pub mod uplink;

pub use config::VirtualSourceConfig;
pub use endpoint::{MasterEndpoint, SourceOutput};
pub use error::{BlockSizeError, MoveDeniedReason, VsourceError};
pub use filter::{BlockProcessor, FilterKind, Passthrough};
pub use node::{SourceIo, UnloadRequest, VirtualSource};
pub use policy::BlockSizes;
pub use registry::{EndpointLookup, EndpointRegistry};
pub use sample::{SampleFormat, SampleSpec};
pub use uplink::UplinkProducer;
