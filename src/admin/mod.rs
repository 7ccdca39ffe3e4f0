//! Cluster administration ingress.
//!
//! A thin dispatcher that validates admin commands and forwards them to a
//! coordinator queue; it never touches the on-disk manifest.

pub mod dispatcher;

// Re-export commonly used types
pub use dispatcher::{
    AdminAction, AdminDispatcher, ChannelQueue, ClusterState, DispatcherConfig, NodeRef,
    OverseerQueue, QueueEvent, ShardRpc,
};
