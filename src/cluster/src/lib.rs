//! Cluster membership: the immutable `BackendConfig` snapshot and the
//! `MembershipTracker` that keeps it up to date from a statestore-style
//! topic feed.

pub mod backend;
pub mod membership;

pub use backend::{BackendConfig, BackendDescriptor};
pub use membership::{DeltaEntry, DeltaPayload, MembershipTracker, RawBackendPayload, TopicDelta};
