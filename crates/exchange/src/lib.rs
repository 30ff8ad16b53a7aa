//! Cluster-wide lifecycle exchange for dynamically started caches
//!
//! Any member may ask for a named cache to be started, stopped, or attached
//! to as a client-side projection. Requests are forwarded to the oldest
//! member, which batches them into versioned rounds:
//! - every participant votes on the batch against its local registry
//! - a request is accepted only if every participant accepts it
//! - the coordinator broadcasts the decision and every member applies it in
//!   batch order, skipping deployment ids it already applied
//! - each member reports its local apply result back to the submitter
//!
//! Members joining the cluster receive the registry and deduplication
//! history with their first round.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::result_large_err)]

/// Builder and running node
pub mod builder;

/// Checkpoint persistence
pub mod checkpoint;

/// Configuration types
pub mod config;

/// Votes and decisions
pub mod decision;

/// Deduplication of decided requests
pub mod dedup;

/// Error types
pub mod error;

/// Service events
pub mod events;

/// Submission handle
pub mod handle;

/// Storage engine hooks
pub mod hooks;

/// Wire messages
pub mod messages;

/// Local resource registry
pub mod registry;

/// Change requests
pub mod request;

/// Exchange rounds
pub mod round;

/// The exchange actor
pub(crate) mod service;

pub use {
    builder::{ExchangeBuilder, ExchangeNode},
    checkpoint::{CheckpointStore, ExchangeCheckpoint, MemoryCheckpointStore},
    config::ExchangeConfig,
    decision::{Decision, LocalFailure, Outcome, RejectReason},
    dedup::RequestDeduplicator,
    error::{ApplyError, Error, ErrorContext, ErrorKind, ExchangeResult},
    events::ExchangeEvent,
    handle::{ExchangeHandle, ExchangeStatus, PendingDecision},
    hooks::{HookError, MemoryHooks, NoopHooks, ResourceHooks},
    registry::{LocalResourceRegistry, RegistrySnapshot, ResourceDescriptor, ResourceState},
    request::{
        AtomicityMode, CacheConfig, CacheMode, ChangeRequest, DeploymentId, EvictionPolicy,
        NearCacheConfig, RequestKind,
    },
    round::{ExchangeRound, RoundEntry, RoundState, RoundVersion},
};
