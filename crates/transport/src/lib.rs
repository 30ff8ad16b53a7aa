//! Generic transport abstraction for exchange messages
//!
//! This crate provides a transport-agnostic interface for member-to-member
//! communication. Implementations are provided in separate crates.
//!
//! Transports handle:
//! - Addressed delivery of opaque payloads
//! - FIFO ordering per sender/recipient pair
//! - Surfacing incoming envelopes as a stream

pub mod error;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use cachex_topology::NodeId;
use futures::Stream;

pub use error::TransportError;

/// Transport-level message envelope
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    /// Message type tag chosen by the sender
    pub message_type: String,
    /// Encoded message payload
    pub payload: Bytes,
    /// The sender of the message
    pub sender: NodeId,
}

/// Transport trait for sending and receiving messages
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a payload to a specific node.
    ///
    /// Envelopes sent to the same recipient are delivered in send order.
    async fn send_envelope(
        &self,
        recipient: &NodeId,
        payload: &Bytes,
        message_type: &str,
    ) -> Result<(), TransportError>;

    /// Stream of incoming envelopes.
    ///
    /// May be taken only once per transport; later calls return an empty
    /// stream.
    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>>;

    /// Shutdown the transport
    async fn shutdown(&self) -> Result<(), TransportError>;
}

/// Configuration for transports
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum message size in bytes
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024, // 10MB
        }
    }
}
