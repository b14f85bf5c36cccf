//! The delivery collaborator: sending a rendered message to a subscriber.
//!
//! Each [`DeliveryMethod`] maps to one independently pluggable
//! [`DeliveryChannel`] in a [`ChannelRegistry`]. A method without a registered
//! channel fails with [`DeliveryError::Unsupported`]; other methods are not
//! affected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{DeliveryMethod, SubscriberId};

pub mod log;

pub use log::LogChannel;

/// Errors from a delivery channel.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no channel registered for {0}")]
    Unsupported(DeliveryMethod),

    /// The channel accepted the call but refused the message.
    #[error("{method} rejected: {reason}")]
    Rejected {
        method: DeliveryMethod,
        reason: String,
    },

    /// The channel could not be reached.
    #[error("{method} transport failed: {reason}")]
    Transport {
        method: DeliveryMethod,
        reason: String,
    },
}

/// A rendered message ready for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub subject: String,
    pub body: String,
    pub method: DeliveryMethod,
    /// Always true for digests; channels may skip user-facing signatures.
    pub system_generated: bool,
}

/// Sends messages over one delivery method.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(
        &self,
        recipient: SubscriberId,
        message: &OutgoingMessage,
    ) -> Result<(), DeliveryError>;
}

/// The set of channels available to the Callback Handler.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<DeliveryMethod, Arc<dyn DeliveryChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel` for `method`, replacing any previous one.
    pub fn with(mut self, method: DeliveryMethod, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.channels.insert(method, channel);
        self
    }

    /// Registers the same channel for every method.
    pub fn uniform(channel: Arc<dyn DeliveryChannel>) -> Self {
        DeliveryMethod::ALL
            .into_iter()
            .fold(Self::new(), |registry, method| {
                registry.with(method, Arc::clone(&channel))
            })
    }

    /// Sends `message` over the channel registered for its method.
    pub async fn send(
        &self,
        recipient: SubscriberId,
        message: &OutgoingMessage,
    ) -> Result<(), DeliveryError> {
        let channel = self
            .channels
            .get(&message.method)
            .ok_or(DeliveryError::Unsupported(message.method))?;
        channel.send(recipient, message).await
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.channels.keys().collect();
        methods.sort();
        f.debug_struct("ChannelRegistry")
            .field("methods", &methods)
            .finish()
    }
}
