//! A delivery channel that writes messages to the log.

use async_trait::async_trait;
use tracing::info;

use super::{DeliveryChannel, DeliveryError, OutgoingMessage};
use crate::types::SubscriberId;

/// Logs every message at `info` instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    async fn send(
        &self,
        recipient: SubscriberId,
        message: &OutgoingMessage,
    ) -> Result<(), DeliveryError> {
        info!(
            recipient = %recipient,
            method = %message.method,
            subject = %message.subject,
            system_generated = message.system_generated,
            body = %message.body,
            "delivering notification"
        );
        Ok(())
    }
}
