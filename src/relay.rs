//! Text-message relay between online users.
//!
//! A delivery status for a given `message_id` is pushed to the sender
//! asynchronously *and* returned as the synchronous reply; clients
//! deduplicate by `message_id`. Message bodies are never persisted or
//! logged.

use tracing::{debug, warn};

use crate::connection::PeerLink;
use crate::records::{DeliveryStatus, ServerRecord};
use crate::server::Server;

impl Server {
    pub(crate) async fn relay_message(
        &self,
        sender: &str,
        sender_link: &dyn PeerLink,
        to: String,
        message: String,
        message_id: String,
        timestamp: f64,
    ) -> ServerRecord {
        let Some(target) = self.presence.link_of(&to) else {
            debug!(from = %sender, %to, %message_id, "receiver offline");
            let status = ServerRecord::MessageStatus {
                status: DeliveryStatus::UserOffline,
                message_id,
                details: Some(format!("user {to} is offline")),
            };
            let _ = sender_link.deliver(status.clone()).await;
            return status;
        };

        let forward = ServerRecord::P2pMessage {
            from: sender.to_string(),
            message,
            message_id: message_id.clone(),
            timestamp,
        };
        match target.deliver(forward).await {
            Ok(()) => {
                debug!(from = %sender, %to, %message_id, "relayed");
                let status = ServerRecord::MessageStatus {
                    status: DeliveryStatus::Delivered,
                    message_id,
                    details: None,
                };
                let _ = sender_link.deliver(status.clone()).await;
                status
            }
            Err(err) => {
                // the receiver's connection is broken; evict it so the
                // roster stops advertising a dead peer
                warn!(receiver = %to, error = %err, "delivery failed, evicting receiver");
                self.evict(&to).await;
                let status = ServerRecord::MessageStatus {
                    status: DeliveryStatus::Failed,
                    message_id,
                    details: Some(format!("delivery to {to} failed")),
                };
                let _ = sender_link.deliver(status.clone()).await;
                status
            }
        }
    }
}
