// Inbound frame handling for a ready session: applies sync and awareness
// messages and fans the results out to the session's connections.

use docsync_common::protocol::{encode_awareness, encode_sync, InboundFrame};
use tokio::time::Instant;
use tracing::{debug, warn};
use yrs::sync::SyncMessage;

use super::{ConnectionId, DocumentSession, SessionEvent};
use crate::error::SessionError;
use crate::metrics;

impl DocumentSession {
    /// Apply one inbound frame from `connection`.
    ///
    /// Malformed or unappliable frames are logged, reported as a
    /// `FrameRejected` event and returned as an error; the caller keeps the
    /// connection open. Unknown tags and client-sent saved notices are
    /// ignored.
    pub async fn handle_frame(
        &self,
        connection: ConnectionId,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        let result = match InboundFrame::decode(payload) {
            Ok(InboundFrame::Sync(message)) => self.handle_sync(connection, message).await,
            Ok(InboundFrame::Awareness(update)) => {
                self.handle_awareness(connection, update).await
            }
            Ok(InboundFrame::Saved) => {
                debug!(doc = %self.name, connection, "ignoring saved notice sent by client");
                Ok(())
            }
            Ok(InboundFrame::Unknown(tag)) => {
                debug!(doc = %self.name, connection, tag, "ignoring frame with unknown tag");
                Ok(())
            }
            Err(err) => Err(SessionError::Decode(err)),
        };

        if let Err(err) = &result {
            warn!(doc = %self.name, connection, error = %err, "rejected inbound frame");
            metrics::increment_frame_errors();
            self.emit(SessionEvent::FrameRejected { connection, error: err.to_string() });
        }
        result
    }

    async fn handle_sync(
        &self,
        connection: ConnectionId,
        message: SyncMessage,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        let outcome = state.replica.apply_sync(message).map_err(SessionError::Apply)?;

        if let Some(reply) = outcome.reply {
            state.connections.send_to(connection, encode_sync(reply));
        }

        let Some(update) = outcome.update else {
            return Ok(());
        };
        // Step-2 payloads are fanned out as regular updates.
        let delivered = state.connections.broadcast(&encode_sync(SyncMessage::Update(update)));
        state.last_mutation = Some(Instant::now());
        drop(state);

        debug!(doc = %self.name, connection, delivered, "relayed document update");
        self.scheduler.kick();
        Ok(())
    }

    async fn handle_awareness(
        &self,
        connection: ConnectionId,
        update: yrs::sync::AwarenessUpdate,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        let change = state.awareness.apply(update).map_err(SessionError::Apply)?;
        if change.is_empty() {
            return Ok(());
        }

        state.connections.claim(connection, &change.added);
        state.connections.release_ids(connection, &change.removed);

        let rebroadcast =
            state.awareness.encode_clients(change.all()).map_err(SessionError::Apply)?;
        state.connections.broadcast(&encode_awareness(rebroadcast));
        Ok(())
    }
}
