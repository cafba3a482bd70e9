//! JSON message protocol of one solution websocket connection.
//!
//! Inbound messages carry an `id`, a `type` and the request body inline:
//!
//! ```json
//! {"id": "7", "type": "CREATE_SOLUTIONS", "dataset": "baseball", "targetFeature": "hits"}
//! {"id": "8", "type": "STOP_SOLUTIONS", "requestId": "1b4e28ba-2fa1-11d2-883f-0016d3cca427"}
//! ```
//!
//! Every outbound [`ServerFrame`] echoes the message `id` and `type`. A search
//! answers with one success frame per solution status, an error frame per
//! stream error, and a final frame with `complete: true`.
//!
//! Transport is left to the caller: feed raw message bytes to
//! [`SolutionSession::handle_message`] and write out whatever arrives on the
//! sink.

use crate::search::{SearchCoordinator, Subscription};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use solution_dispatch_core::{
    ComputeService, ProxyCompletion, ProxyEvent, SolutionSearchRequest, StopSolutionSearchRequest,
};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

/// Kinds of inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Start (or join) a solution search
    CreateSolutions,
    /// Stop a running search
    StopSolutions,
}

impl MessageType {
    /// Wire name of the message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateSolutions => "CREATE_SOLUTIONS",
            Self::StopSolutions => "STOP_SOLUTIONS",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE_SOLUTIONS" => Ok(Self::CreateSolutions),
            "STOP_SOLUTIONS" => Ok(Self::StopSolutions),
            other => Err(format!("unrecognized message type: {other}")),
        }
    }
}

/// An inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Client-chosen correlation id
    pub id: String,
    /// Raw message type
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining fields, parsed according to `kind`
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl ClientMessage {
    /// Parse a raw message.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the bytes are not a message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The parsed message type.
    ///
    /// # Errors
    ///
    /// Returns a description of the unknown type.
    pub fn message_type(&self) -> Result<MessageType, String> {
        self.kind.parse()
    }

    fn body_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.body.clone()))
    }
}

/// An outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    /// Id of the message being answered; absent if it could not be parsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Type of the message being answered
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Whether this frame reports success
    pub success: bool,
    /// Payload of a success frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Message of an error frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on the last frame for a message
    #[serde(default)]
    pub complete: bool,
}

impl ServerFrame {
    /// A success frame carrying `body`.
    #[must_use]
    pub fn success(message: &ClientMessage, body: serde_json::Value) -> Self {
        Self {
            id: Some(message.id.clone()),
            kind: Some(message.kind.clone()),
            success: true,
            body: Some(body),
            error: None,
            complete: false,
        }
    }

    /// An error frame; `message` is `None` when the input could not be parsed.
    #[must_use]
    pub fn error(message: Option<&ClientMessage>, error: impl fmt::Display) -> Self {
        Self {
            id: message.map(|m| m.id.clone()),
            kind: message.map(|m| m.kind.clone()),
            success: false,
            body: None,
            error: Some(error.to_string()),
            complete: false,
        }
    }

    /// The final frame for a message.
    #[must_use]
    pub fn complete(message: &ClientMessage) -> Self {
        Self {
            id: Some(message.id.clone()),
            kind: Some(message.kind.clone()),
            success: true,
            body: None,
            error: None,
            complete: true,
        }
    }
}

/// Handles the messages of one websocket connection.
pub struct SolutionSession<S> {
    coordinator: SearchCoordinator<S>,
}

impl<S> Clone for SolutionSession<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<S: ComputeService> SolutionSession<S> {
    /// Create a session backed by a shared coordinator.
    #[must_use]
    pub const fn new(coordinator: SearchCoordinator<S>) -> Self {
        Self { coordinator }
    }

    /// The coordinator behind this session.
    #[must_use]
    pub const fn coordinator(&self) -> &SearchCoordinator<S> {
        &self.coordinator
    }

    /// Handle one raw message, writing every answer frame to `sink`.
    ///
    /// Returns once the message is fully answered or the sink is closed.
    /// Searches can run for a long time, so transports usually spawn this per
    /// message.
    pub async fn handle_message(&self, bytes: &[u8], sink: &mpsc::Sender<ServerFrame>) {
        let message = match ClientMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "Unable to parse solution message");
                let _ = sink
                    .send(ServerFrame::error(
                        None,
                        format!(
                            "unable to parse solution request message: {}",
                            String::from_utf8_lossy(bytes)
                        ),
                    ))
                    .await;
                return;
            }
        };

        match message.message_type() {
            Ok(MessageType::CreateSolutions) => self.create_solutions(&message, sink).await,
            Ok(MessageType::StopSolutions) => self.stop_solutions(&message, sink).await,
            Err(err) => {
                tracing::warn!(id = %message.id, kind = %message.kind, "Unknown message type");
                let _ = sink.send(ServerFrame::error(Some(&message), err)).await;
            }
        }
    }

    #[tracing::instrument(skip_all, fields(id = %message.id))]
    async fn create_solutions(&self, message: &ClientMessage, sink: &mpsc::Sender<ServerFrame>) {
        let request: SolutionSearchRequest = match message.body_as() {
            Ok(request) => request,
            Err(err) => {
                let _ = sink.send(ServerFrame::error(Some(message), err)).await;
                return;
            }
        };

        match self.coordinator.start_or_attach(&request).await {
            Ok(subscription) => relay(message, subscription, sink).await,
            Err(err) => {
                let _ = sink.send(ServerFrame::error(Some(message), err)).await;
            }
        }
    }

    #[tracing::instrument(skip_all, fields(id = %message.id))]
    async fn stop_solutions(&self, message: &ClientMessage, sink: &mpsc::Sender<ServerFrame>) {
        let request: StopSolutionSearchRequest = match message.body_as() {
            Ok(request) => request,
            Err(err) => {
                let _ = sink.send(ServerFrame::error(Some(message), err)).await;
                return;
            }
        };

        match self.coordinator.stop(&request).await {
            Ok(subscription) => relay(message, subscription, sink).await,
            Err(err) => {
                let _ = sink.send(ServerFrame::error(Some(message), err)).await;
            }
        }
    }
}

/// Turn every event of a subscription into frames.
async fn relay(message: &ClientMessage, subscription: Subscription, sink: &mpsc::Sender<ServerFrame>) {
    let request_id = subscription.request_id();
    let mut events = std::pin::pin!(subscription.into_events());

    while let Some(event) = events.next().await {
        let frame = match event {
            ProxyEvent::Result(status) => match serde_json::to_value(&status) {
                Ok(body) => ServerFrame::success(message, body),
                Err(err) => ServerFrame::error(Some(message), err),
            },
            ProxyEvent::Error(error) => ServerFrame::error(Some(message), error),
            ProxyEvent::Done(completion) => {
                if let Some(reason) = early_end_reason(completion) {
                    if sink
                        .send(ServerFrame::error(Some(message), reason))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                ServerFrame::complete(message)
            }
        };

        if sink.send(frame).await.is_err() {
            tracing::debug!(%request_id, "Session sink closed, stopping relay");
            return;
        }
    }
}

/// Error text for a subscription that ended before its search did.
const fn early_end_reason(completion: ProxyCompletion) -> Option<&'static str> {
    match completion {
        ProxyCompletion::Finished => None,
        ProxyCompletion::Evicted => Some("connection fell behind the solution stream"),
        ProxyCompletion::Stalled => Some("solution search stopped responding"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_keeps_body_inline() {
        let message = ClientMessage::from_bytes(
            br#"{"id":"1","type":"CREATE_SOLUTIONS","dataset":"baseball","targetFeature":"hits"}"#,
        )
        .unwrap();

        assert_eq!(message.id, "1");
        assert_eq!(message.message_type(), Ok(MessageType::CreateSolutions));

        let request: SolutionSearchRequest = message.body_as().unwrap();
        assert_eq!(request.dataset, "baseball");
        assert_eq!(request.target_feature, "hits");
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let message = ClientMessage::from_bytes(br#"{"id":"2","type":"FLY"}"#).unwrap();
        assert_eq!(
            message.message_type(),
            Err("unrecognized message type: FLY".to_string())
        );
    }

    #[test]
    fn test_only_unfinished_subscriptions_report_an_error() {
        assert_eq!(early_end_reason(ProxyCompletion::Finished), None);
        assert_eq!(
            early_end_reason(ProxyCompletion::Stalled),
            Some("solution search stopped responding")
        );
        assert_eq!(
            early_end_reason(ProxyCompletion::Evicted),
            Some("connection fell behind the solution stream")
        );
    }

    #[test]
    fn test_frames_serialize_compactly() {
        let message = ClientMessage::from_bytes(br#"{"id":"3","type":"STOP_SOLUTIONS"}"#).unwrap();

        let complete = serde_json::to_value(ServerFrame::complete(&message)).unwrap();
        assert_eq!(
            complete,
            serde_json::json!({"id": "3", "type": "STOP_SOLUTIONS", "success": true, "complete": true})
        );

        let parse_error = serde_json::to_value(ServerFrame::error(None, "bad")).unwrap();
        assert_eq!(
            parse_error,
            serde_json::json!({"success": false, "error": "bad", "complete": false})
        );
    }
}
