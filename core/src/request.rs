//! Request identity, deduplication fingerprints, and the producer/consumer
//! halves of a single call to the compute service.
//!
//! A call is represented by two halves created together:
//!
//! - [`RequestContext`] is handed to the dispatch client, which drains its
//!   ordered event queue and its `done` signal in a forwarding routine.
//! - [`RequestProducer`] stays with whatever pumps the remote stream and is the
//!   only way to feed that context.
//!
//! # Example
//!
//! ```
//! use solution_dispatch_core::request::{RequestContext, RequestHash};
//!
//! # async fn example() {
//! let (ctx, producer) = RequestContext::<u32, String>::channel(RequestHash::of(&"q"), 8);
//! let id = ctx.request_id();
//!
//! tokio::spawn(async move {
//!     let _ = producer.send_result(1).await;
//!     producer.finish();
//! });
//! # let _ = id;
//! # }
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Error type for `RequestId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid request ID: {0}")]
pub struct ParseRequestIdError(String);

/// Globally unique identifier of one dispatched request.
///
/// Assigned when the [`RequestContext`] is created and never changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero identifier.
    ///
    /// Only used where a wire format needs a placeholder; never assigned to a
    /// dispatched request.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Whether this is the placeholder identifier.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Borrow the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ParseRequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ParseRequestIdError(format!("{s}: {e}")))
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Value-equality fingerprint of a request's semantic parameters.
///
/// Two requests with the same hash are treated as the same logical
/// computation. The hash is only used to find attachable requests; identity is
/// always the [`RequestId`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestHash(String);

impl RequestHash {
    /// Fingerprint any serializable value.
    ///
    /// The value is first converted to a `serde_json::Value`, whose maps are
    /// ordered by key, so struct field order and map insertion order never
    /// change the digest. Sequences keep their order; callers that treat a
    /// list as a set must sort it first.
    ///
    /// A value that cannot be represented as JSON (for example a map with
    /// non-string keys) hashes the serializer's error message instead.
    #[must_use]
    pub fn of<V: Serialize + ?Sized>(value: &V) -> Self {
        let canonical = serde_json::to_value(value)
            .map(|v| v.to_string())
            .unwrap_or_else(|e| format!("unserializable:{e}"));
        Self::from_bytes(canonical.as_bytes())
    }

    /// Fingerprint raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A caller-supplied description of a request, comparable by value.
///
/// Implementations must be pure: the same semantic parameters always yield
/// the same hash, independent of field or collection ordering that does not
/// carry meaning.
pub trait RequestDescriptor {
    /// Fingerprint used to detect duplicate in-flight requests.
    fn request_hash(&self) -> RequestHash;
}

impl RequestDescriptor for RequestHash {
    fn request_hash(&self) -> RequestHash {
        self.clone()
    }
}

/// One event emitted by a call, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent<T, E> {
    /// A result.
    Result(T),
    /// A stream-level error; the call keeps running.
    Error(E),
}

/// Consumer half of one call to the compute service.
///
/// Owned by the dispatch client once dispatched. Results and errors share one
/// bounded queue, so they are read back in exactly the order they were sent;
/// `done` fires exactly once when the producer finishes or is dropped.
#[derive(Debug)]
pub struct RequestContext<T, E> {
    request_id: RequestId,
    request_hash: RequestHash,
    events: mpsc::Receiver<StreamEvent<T, E>>,
    done: oneshot::Receiver<()>,
}

/// The receivers of a [`RequestContext`], split out for draining.
#[derive(Debug)]
pub struct RequestChannels<T, E> {
    /// Results and errors, in the order the call emitted them.
    pub events: mpsc::Receiver<StreamEvent<T, E>>,
    /// Fires (or closes) once the call has terminated.
    ///
    /// Everything sent before it is already queued on `events`.
    pub done: oneshot::Receiver<()>,
}

impl<T, E> RequestContext<T, E> {
    /// Create a context and the producer that feeds it.
    ///
    /// A new [`RequestId`] is allocated. `capacity` bounds how many events may
    /// be queued before the producer is back-pressured; it is clamped to at
    /// least 1.
    #[must_use]
    pub fn channel(request_hash: RequestHash, capacity: usize) -> (Self, RequestProducer<T, E>) {
        Self::channel_with_id(RequestId::new(), request_hash, capacity)
    }

    /// Like [`RequestContext::channel`] but with a caller-chosen identifier.
    ///
    /// Useful when the remote service hands out the identifier itself.
    #[must_use]
    pub fn channel_with_id(
        request_id: RequestId,
        request_hash: RequestHash,
        capacity: usize,
    ) -> (Self, RequestProducer<T, E>) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();

        let context = Self {
            request_id,
            request_hash,
            events: events_rx,
            done: done_rx,
        };
        let producer = RequestProducer {
            request_id,
            events: events_tx,
            done: done_tx,
        };

        (context, producer)
    }

    /// Identifier of this request.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Deduplication fingerprint of this request.
    #[must_use]
    pub const fn request_hash(&self) -> &RequestHash {
        &self.request_hash
    }

    /// Split into identity and channels.
    #[must_use]
    pub fn into_parts(self) -> (RequestId, RequestHash, RequestChannels<T, E>) {
        (
            self.request_id,
            self.request_hash,
            RequestChannels {
                events: self.events,
                done: self.done,
            },
        )
    }
}

/// Error returned when the consumer half of a request has gone away.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("request {0} is no longer being consumed")]
pub struct ProducerClosed(pub RequestId);

/// Producer half of one call to the compute service.
///
/// Held by the task that pumps the remote stream. Dropping it without calling
/// [`RequestProducer::finish`] still terminates the request.
#[derive(Debug)]
pub struct RequestProducer<T, E> {
    request_id: RequestId,
    events: mpsc::Sender<StreamEvent<T, E>>,
    done: oneshot::Sender<()>,
}

impl<T, E> RequestProducer<T, E> {
    /// Identifier of the request being produced.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Emit a result, waiting if the consumer is behind.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerClosed`] if the consumer half was dropped.
    pub async fn send_result(&self, result: T) -> Result<(), ProducerClosed> {
        self.send(StreamEvent::Result(result)).await
    }

    /// Emit a stream-level error, waiting if the consumer is behind.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerClosed`] if the consumer half was dropped.
    pub async fn send_error(&self, error: E) -> Result<(), ProducerClosed> {
        self.send(StreamEvent::Error(error)).await
    }

    async fn send(&self, event: StreamEvent<T, E>) -> Result<(), ProducerClosed> {
        self.events
            .send(event)
            .await
            .map_err(|_| ProducerClosed(self.request_id))
    }

    /// Whether the consumer half has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Signal that the call has terminated.
    ///
    /// Everything sent before this call is still delivered.
    pub fn finish(self) {
        let _ = self.done.send(());
    }
}
