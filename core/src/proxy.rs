//! Per-observer subscription to a running request.
//!
//! Each caller that wants to watch a request gets its own [`ResultProxy`]. The
//! dispatch client keeps the matching [`ObserverHandle`] and pushes every event
//! of the request into it. Proxies never share channels, so a slow or
//! abandoned proxy only affects itself.
//!
//! # Consuming a proxy
//!
//! ```ignore
//! while let Some(event) = proxy.next_event().await {
//!     match event {
//!         ProxyEvent::Result(status) => send_frame(status).await?,
//!         ProxyEvent::Error(err) => send_error(err).await?,
//!         ProxyEvent::Done(completion) => tracing::info!(?completion, "request finished"),
//!     }
//! }
//! ```

use crate::request::{RequestId, StreamEvent};
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Why an observer stopped receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCompletion {
    /// The request terminated and every event was delivered.
    Finished,
    /// The observer fell behind and was dropped by the delivery policy.
    ///
    /// Events after the eviction point were not delivered; the request itself
    /// keeps running for other observers.
    Evicted,
    /// The request produced no events for longer than the configured stall
    /// timeout and was abandoned.
    Stalled,
}

impl ProxyCompletion {
    /// Whether the observer saw the complete stream.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// One event observed through a [`ResultProxy`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent<T, E> {
    /// A result produced by the request.
    Result(T),
    /// A stream-level error produced by the request.
    Error(E),
    /// No further events will arrive.
    Done(ProxyCompletion),
}

/// Outcome of pushing one event into an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The event is queued for the consumer.
    Delivered,
    /// The consumer's queue is full.
    Full,
    /// The consumer dropped its proxy.
    Closed,
}

impl<T, E> From<StreamEvent<T, E>> for ProxyEvent<T, E> {
    fn from(event: StreamEvent<T, E>) -> Self {
        match event {
            StreamEvent::Result(result) => Self::Result(result),
            StreamEvent::Error(error) => Self::Error(error),
        }
    }
}

/// Consumer side of a subscription to one request.
///
/// Results and errors arrive on one queue in the order the request emitted
/// them. [`ResultProxy::next_event`] yields them in that order and reports
/// `Done` only once the queue is drained and closed.
/// [`ResultProxy::recv_result`] and [`ResultProxy::recv_error`] are filtered
/// views; events they skip stay queued for the other view and for
/// `next_event`.
#[derive(Debug)]
pub struct ResultProxy<T, E> {
    request_id: RequestId,
    events: mpsc::Receiver<StreamEvent<T, E>>,
    skipped: VecDeque<StreamEvent<T, E>>,
    done: oneshot::Receiver<ProxyCompletion>,
    events_open: bool,
    completion: Option<ProxyCompletion>,
    terminated: bool,
}

impl<T, E> ResultProxy<T, E> {
    /// Create a proxy and the handle used to feed it.
    ///
    /// `capacity` bounds the event queue; it is clamped to at least 1.
    #[must_use]
    pub fn channel(request_id: RequestId, capacity: usize) -> (ObserverHandle<T, E>, Self) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();

        let handle = ObserverHandle {
            request_id,
            events: events_tx,
            done: Mutex::new(Some(done_tx)),
        };
        let proxy = Self {
            request_id,
            events: events_rx,
            skipped: VecDeque::new(),
            done: done_rx,
            events_open: true,
            completion: None,
            terminated: false,
        };

        (handle, proxy)
    }

    /// Identifier of the observed request.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Receive the next result, or `None` once the queue is closed.
    ///
    /// Errors queued ahead of it are kept for [`ResultProxy::recv_error`] and
    /// [`ResultProxy::next_event`].
    pub async fn recv_result(&mut self) -> Option<T> {
        if let Some(at) = self
            .skipped
            .iter()
            .position(|event| matches!(event, StreamEvent::Result(_)))
        {
            if let Some(StreamEvent::Result(result)) = self.skipped.remove(at) {
                return Some(result);
            }
        }
        loop {
            match self.recv_queued().await? {
                StreamEvent::Result(result) => return Some(result),
                error @ StreamEvent::Error(_) => self.skipped.push_back(error),
            }
        }
    }

    /// Receive the next error, or `None` once the queue is closed.
    ///
    /// Results queued ahead of it are kept for [`ResultProxy::recv_result`]
    /// and [`ResultProxy::next_event`].
    pub async fn recv_error(&mut self) -> Option<E> {
        if let Some(at) = self
            .skipped
            .iter()
            .position(|event| matches!(event, StreamEvent::Error(_)))
        {
            if let Some(StreamEvent::Error(error)) = self.skipped.remove(at) {
                return Some(error);
            }
        }
        loop {
            match self.recv_queued().await? {
                StreamEvent::Error(error) => return Some(error),
                result @ StreamEvent::Result(_) => self.skipped.push_back(result),
            }
        }
    }

    async fn recv_queued(&mut self) -> Option<StreamEvent<T, E>> {
        if !self.events_open {
            return None;
        }
        let event = self.events.recv().await;
        if event.is_none() {
            self.events_open = false;
        }
        event
    }

    /// Wait for the done signal.
    ///
    /// This does not drain the event queue; queued events stay readable after
    /// it returns. A handle dropped without completing counts as
    /// [`ProxyCompletion::Finished`].
    pub async fn done(&mut self) -> ProxyCompletion {
        if let Some(completion) = self.completion {
            return completion;
        }
        let completion = (&mut self.done).await.unwrap_or(ProxyCompletion::Finished);
        self.completion = Some(completion);
        completion
    }

    /// Next event, in the order the request emitted it.
    ///
    /// `Done` is only reported after the queue has closed. Returns `None`
    /// after `Done` has been yielded.
    pub async fn next_event(&mut self) -> Option<ProxyEvent<T, E>> {
        if self.terminated {
            return None;
        }
        if let Some(event) = self.skipped.pop_front() {
            return Some(event.into());
        }

        loop {
            tokio::select! {
                biased;

                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => return Some(event.into()),
                    None => self.events_open = false,
                },

                completion = &mut self.done, if self.completion.is_none() => {
                    self.completion = Some(completion.unwrap_or(ProxyCompletion::Finished));
                },

                else => {
                    self.terminated = true;
                    return Some(ProxyEvent::Done(
                        self.completion.unwrap_or(ProxyCompletion::Finished),
                    ));
                }
            }
        }
    }

    /// Convert into a [`Stream`] of events ending with `Done`.
    pub fn into_stream(mut self) -> impl Stream<Item = ProxyEvent<T, E>> {
        async_stream::stream! {
            while let Some(event) = self.next_event().await {
                yield event;
            }
        }
    }

    /// Drain the proxy to completion, splitting results and errors.
    pub async fn collect(mut self) -> (Vec<T>, Vec<E>, ProxyCompletion) {
        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut completion = ProxyCompletion::Finished;

        while let Some(event) = self.next_event().await {
            match event {
                ProxyEvent::Result(result) => results.push(result),
                ProxyEvent::Error(error) => errors.push(error),
                ProxyEvent::Done(c) => completion = c,
            }
        }

        (results, errors, completion)
    }
}

/// Producer side of a [`ResultProxy`], held by the dispatch client.
///
/// Dropping the last handle closes the proxy's event queue.
#[derive(Debug)]
pub struct ObserverHandle<T, E> {
    request_id: RequestId,
    events: mpsc::Sender<StreamEvent<T, E>>,
    done: Mutex<Option<oneshot::Sender<ProxyCompletion>>>,
}

impl<T, E> ObserverHandle<T, E> {
    /// Identifier of the observed request.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Whether the consumer dropped its proxy.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Queue an event without waiting.
    pub fn try_deliver(&self, event: StreamEvent<T, E>) -> Delivery {
        match self.events.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queue an event, waiting at most `timeout` for space.
    pub async fn deliver_timeout(&self, event: StreamEvent<T, E>, timeout: Duration) -> Delivery {
        match self.events.send_timeout(event, timeout).await {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Delivery::Full,
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Fire the done signal. Only the first call has an effect.
    pub fn complete(&self, completion: ProxyCompletion) {
        let sender = self
            .done
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(completion);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn result(value: u32) -> StreamEvent<u32, String> {
        StreamEvent::Result(value)
    }

    fn error(message: &str) -> StreamEvent<u32, String> {
        StreamEvent::Error(message.to_string())
    }

    #[tokio::test]
    async fn test_next_event_keeps_emission_order() {
        let (handle, mut proxy) = ResultProxy::<u32, String>::channel(RequestId::new(), 8);

        assert_eq!(handle.try_deliver(result(1)), Delivery::Delivered);
        assert_eq!(handle.try_deliver(error("e")), Delivery::Delivered);
        assert_eq!(handle.try_deliver(result(2)), Delivery::Delivered);
        handle.complete(ProxyCompletion::Finished);
        drop(handle);

        assert_eq!(proxy.next_event().await, Some(ProxyEvent::Result(1)));
        assert_eq!(proxy.next_event().await, Some(ProxyEvent::Error("e".into())));
        assert_eq!(proxy.next_event().await, Some(ProxyEvent::Result(2)));
        assert_eq!(
            proxy.next_event().await,
            Some(ProxyEvent::Done(ProxyCompletion::Finished))
        );
        assert_eq!(proxy.next_event().await, None);
    }

    #[tokio::test]
    async fn test_filtered_views_keep_skipped_events() {
        let (handle, mut proxy) = ResultProxy::<u32, String>::channel(RequestId::new(), 8);
        handle.try_deliver(error("first"));
        handle.try_deliver(result(1));
        handle.try_deliver(error("second"));
        handle.try_deliver(result(2));
        drop(handle);

        assert_eq!(proxy.recv_result().await, Some(1));
        assert_eq!(proxy.recv_error().await, Some("first".into()));
        // The remaining error and result come back in emission order.
        assert_eq!(proxy.next_event().await, Some(ProxyEvent::Error("second".into())));
        assert_eq!(proxy.recv_result().await, Some(2));
        assert_eq!(proxy.recv_result().await, None);
        assert_eq!(
            proxy.next_event().await,
            Some(ProxyEvent::Done(ProxyCompletion::Finished))
        );
    }

    #[tokio::test]
    async fn test_full_queue_reports_full() {
        let (handle, _proxy) = ResultProxy::<u32, String>::channel(RequestId::new(), 1);

        assert_eq!(handle.try_deliver(result(1)), Delivery::Delivered);
        assert_eq!(handle.try_deliver(error("e")), Delivery::Full);
        assert_eq!(
            handle
                .deliver_timeout(result(3), Duration::from_millis(10))
                .await,
            Delivery::Full
        );
    }

    #[tokio::test]
    async fn test_dropped_proxy_reports_closed() {
        let (handle, proxy) = ResultProxy::<u32, String>::channel(RequestId::new(), 4);
        drop(proxy);

        assert!(handle.is_closed());
        assert_eq!(handle.try_deliver(result(1)), Delivery::Closed);
        assert_eq!(handle.try_deliver(error("e")), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_complete_only_once() {
        let (handle, mut proxy) = ResultProxy::<u32, String>::channel(RequestId::new(), 4);
        handle.complete(ProxyCompletion::Evicted);
        handle.complete(ProxyCompletion::Finished);

        assert_eq!(proxy.done().await, ProxyCompletion::Evicted);
        // Cached after the first wait.
        assert_eq!(proxy.done().await, ProxyCompletion::Evicted);
    }

    #[tokio::test]
    async fn test_stream_ends_with_done() {
        let (handle, proxy) = ResultProxy::<u32, String>::channel(RequestId::new(), 4);
        handle.try_deliver(result(5));
        handle.complete(ProxyCompletion::Stalled);
        drop(handle);

        let events: Vec<_> = proxy.into_stream().collect().await;
        assert_eq!(
            events,
            vec![
                ProxyEvent::Result(5),
                ProxyEvent::Done(ProxyCompletion::Stalled)
            ]
        );
    }

    #[tokio::test]
    async fn test_collect_splits_events() {
        let (handle, proxy) = ResultProxy::<u32, String>::channel(RequestId::new(), 4);
        handle.try_deliver(result(1));
        handle.try_deliver(error("x"));
        handle.complete(ProxyCompletion::Finished);
        drop(handle);

        let (results, errors, completion) = proxy.collect().await;
        assert_eq!(results, vec![1]);
        assert_eq!(errors, vec!["x".to_string()]);
        assert!(completion.is_finished());
    }
}
