//! Per-request forwarding routine.
//!
//! One routine runs for every dispatched request. It moves through three
//! phases:
//!
//! - **Pending**: wait on the event queue and done. Events are taken in the
//!   order the call emitted them. Results are appended to the request's buffer
//!   and sent to every observer whose snapshot does not already contain them;
//!   errors go to every current observer.
//! - **Completing**: done fired, so forward whatever is still queued.
//! - **Completed**: move the request to the completed set, take its observer
//!   list and complete every observer.
//!
//! Observers that are full (per [`OverflowPolicy`]) or gone are removed
//! between events; the routine never blocks on one observer for longer than
//! the policy allows.

use crate::client::{Inner, Observer};
use crate::config::OverflowPolicy;
use crate::metrics::{ForwardingMetrics, RequestMetrics};
use solution_dispatch_core::{
    Delivery, ObserverHandle, ProxyCompletion, RequestChannels, RequestId, StreamEvent,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub(crate) async fn forward<S, T, E>(
    inner: Arc<Inner<S, T, E>>,
    request_id: RequestId,
    channels: RequestChannels<T, E>,
) where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let RequestChannels {
        mut events,
        mut done,
    } = channels;
    let mut events_open = true;
    let stall_timeout = inner.config.stall_timeout;

    let completion = loop {
        tokio::select! {
            biased;

            event = events.recv(), if events_open => match event {
                Some(event) => forward_event(&inner, request_id, event).await,
                None => events_open = false,
            },

            // A producer dropped without finishing also lands here.
            _ = &mut done => break ProxyCompletion::Finished,

            () = idle(stall_timeout) => break ProxyCompletion::Stalled,
        }
    };

    if completion.is_finished() {
        while let Ok(event) = events.try_recv() {
            forward_event(&inner, request_id, event).await;
        }
    }
    drop((events, done));

    complete(&inner, request_id, completion);
}

async fn forward_event<S, T, E>(
    inner: &Inner<S, T, E>,
    request_id: RequestId,
    event: StreamEvent<T, E>,
) where
    T: Clone,
    E: Clone,
{
    match event {
        StreamEvent::Result(result) => forward_result(inner, request_id, result).await,
        StreamEvent::Error(error) => forward_error(inner, request_id, error).await,
    }
}

/// Resolves after `timeout` without events, or never when unset.
async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn forward_result<S, T, E>(inner: &Inner<S, T, E>, request_id: RequestId, result: T)
where
    T: Clone,
    E: Clone,
{
    ForwardingMetrics::record_result();

    let index = {
        let mut registry = inner.lock_registry();
        let buffer = registry.buffers.entry(request_id).or_default();
        buffer.push(result.clone());
        buffer.len() - 1
    };

    let observers: Vec<_> = inner
        .observers(request_id)
        .into_iter()
        .filter(|observer| observer.start_index <= index)
        .collect();

    tracing::debug!(%request_id, index, observers = observers.len(), "Forwarding result");
    broadcast(inner, request_id, &observers, &StreamEvent::Result(result)).await;
}

async fn forward_error<S, T, E>(inner: &Inner<S, T, E>, request_id: RequestId, error: E)
where
    T: Clone,
    E: Clone,
{
    ForwardingMetrics::record_error();

    let observers = inner.observers(request_id);

    tracing::debug!(%request_id, observers = observers.len(), "Forwarding error");
    broadcast(inner, request_id, &observers, &StreamEvent::Error(error)).await;
}

async fn broadcast<S, T, E>(
    inner: &Inner<S, T, E>,
    request_id: RequestId,
    observers: &[Observer<T, E>],
    event: &StreamEvent<T, E>,
) where
    T: Clone,
    E: Clone,
{
    let mut dropped = Vec::new();

    for observer in observers {
        let delivery = deliver(&observer.handle, event, inner.config.overflow).await;
        if delivery != Delivery::Delivered {
            dropped.push((Arc::clone(&observer.handle), delivery));
        }
    }

    if !dropped.is_empty() {
        detach(inner, request_id, dropped);
    }
}

async fn deliver<T, E>(
    handle: &ObserverHandle<T, E>,
    event: &StreamEvent<T, E>,
    overflow: OverflowPolicy,
) -> Delivery
where
    T: Clone,
    E: Clone,
{
    match overflow {
        OverflowPolicy::Evict => handle.try_deliver(event.clone()),
        OverflowPolicy::Wait(timeout) => handle.deliver_timeout(event.clone(), timeout).await,
    }
}

/// Remove observers that could not take an event.
fn detach<S, T, E>(
    inner: &Inner<S, T, E>,
    request_id: RequestId,
    dropped: Vec<(Arc<ObserverHandle<T, E>>, Delivery)>,
) {
    if let Some(list) = inner.lock_downstream().get_mut(&request_id) {
        list.retain(|observer| {
            !dropped
                .iter()
                .any(|(handle, _)| Arc::ptr_eq(handle, &observer.handle))
        });
    }

    ForwardingMetrics::record_detached(dropped.len());

    for (handle, delivery) in dropped {
        if delivery == Delivery::Full {
            handle.complete(ProxyCompletion::Evicted);
            ForwardingMetrics::record_eviction();
            tracing::warn!(%request_id, "Observer fell behind and was evicted");
        } else {
            tracing::debug!(%request_id, "Observer went away");
        }
    }
}

fn complete<S, T, E>(inner: &Inner<S, T, E>, request_id: RequestId, completion: ProxyCompletion) {
    let (entry, results) = {
        let mut registry = inner.lock_registry();
        let entry = registry.pending.remove(&request_id);
        registry.completed.insert(request_id, completion);
        let results = registry.buffers.get(&request_id).map_or(0, Vec::len);
        (entry, results)
    };

    // Nothing can attach past this point: the registry no longer lists the
    // request as pending.
    let observers = inner
        .lock_downstream()
        .remove(&request_id)
        .unwrap_or_default();

    for observer in &observers {
        observer.handle.complete(completion);
    }
    ForwardingMetrics::record_detached(observers.len());

    let elapsed = entry.map(|entry| entry.started.elapsed()).unwrap_or_default();

    if completion == ProxyCompletion::Stalled {
        inner.stalled.fetch_add(1, Ordering::Relaxed);
        RequestMetrics::record_stalled();
        tracing::warn!(
            %request_id,
            results,
            observers = observers.len(),
            idle_secs = inner.config.stall_timeout.map_or(0, |t| t.as_secs()),
            "Request stalled, abandoning"
        );
    } else {
        RequestMetrics::record_completed(elapsed);
        tracing::info!(
            %request_id,
            results,
            observers = observers.len(),
            elapsed_ms = elapsed.as_millis(),
            "Request completed"
        );
    }
}
