//! The mock compute service behind a real dispatch client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use solution_dispatch_core::{
    ComputeError, ComputeService, ProxyCompletion, SolutionProgress, SolutionSearchRequest,
    SolutionStatus,
};
use solution_dispatch_runtime::{ClientConfig, DispatchClient};
use solution_dispatch_testing::{
    MockComputeService, ScriptStep, drain, init_test_tracing, status, test_timestamp, wait_until,
};
use std::time::Duration;

type Client = DispatchClient<MockComputeService, SolutionStatus, ComputeError>;

fn client(service: &MockComputeService) -> Client {
    init_test_tracing();
    DispatchClient::new(service.clone(), ClientConfig::default())
}

#[tokio::test]
async fn test_scripted_delay_lets_late_observer_join() {
    let service = MockComputeService::scripted(vec![
        ScriptStep::status("s1", SolutionProgress::Running),
        ScriptStep::Delay(Duration::from_millis(100)),
        ScriptStep::status("s1", SolutionProgress::Completed),
    ]);
    let client = client(&service);
    let request = SolutionSearchRequest::new("baseball", "hits");

    let search = request.clone();
    let id = client
        .dispatch(|svc| async move { svc.search_solutions(&search).await })
        .await
        .unwrap();
    let mut first = client.attach(id).unwrap().proxy;
    let running = first.recv_result().await.unwrap();
    assert_eq!(running.progress, SolutionProgress::Running);

    // Still inside the scripted delay.
    assert_eq!(client.is_request_attachable(&request), Some(id));
    let late = client.attach(id).unwrap();
    assert_eq!(late.history, vec![running]);

    let (live, errors, completion) = drain(late.proxy).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].progress, SolutionProgress::Completed);
    assert!(errors.is_empty());
    assert_eq!(completion, ProxyCompletion::Finished);
}

#[tokio::test]
async fn test_manual_producer_drives_the_stream() {
    let service = MockComputeService::manual();
    let client = client(&service);

    let request = SolutionSearchRequest::new("baseball", "hits");
    let id = client
        .dispatch(|svc| async move { svc.search_solutions(&request).await })
        .await
        .unwrap();
    let attachment = client.attach(id).unwrap();

    let (producer_id, producer) = service.take_producer_with_id().unwrap();
    assert_eq!(producer_id, id);

    let update = status(id, "s1", SolutionProgress::Completed).with_score("accuracy", 0.91);
    producer.send_result(update.clone()).await.unwrap();
    producer
        .send_error(ComputeError::Unavailable("worker restarting".into()))
        .await
        .unwrap();
    producer.finish();

    let (results, errors, _) = drain(attachment.proxy).await.unwrap();
    assert_eq!(results, vec![update]);
    assert_eq!(results[0].timestamp, test_timestamp());
    assert_eq!(
        errors,
        vec![ComputeError::Unavailable("worker restarting".into())]
    );

    assert!(wait_until(|| client.is_completed(id), Duration::from_secs(5)).await);
}
