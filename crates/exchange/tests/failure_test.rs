//! Local apply failures, withdrawals and replays

use std::time::Duration;

use assert_matches::assert_matches;
use cachex_exchange::{
    ApplyError, CacheConfig, ChangeRequest, Decision, ExchangeEvent, RejectReason,
};

mod common;
use common::test_cluster::{TestCluster, init_logging, test_config};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_local_init_failure_is_partially_accepted() {
    init_logging();
    let cluster = TestCluster::start(3).await;
    let failing = cluster.node(2).node_id;
    cluster.node(2).hooks.fail_create("inventory");

    let decision = cluster
        .handle(0)
        .submit_and_wait(ChangeRequest::start(CacheConfig::new("inventory")))
        .await
        .unwrap();

    let failures = match decision {
        Decision::PartiallyAccepted { failures } => failures,
        other => panic!("expected a partial acceptance, got {other}"),
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].node_id, failing);
    assert_matches!(
        &failures[0].error,
        ApplyError::InitializationFailed { name, .. } if name == "inventory"
    );

    // The cluster still considers the name taken, the failing member included.
    assert!(cluster.node(2).handle().lookup("inventory").is_none());
    let retry = cluster
        .handle(2)
        .submit_and_wait(ChangeRequest::start(CacheConfig::new("inventory")))
        .await
        .unwrap();
    assert_eq!(retry, Decision::Rejected(RejectReason::NameConflict));

    // Stopping clears the orphan on the failing member.
    let stop = cluster
        .handle(1)
        .submit_and_wait(ChangeRequest::stop("inventory"))
        .await
        .unwrap();
    assert_eq!(stop, Decision::Accepted);

    cluster.node(2).hooks.heal();
    let again = cluster
        .handle(2)
        .submit_and_wait(ChangeRequest::start(CacheConfig::new("inventory")))
        .await
        .unwrap();
    assert_eq!(again, Decision::Accepted);

    for node in &cluster.nodes {
        assert!(node.hooks.is_live("inventory"));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_destroy_failure_is_reported_and_entry_removed() {
    init_logging();
    let cluster = TestCluster::start(2).await;
    cluster.node(1).hooks.fail_destroy("feeds");

    cluster
        .handle(0)
        .submit_and_wait(ChangeRequest::start(CacheConfig::new("feeds")))
        .await
        .unwrap();

    let decision = cluster
        .handle(0)
        .submit_and_wait(ChangeRequest::stop("feeds"))
        .await
        .unwrap();
    assert_matches!(
        decision,
        Decision::PartiallyAccepted { ref failures }
            if failures.len() == 1
                && matches!(failures[0].error, ApplyError::DestroyFailed { .. })
    );

    for node in &cluster.nodes {
        assert!(node.handle().lookup("feeds").is_none());
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_withdraw_before_round_opens() {
    init_logging();
    let config = test_config().with_batch_window(Duration::from_secs(2));
    let cluster = TestCluster::start_with_config(3, config).await;

    let pending = cluster
        .handle(1)
        .submit(ChangeRequest::start(CacheConfig::new("drafts")))
        .await
        .unwrap();
    let id = pending.deployment_id().clone();

    let withdrawn = cluster.handle(1).withdraw(&id).await.unwrap();
    assert!(withdrawn);

    let decision = pending.wait_timeout(TIMEOUT).await.unwrap();
    assert_eq!(decision, Decision::Rejected(RejectReason::Withdrawn));

    // The batch window passes without a round.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    for node in &cluster.nodes {
        assert!(node.handle().lookup("drafts").is_none());
        assert!(node.handle().status().last_committed.is_none());
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_withdraw_after_decision_is_refused() {
    init_logging();
    let cluster = TestCluster::start(2).await;

    let pending = cluster
        .handle(1)
        .submit(ChangeRequest::start(CacheConfig::new("final")))
        .await
        .unwrap();
    let id = pending.deployment_id().clone();
    assert_eq!(pending.await.unwrap(), Decision::Accepted);

    assert!(!cluster.handle(1).withdraw(&id).await.unwrap());
    assert!(cluster.handle(1).lookup("final").is_some());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replayed_request_is_answered_from_history() {
    init_logging();
    let cluster = TestCluster::start(3).await;

    let request = ChangeRequest::start(CacheConfig::new("profiles")).with_deployment_id("dep-p");
    let first = cluster
        .handle(0)
        .submit_and_wait(request.clone())
        .await
        .unwrap();
    assert_eq!(first, Decision::Accepted);
    let committed = cluster.handle(0).status().last_committed;

    let mut events = cluster.handle(2).subscribe();
    let replay = cluster.handle(2).submit_and_wait(request).await.unwrap();
    assert_eq!(replay, Decision::Accepted);

    // No new round and no second apply.
    let event = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap();
    assert_matches!(
        event,
        Ok(ExchangeEvent::DecisionDelivered { deployment_id, .. })
            if deployment_id.as_str() == "dep-p"
    );
    assert_eq!(cluster.handle(0).status().last_committed, committed);
    for node in &cluster.nodes {
        assert_eq!(node.hooks.create_count("profiles"), 1);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_submit_after_shutdown_fails() {
    init_logging();
    let cluster = TestCluster::start(2).await;
    let handle = cluster.handle(1);

    cluster.node(1).node.shutdown().await.unwrap();

    let err = handle
        .submit(ChangeRequest::start(CacheConfig::new("late")))
        .await
        .unwrap_err();
    assert!(err.is_shutdown());

    cluster.shutdown().await;
}
