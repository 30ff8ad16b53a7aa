//! Coordinator takeover after a coordinator dies mid-round
//!
//! A puppet coordinator drives the first round by hand and is removed from
//! the topology at a chosen point; the oldest surviving member must finish
//! what it left behind.

use std::collections::BTreeSet;
use std::time::Duration;

use assert_matches::assert_matches;
use cachex_exchange::messages::ExchangeMessage;
use cachex_exchange::{
    CacheConfig, ChangeRequest, Decision, Outcome, RejectReason, RoundEntry, RoundVersion,
};
use cachex_topology::NodeId;

mod common;
use common::test_cluster::{Puppet, TestCluster, init_logging};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Receive the forwarded request and prepare it on every member.
///
/// Returns the prepared round's participants and entries once both members
/// voted to accept.
async fn prepare_forwarded(
    puppet: &mut Puppet,
    members: &[NodeId],
    version: RoundVersion,
) -> (BTreeSet<NodeId>, Vec<RoundEntry>) {
    let (submitter, message) = puppet.recv().await;
    let ExchangeMessage::Forward { requests, .. } = message else {
        panic!("expected a forwarded request");
    };
    let entries: Vec<RoundEntry> = requests
        .into_iter()
        .map(|request| RoundEntry::new(request, submitter))
        .collect();

    let mut participants: BTreeSet<NodeId> = members.iter().copied().collect();
    participants.insert(puppet.node_id);

    for member in members {
        puppet
            .send(
                *member,
                &ExchangeMessage::Prepare {
                    version,
                    participants: participants.clone(),
                    entries: entries.clone(),
                    sync: None,
                },
            )
            .await;
    }

    for _ in members {
        let (_, message) = puppet.recv().await;
        assert_matches!(
            message,
            ExchangeMessage::Vote { version: v, ref votes, committed: None }
                if v == version && votes.iter().all(Outcome::is_accepted)
        );
    }

    (participants, entries)
}

#[tokio::test]
async fn test_successor_restarts_prepared_round() {
    init_logging();
    let (cluster, mut puppet) = TestCluster::start_with_puppet(2).await;
    let members: Vec<NodeId> = cluster.nodes.iter().map(|n| n.node_id).collect();
    let version = RoundVersion::new(1, 1);

    let pending = cluster
        .handle(0)
        .submit(ChangeRequest::start(CacheConfig::new("alpha")))
        .await
        .unwrap();
    prepare_forwarded(&mut puppet, &members, version).await;

    // Prepared entries may no longer be withdrawn.
    assert!(!cluster.handle(0).withdraw(pending.deployment_id()).await.unwrap());

    cluster.topology.remove_node(puppet.node_id).unwrap();

    let decision = pending.wait_timeout(TIMEOUT).await.unwrap();
    assert_eq!(decision, Decision::Accepted);

    for node in &cluster.nodes {
        assert!(node.handle().lookup("alpha").is_some());
        assert_eq!(node.hooks.create_count("alpha"), 1);
    }
    cluster
        .wait_until(TIMEOUT, |node| {
            node.handle().status().last_committed >= Some(version)
        })
        .await
        .unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_successor_rebroadcasts_partial_commit() {
    init_logging();
    let (cluster, mut puppet) = TestCluster::start_with_puppet(2).await;
    let members: Vec<NodeId> = cluster.nodes.iter().map(|n| n.node_id).collect();
    let version = RoundVersion::new(1, 1);

    let pending = cluster
        .handle(1)
        .submit(ChangeRequest::start(CacheConfig::new("beta")))
        .await
        .unwrap();
    let (participants, entries) = prepare_forwarded(&mut puppet, &members, version).await;

    // The commit reaches only the successor before the puppet dies.
    puppet
        .send(
            members[0],
            &ExchangeMessage::Commit {
                version,
                participants,
                entries,
                outcomes: vec![Outcome::Accepted],
            },
        )
        .await;
    cluster
        .wait_until(TIMEOUT, |node| {
            node.node_id != members[0] || node.handle().lookup("beta").is_some()
        })
        .await
        .unwrap();
    assert!(cluster.handle(1).lookup("beta").is_none());

    cluster.topology.remove_node(puppet.node_id).unwrap();

    let decision = pending.wait_timeout(TIMEOUT).await.unwrap();
    assert_eq!(decision, Decision::Accepted);

    // The submitter may hear the outcome before the re-broadcast commit.
    cluster
        .wait_until(TIMEOUT, |node| {
            node.handle().status().last_committed >= Some(version)
                && node.handle().lookup("beta").is_some()
        })
        .await
        .unwrap();
    for node in &cluster.nodes {
        assert_eq!(node.hooks.create_count("beta"), 1);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_successor_adopts_outcomes_already_committed() {
    init_logging();
    let (cluster, mut puppet) = TestCluster::start_with_puppet(2).await;
    let members: Vec<NodeId> = cluster.nodes.iter().map(|n| n.node_id).collect();
    let version = RoundVersion::new(1, 1);

    let pending = cluster
        .handle(0)
        .submit(ChangeRequest::start(CacheConfig::new("gamma")))
        .await
        .unwrap();
    let (participants, entries) = prepare_forwarded(&mut puppet, &members, version).await;

    // The puppet rejected the entry with its own vote; only the second
    // member learned the outcome.
    puppet
        .send(
            members[1],
            &ExchangeMessage::Commit {
                version,
                participants,
                entries,
                outcomes: vec![Outcome::Rejected(RejectReason::NameConflict)],
            },
        )
        .await;
    cluster
        .wait_until(TIMEOUT, |node| {
            node.node_id != members[1] || node.handle().status().last_committed == Some(version)
        })
        .await
        .unwrap();

    cluster.topology.remove_node(puppet.node_id).unwrap();

    let decision = pending.wait_timeout(TIMEOUT).await.unwrap();
    assert_eq!(decision, Decision::Rejected(RejectReason::NameConflict));

    cluster
        .wait_until(TIMEOUT, |node| {
            node.handle().status().last_committed >= Some(version)
        })
        .await
        .unwrap();
    for node in &cluster.nodes {
        assert!(node.handle().lookup("gamma").is_none());
        assert_eq!(node.hooks.create_count("gamma"), 0);
    }

    cluster.shutdown().await;
}
