//! # comprehensive raft tests
//!
//! why: verify all raft consensus scenarios work correctly
//! relations: tests the raft-core crate through its public api
//! what: election, replication, backtracking, commit, membership, compaction, lost proposals

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use raft_core::{
    AppendEntriesRequest, ApplyError, Command, CommandRecord, CommandRegistry, LogEntry,
    MemoryStorage, NodeState, Outbound, PeerInfo, RaftConfig, RaftError, RaftMessage, RaftNode,
    StateMachine, VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// TEST FIXTURES: a key-value state machine and a synchronous message router
// =============================================================================

#[derive(Debug, Default)]
struct Kv {
    data: BTreeMap<String, String>,
    applied: Vec<u64>,
}

impl StateMachine for Kv {
    fn apply(&mut self, index: u64, command: &dyn Command<Self>) -> Result<(), ApplyError> {
        self.applied.push(index);
        command.apply(self)
    }

    fn snapshot(&self) -> Result<Vec<u8>, ApplyError> {
        serde_json::to_vec(&self.data).map_err(|e| ApplyError::new(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ApplyError> {
        self.data = serde_json::from_slice(data).map_err(|e| ApplyError::new(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Set {
    key: String,
    value: String,
}

impl Command<Kv> for Set {
    fn name(&self) -> &str {
        "set"
    }

    fn encode(&self) -> raft_core::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::codec("set", e))
    }

    fn apply(&self, state: &mut Kv) -> Result<(), ApplyError> {
        state.data.insert(self.key.clone(), self.value.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Reject;

impl Command<Kv> for Reject {
    fn name(&self) -> &str {
        "reject"
    }

    fn encode(&self) -> raft_core::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::codec("reject", e))
    }

    fn apply(&self, _state: &mut Kv) -> Result<(), ApplyError> {
        Err(ApplyError::new("rejected by state machine"))
    }
}

fn set(key: &str, value: &str) -> Set {
    Set {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn registry() -> Arc<CommandRegistry<Kv>> {
    let mut registry = CommandRegistry::new();
    registry.register::<Set>("set").unwrap();
    registry.register::<Reject>("reject").unwrap();
    Arc::new(registry)
}

fn info(name: &str) -> PeerInfo {
    PeerInfo::new(name, format!("mem://{name}"))
}

fn new_node(name: &str, members: &[&str], config: RaftConfig) -> RaftNode<Kv> {
    let mut node = RaftNode::open(
        name,
        format!("mem://{name}"),
        Box::new(MemoryStorage::new()),
        Kv::default(),
        registry(),
        config,
    )
    .unwrap();
    for member in members {
        node.bootstrap_peer(info(member));
    }
    node
}

fn record(key: &str, value: &str) -> CommandRecord {
    set(key, value).to_record().unwrap()
}

fn entries(term: u64, from: u64, to: u64) -> Vec<LogEntry> {
    (from..=to)
        .map(|i| LogEntry::new(term, i, record("k", &i.to_string())))
        .collect()
}

/// Routes requests and responses between in-memory nodes until quiet
struct Cluster {
    nodes: BTreeMap<String, RaftNode<Kv>>,
    down: BTreeSet<String>,
}

impl Cluster {
    fn new(names: &[&str]) -> Self {
        Self::with_config(names, RaftConfig::default())
    }

    fn with_config(names: &[&str], config: RaftConfig) -> Self {
        let nodes = names
            .iter()
            .map(|name| (name.to_string(), new_node(name, names, config.clone())))
            .collect();
        Self {
            nodes,
            down: BTreeSet::new(),
        }
    }

    fn node(&self, name: &str) -> &RaftNode<Kv> {
        &self.nodes[name]
    }

    fn node_mut(&mut self, name: &str) -> &mut RaftNode<Kv> {
        self.nodes.get_mut(name).unwrap()
    }

    fn add(&mut self, node: RaftNode<Kv>) {
        self.nodes.insert(node.id.clone(), node);
    }

    fn crash(&mut self, name: &str) {
        self.down.insert(name.to_string());
    }

    fn recover(&mut self, name: &str) {
        self.down.remove(name);
    }

    fn elect(&mut self, name: &str) {
        let outbound = self.node_mut(name).start_election().unwrap();
        self.dispatch(name, outbound);
    }

    fn replicate(&mut self, leader: &str) {
        let outbound = self.node(leader).broadcast_append_entries();
        self.dispatch(leader, outbound);
    }

    fn propose(&mut self, leader: &str, key: &str, value: &str) -> LogEntry {
        let entry = self
            .node_mut(leader)
            .propose_command(&set(key, value))
            .unwrap();
        self.replicate(leader);
        entry
    }

    fn dispatch(&mut self, from: &str, outbound: Vec<Outbound>) {
        let mut queue: VecDeque<(String, Outbound)> =
            outbound.into_iter().map(|o| (from.to_string(), o)).collect();
        let mut rounds = 0;

        while let Some((from, out)) = queue.pop_front() {
            rounds += 1;
            assert!(rounds < 10_000, "message routing did not settle");

            let to = out.to.name.clone();
            if self.down.contains(&to) || self.down.contains(&from) || !self.nodes.contains_key(&to)
            {
                continue;
            }
            let sent_term = out.term();

            match out.message {
                RaftMessage::VoteRequest(request) => {
                    let (response, _) = self.node_mut(&to).handle_vote_request(&request).unwrap();
                    let sender = self.node_mut(&from);
                    if sender.handle_vote_response(&to, &response).unwrap() {
                        let heartbeats = sender.broadcast_append_entries();
                        queue.extend(heartbeats.into_iter().map(|o| (from.clone(), o)));
                    }
                }
                RaftMessage::AppendEntries(request) => {
                    let (response, _) = self.node_mut(&to).handle_append_entries(request).unwrap();
                    let sender = self.node_mut(&from);
                    sender
                        .handle_append_entries_response(&to, sent_term, &response)
                        .unwrap();
                    if !response.success || sender.needs_replication(&to) {
                        if let Some(next) = sender.create_append_entries(&to) {
                            queue.push_back((from.clone(), next));
                        }
                    }
                }
                RaftMessage::InstallSnapshot(request) => {
                    let (response, _) = self.node_mut(&to).handle_install_snapshot(request).unwrap();
                    let sender = self.node_mut(&from);
                    sender
                        .handle_install_snapshot_response(&to, sent_term, &response)
                        .unwrap();
                    if sender.needs_replication(&to) {
                        if let Some(next) = sender.create_append_entries(&to) {
                            queue.push_back((from.clone(), next));
                        }
                    }
                }
                RaftMessage::VoteResponse(_)
                | RaftMessage::AppendEntriesResponse(_)
                | RaftMessage::InstallSnapshotResponse(_) => {
                    unreachable!("responses are handled inline")
                }
            }
        }
    }
}

// =============================================================================
// SECTION 1: INITIALIZATION TESTS
// =============================================================================

mod initialization {
    use super::*;

    #[test]
    fn new_node_starts_as_follower() {
        let node = new_node("a", &["a", "b", "c"], RaftConfig::default());
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
        assert!(node.log.is_empty());
        assert_eq!(node.commit_index(), 0);
        assert_eq!(node.log.last_applied(), 0);
    }

    #[test]
    fn node_knows_cluster_membership() {
        let node = new_node("a", &["a", "b", "c"], RaftConfig::default());
        let names: Vec<String> = node.members().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(!node.peers.contains_key("a"));
    }

    #[test]
    fn custom_config_is_applied() {
        let config = RaftConfig {
            election_timeout_min: 200,
            election_timeout_max: 400,
            heartbeat_interval: 100,
            ..Default::default()
        };
        let node = new_node("a", &["a", "b", "c"], config);
        assert_eq!(node.config.election_timeout_min, 200);
        assert_eq!(node.config.election_timeout_max, 400);
        assert_eq!(node.config.heartbeat_interval, 100);
    }

    #[test]
    fn reopening_restores_term_and_vote() {
        let storage = MemoryStorage::new();
        let mut node = RaftNode::open(
            "a",
            "mem://a",
            Box::new(storage.clone()),
            Kv::default(),
            registry(),
            RaftConfig::default(),
        )
        .unwrap();
        node.bootstrap_peer(info("b"));
        node.start_election().unwrap();

        let reopened = RaftNode::open(
            "a",
            "mem://a",
            Box::new(storage),
            Kv::default(),
            registry(),
            RaftConfig::default(),
        )
        .unwrap();
        assert_eq!(reopened.current_term, 1);
        assert_eq!(reopened.voted_for.as_deref(), Some("a"));
        assert_eq!(reopened.state, NodeState::Follower);
    }
}

// =============================================================================
// SECTION 2: QUORUM CALCULATION TESTS
// =============================================================================

mod quorum {
    use super::*;

    fn cluster_of(n: usize) -> RaftNode<Kv> {
        let names: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        new_node("n0", &refs, RaftConfig::default())
    }

    #[test]
    fn quorum_for_3_node_cluster() {
        assert_eq!(cluster_of(3).quorum_size(), 2);
    }

    #[test]
    fn quorum_for_4_node_cluster() {
        assert_eq!(cluster_of(4).quorum_size(), 3);
    }

    #[test]
    fn quorum_for_5_node_cluster() {
        assert_eq!(cluster_of(5).quorum_size(), 3);
    }

    #[test]
    fn quorum_for_1_node_cluster() {
        assert_eq!(cluster_of(1).quorum_size(), 1);
    }

    #[test]
    fn has_quorum_with_majority() {
        let mut node = cluster_of(3);
        node.votes_received = ["n0", "n1"].iter().map(|s| s.to_string()).collect();
        assert!(node.has_quorum());
    }

    #[test]
    fn no_quorum_with_minority() {
        let mut node = cluster_of(3);
        node.votes_received = ["n0"].iter().map(|s| s.to_string()).collect();
        assert!(!node.has_quorum());
    }
}

// =============================================================================
// SECTION 3: ELECTION TESTS
// =============================================================================

mod election {
    use super::*;

    #[test]
    fn start_election_becomes_candidate() {
        let mut node = new_node("a", &["a", "b", "c"], RaftConfig::default());
        let requests = node.start_election().unwrap();

        assert_eq!(node.state, NodeState::Candidate);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for.as_deref(), Some("a"));
        assert_eq!(node.votes_received.len(), 1);
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|o| matches!(&o.message, RaftMessage::VoteRequest(r) if r.term == 1)));
    }

    #[test]
    fn repeated_timeout_starts_new_term() {
        let mut node = new_node("a", &["a", "b", "c"], RaftConfig::default());
        node.start_election().unwrap();
        node.start_election().unwrap();
        assert_eq!(node.current_term, 2);
        assert_eq!(node.votes_received.len(), 1);
    }

    #[test]
    fn single_node_wins_election_immediately() {
        let mut node = new_node("solo", &["solo"], RaftConfig::default());
        node.start_election().unwrap();
        assert_eq!(node.state, NodeState::Leader);
        assert_eq!(node.leader_id.as_deref(), Some("solo"));
    }

    #[test]
    fn becomes_leader_with_majority_votes() {
        let mut node = new_node("a", &["a", "b", "c"], RaftConfig::default());
        node.start_election().unwrap();
        let granted = VoteResponse {
            term: 1,
            vote_granted: true,
        };
        assert!(node.handle_vote_response("b", &granted).unwrap());
        assert_eq!(node.state, NodeState::Leader);
    }

    #[test]
    fn rejected_votes_keep_candidate() {
        let mut node = new_node("a", &["a", "b", "c"], RaftConfig::default());
        node.start_election().unwrap();
        let rejected = VoteResponse {
            term: 1,
            vote_granted: false,
        };
        assert!(!node.handle_vote_response("b", &rejected).unwrap());
        assert!(!node.handle_vote_response("c", &rejected).unwrap());
        assert_eq!(node.state, NodeState::Candidate);
    }

    #[test]
    fn higher_term_response_steps_down() {
        let mut node = new_node("a", &["a", "b", "c"], RaftConfig::default());
        node.start_election().unwrap();
        let newer = VoteResponse {
            term: 5,
            vote_granted: false,
        };
        node.handle_vote_response("b", &newer).unwrap();
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn late_vote_from_previous_term_is_ignored() {
        let mut node = new_node("a", &["a", "b", "c"], RaftConfig::default());
        node.start_election().unwrap();
        node.start_election().unwrap();
        let old = VoteResponse {
            term: 1,
            vote_granted: true,
        };
        assert!(!node.handle_vote_response("b", &old).unwrap());
        assert_eq!(node.state, NodeState::Candidate);
    }
}

// =============================================================================
// SECTION 4: VOTE REQUEST HANDLING
// =============================================================================

mod vote_requests {
    use super::*;

    fn request(term: u64, candidate: &str, last_log_index: u64, last_log_term: u64) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate.to_string(),
            last_log_index,
            last_log_term,
        }
    }

    #[test]
    fn grant_vote_to_valid_candidate() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        let (response, reset) = node.handle_vote_request(&request(1, "a", 0, 0)).unwrap();
        assert!(response.vote_granted);
        assert!(reset);
        assert_eq!(response.term, 1);
        assert_eq!(node.voted_for.as_deref(), Some("a"));
    }

    #[test]
    fn reject_vote_for_stale_term() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        node.current_term = 3;
        let (response, reset) = node.handle_vote_request(&request(2, "a", 0, 0)).unwrap();
        assert!(!response.vote_granted);
        assert!(!reset);
        assert_eq!(response.term, 3);
    }

    #[test]
    fn only_one_vote_per_term() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        node.handle_vote_request(&request(1, "a", 0, 0)).unwrap();
        let (response, _) = node.handle_vote_request(&request(1, "c", 0, 0)).unwrap();
        assert!(!response.vote_granted);
        // asking again for the same candidate is fine
        let (again, _) = node.handle_vote_request(&request(1, "a", 0, 0)).unwrap();
        assert!(again.vote_granted);
    }

    #[test]
    fn reject_candidate_with_stale_log() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        node.log.append_entries(0, 0, entries(2, 1, 3)).unwrap();
        // older last term
        let (response, _) = node.handle_vote_request(&request(3, "a", 9, 1)).unwrap();
        assert!(!response.vote_granted);
        // same last term, shorter log
        let (response, _) = node.handle_vote_request(&request(3, "c", 2, 2)).unwrap();
        assert!(!response.vote_granted);
        // adopted the term even though the vote was refused
        assert_eq!(node.current_term, 3);
    }

    #[test]
    fn grant_vote_to_more_complete_log() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        node.log.append_entries(0, 0, entries(1, 1, 5)).unwrap();
        let (response, _) = node.handle_vote_request(&request(2, "a", 1, 2)).unwrap();
        assert!(response.vote_granted);
    }

    #[test]
    fn leader_steps_down_on_higher_term_vote_request() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        let leader = cluster.node_mut("a");
        assert!(leader.is_leader());
        leader.handle_vote_request(&request(7, "b", 0, 0)).unwrap();
        assert_eq!(leader.state, NodeState::Follower);
        assert_eq!(leader.current_term, 7);
    }
}

// =============================================================================
// SECTION 5: LOG REPLICATION TESTS
// =============================================================================

mod log_replication {
    use super::*;

    #[test]
    fn follower_rejects_proposals_with_leader_hint() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        let err = cluster
            .node_mut("b")
            .propose_command(&set("x", "1"))
            .unwrap_err();
        match err {
            RaftError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("a")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn leader_replicates_and_everyone_applies() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.propose("a", "x", "1");
        cluster.propose("a", "y", "2");
        // one more round carries the new commit index to followers
        cluster.replicate("a");

        for name in ["a", "b", "c"] {
            let node = cluster.node(name);
            assert_eq!(node.commit_index(), 2, "{name}");
            assert_eq!(node.state_machine().data["x"], "1");
            assert_eq!(node.state_machine().data["y"], "2");
            assert_eq!(node.state_machine().applied, vec![1, 2]);
        }
    }

    #[test]
    fn heartbeat_carries_no_entries_when_caught_up() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        let heartbeats = cluster.node("a").broadcast_append_entries();
        assert_eq!(heartbeats.len(), 2);
        for out in heartbeats {
            match out.message {
                RaftMessage::AppendEntries(request) => assert!(request.is_heartbeat()),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn batches_are_bounded() {
        let config = RaftConfig {
            max_entries_per_message: 2,
            ..Default::default()
        };
        let mut cluster = Cluster::with_config(&["a", "b", "c"], config);
        cluster.elect("a");
        cluster.crash("b");
        cluster.crash("c");
        for i in 0..5 {
            cluster.propose("a", "k", &i.to_string());
        }
        let request = cluster.node("a").create_append_entries("b").unwrap();
        match request.message {
            RaftMessage::AppendEntries(request) => assert_eq!(request.entries.len(), 2),
            other => panic!("unexpected {other:?}"),
        }

        cluster.recover("b");
        cluster.replicate("a");
        assert_eq!(cluster.node("b").last_log_index(), 5);
        assert_eq!(cluster.node("a").commit_index(), 5);
    }

    #[test]
    fn lagging_follower_catches_up() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.crash("c");
        for i in 0..4 {
            cluster.propose("a", "k", &i.to_string());
        }
        assert_eq!(cluster.node("c").last_log_index(), 0);

        cluster.recover("c");
        cluster.replicate("a");
        cluster.replicate("a");
        assert_eq!(cluster.node("c").last_log_index(), 4);
        assert_eq!(cluster.node("c").commit_index(), 4);
        assert_eq!(cluster.node("c").state_machine().data["k"], "3");
    }
}

// =============================================================================
// SECTION 6: APPEND ENTRIES HANDLING
// =============================================================================

mod append_entries {
    use super::*;

    fn heartbeat(term: u64, prev_log_index: u64, prev_log_term: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: "a".to_string(),
            prev_log_index,
            prev_log_term,
            entries: Vec::new(),
            leader_commit: 0,
        }
    }

    #[test]
    fn accept_heartbeat_from_valid_leader() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        let (response, reset) = node.handle_append_entries(heartbeat(1, 0, 0)).unwrap();
        assert!(response.success);
        assert!(reset);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.leader_id.as_deref(), Some("a"));
    }

    #[test]
    fn reject_append_from_stale_term() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        node.current_term = 4;
        let (response, reset) = node.handle_append_entries(heartbeat(3, 0, 0)).unwrap();
        assert!(!response.success);
        assert!(!reset);
        assert_eq!(response.term, 4);
    }

    #[test]
    fn candidate_steps_down_on_append_entries() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        node.start_election().unwrap();
        node.handle_append_entries(heartbeat(1, 0, 0)).unwrap();
        assert_eq!(node.state, NodeState::Follower);
        // the vote cast in this term stays
        assert_eq!(node.voted_for.as_deref(), Some("b"));
    }

    #[test]
    fn missing_prev_entry_hints_next_index() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        node.log.append_entries(0, 0, entries(1, 1, 2)).unwrap();
        let (response, reset) = node.handle_append_entries(heartbeat(1, 7, 1)).unwrap();
        assert!(!response.success);
        assert!(reset);
        assert_eq!(response.conflict_index, Some(3));
    }

    #[test]
    fn commit_follows_leader_but_not_past_new_entries() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        let request = AppendEntriesRequest {
            term: 1,
            leader_id: "a".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: entries(1, 1, 3),
            leader_commit: 10,
        };
        let (response, _) = node.handle_append_entries(request).unwrap();
        assert!(response.success);
        assert_eq!(response.match_index, 3);
        assert_eq!(node.commit_index(), 3);
        assert_eq!(node.state_machine().applied, vec![1, 2, 3]);
    }

    #[test]
    fn rewriting_committed_entries_is_refused() {
        let mut node = new_node("b", &["a", "b", "c"], RaftConfig::default());
        let mut request = heartbeat(1, 0, 0);
        request.entries = entries(1, 1, 2);
        request.leader_commit = 2;
        node.handle_append_entries(request).unwrap();

        let mut rewrite = heartbeat(2, 0, 0);
        rewrite.entries = entries(2, 1, 1);
        let err = node.handle_append_entries(rewrite).unwrap_err();
        assert!(matches!(err, RaftError::CommittedConflict { index: 1 }));
    }
}

// =============================================================================
// SECTION 7: COMMIT ADVANCEMENT
// =============================================================================

mod commit_advancement {
    use super::*;

    #[test]
    fn entries_from_older_terms_commit_only_with_current_term_entry() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        // a holds two uncommitted entries from term 1 that only it has
        cluster.node_mut("a").log.append_entries(0, 0, entries(1, 1, 2)).unwrap();
        cluster.node_mut("a").current_term = 1;
        cluster.elect("a");
        assert_eq!(cluster.node("a").current_term, 2);

        // replicated everywhere, but still from an older term
        cluster.replicate("a");
        assert_eq!(cluster.node("b").last_log_index(), 2);
        assert_eq!(cluster.node("a").commit_index(), 0);

        cluster.propose("a", "x", "1");
        assert_eq!(cluster.node("a").commit_index(), 3);
    }

    #[test]
    fn apply_failure_is_reported_and_log_moves_on() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        let rejected = cluster.node_mut("a").propose_command(&Reject).unwrap();
        cluster.replicate("a");
        cluster.propose("a", "x", "1");

        let completions = cluster.node_mut("a").take_completions();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].index, rejected.index);
        assert!(matches!(
            completions[0].result,
            Err(RaftError::Apply { index: 1, .. })
        ));
        assert!(completions[1].result.is_ok());
        assert_eq!(cluster.node("a").state_machine().data["x"], "1");
        assert_eq!(cluster.node("a").status().apply_failures, 1);
    }

    #[test]
    fn unknown_command_fails_apply_without_halting() {
        let mut node = new_node("solo", &["solo"], RaftConfig::default());
        node.start_election().unwrap();
        node.propose(CommandRecord::new("mystery", b"{}".to_vec()))
            .unwrap();
        node.propose_command(&set("x", "1")).unwrap();

        assert_eq!(node.commit_index(), 2);
        let completions = node.take_completions();
        assert!(completions[0].result.is_err());
        assert!(completions[1].result.is_ok());
        assert_eq!(node.state_machine().data["x"], "1");
    }

    #[test]
    fn stale_append_response_is_discarded() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.crash("b");
        cluster.crash("c");
        cluster.propose("a", "x", "1");

        let response = raft_core::AppendEntriesResponse {
            term: 0,
            success: true,
            match_index: 1,
            conflict_index: None,
            commit_index: 0,
        };
        let moved = cluster
            .node_mut("a")
            .handle_append_entries_response("b", 0, &response)
            .unwrap();
        assert!(!moved);
        assert_eq!(cluster.node("a").peers["b"].match_index, 0);
    }
}

// =============================================================================
// SECTION 8: MEMBERSHIP CHANGES
// =============================================================================

mod membership {
    use super::*;

    #[test]
    fn only_one_membership_change_in_flight() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.crash("b");
        cluster.crash("c");

        let first = cluster.node_mut("a").propose_add_peer(info("d")).unwrap();
        let err = cluster.node_mut("a").propose_remove_peer("c").unwrap_err();
        match err {
            RaftError::MembershipChangePending { index } => assert_eq!(index, first.index),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn removed_peer_leaves_every_member_set() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.node_mut("a").propose_remove_peer("c").unwrap();
        cluster.replicate("a");
        cluster.replicate("a");

        assert!(!cluster.node("a").peers.contains_key("c"));
        assert!(!cluster.node("b").peers.contains_key("c"));
        assert_eq!(cluster.node("a").quorum_size(), 2);
    }

    #[test]
    fn removed_follower_stops_instead_of_taking_over() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.node_mut("a").propose_remove_peer("c").unwrap();
        for _ in 0..3 {
            cluster.replicate("a");
        }

        assert_eq!(cluster.node("c").state, NodeState::Stopped);
        assert_eq!(cluster.node("c").commit_index(), 1);

        // c's election timer firing must not disturb the remaining members
        cluster.elect("c");
        let leader = cluster.node("a");
        assert_eq!(leader.state, NodeState::Leader);
        assert_eq!(leader.current_term, 1);
        assert_eq!(cluster.node("b").current_term, 1);
    }

    #[test]
    fn unreachable_removed_peer_is_fed_once_it_returns() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.crash("c");
        let leave = cluster.node_mut("a").propose_remove_peer("c").unwrap();
        cluster.replicate("a");

        let leader = cluster.node("a");
        assert_eq!(leader.commit_index(), leave.index);
        // no longer a member, but still owed the commit of its removal
        assert_eq!(leader.peers["c"].removed_at, Some(leave.index));
        assert_eq!(leader.quorum_size(), 2);
        assert!(leader.status().peers.iter().all(|p| p.name != "c"));
        assert!(leader.members().iter().all(|p| p.name != "c"));

        cluster.recover("c");
        cluster.replicate("a");
        assert_eq!(cluster.node("c").state, NodeState::Stopped);
        assert!(!cluster.node("a").peers.contains_key("c"));
    }

    #[test]
    fn removed_peers_are_forgotten_on_step_down() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.crash("c");
        cluster.node_mut("a").propose_remove_peer("c").unwrap();
        cluster.replicate("a");
        assert!(cluster.node("a").peers.contains_key("c"));

        cluster.node_mut("a").become_follower(2).unwrap();
        assert!(!cluster.node("a").peers.contains_key("c"));
        assert_eq!(cluster.node("a").peers.len(), 1);
    }

    #[test]
    fn removing_self_stops_the_node() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.node_mut("a").propose_remove_peer("a").unwrap();
        cluster.replicate("a");

        let leader = cluster.node("a");
        assert_eq!(leader.state, NodeState::Stopped);
        assert!(cluster.node_mut("a").start_election().unwrap().is_empty());
    }

    #[test]
    fn membership_survives_compaction() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.node_mut("a").propose_add_peer(info("d")).unwrap();
        cluster.replicate("a");
        assert!(cluster.node_mut("a").compact().unwrap());

        let snapshot = cluster.node("a").log.snapshot().unwrap();
        let names: Vec<&str> = snapshot.peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }
}

// =============================================================================
// SECTION 9: COMPACTION AND SNAPSHOTS
// =============================================================================

mod compaction {
    use super::*;

    #[test]
    fn compact_keeps_state_and_drops_prefix() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        for i in 0..5 {
            cluster.propose("a", &format!("k{i}"), "v");
        }
        let leader = cluster.node_mut("a");
        assert!(leader.compact().unwrap());
        assert_eq!(leader.log.snapshot_index(), 5);
        assert!(leader.log.is_empty());
        assert_eq!(leader.last_log_index(), 5);
        // nothing new to compact
        assert!(!leader.compact().unwrap());
    }

    #[test]
    fn far_behind_follower_receives_snapshot() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        cluster.crash("c");
        for i in 0..6 {
            cluster.propose("a", &format!("k{i}"), &i.to_string());
        }
        cluster.node_mut("a").compact().unwrap();

        cluster.recover("c");
        cluster.propose("a", "after", "snapshot");
        cluster.replicate("a");

        let follower = cluster.node("c");
        assert_eq!(follower.log.snapshot_index(), 6);
        assert_eq!(follower.last_log_index(), 7);
        assert_eq!(follower.state_machine().data["k5"], "5");
        assert_eq!(follower.state_machine().data["after"], "snapshot");
        assert_eq!(follower.commit_index(), 7);
    }

    #[test]
    fn automatic_compaction_past_threshold() {
        let config = RaftConfig {
            compaction_threshold: Some(3),
            ..Default::default()
        };
        let mut node = new_node("solo", &["solo"], config);
        node.start_election().unwrap();
        for i in 0..4 {
            node.propose_command(&set("k", &i.to_string())).unwrap();
        }
        assert_eq!(node.log.snapshot_index(), 4);
        assert_eq!(node.state_machine().data["k"], "3");
    }
}

// =============================================================================
// SECTION 10: SCENARIOS
// =============================================================================

mod scenarios {
    use super::*;

    /// one timer fires in a fresh 3-node cluster: two votes are enough
    #[test]
    fn scenario_a_first_election() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.crash("c");
        cluster.elect("a");

        let leader = cluster.node("a");
        assert_eq!(leader.state, NodeState::Leader);
        assert_eq!(leader.current_term, 1);
        assert_eq!(cluster.node("b").leader_id.as_deref(), Some("a"));
        assert_eq!(cluster.node("b").voted_for.as_deref(), Some("a"));
    }

    /// index 6 commits only once a majority has it
    #[test]
    fn scenario_b_commit_needs_majority() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        for i in 1..=5 {
            cluster.propose("a", "k", &i.to_string());
        }
        assert_eq!(cluster.node("a").commit_index(), 5);

        cluster.crash("b");
        cluster.crash("c");
        let entry = cluster.propose("a", "k", "6");
        assert_eq!(entry.index, 6);
        assert_eq!(cluster.node("a").commit_index(), 5);

        cluster.recover("b");
        cluster.replicate("a");
        assert_eq!(cluster.node("a").commit_index(), 6);
        assert_eq!(cluster.node("a").peers["b"].match_index, 6);
        assert_eq!(cluster.node("a").peers["c"].match_index, 5);
    }

    /// the leader walks back to the last agreeing entry and the
    /// follower's conflicting suffix is replaced
    #[test]
    fn scenario_c_conflicting_suffix_is_replaced() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        let mut leader_log = entries(1, 1, 8);
        leader_log.extend(entries(2, 9, 11));
        let mut stale_log = entries(1, 1, 8);
        stale_log.extend(entries(3, 9, 10));

        cluster.node_mut("a").log.append_entries(0, 0, leader_log.clone()).unwrap();
        cluster.node_mut("c").log.append_entries(0, 0, leader_log).unwrap();
        cluster.node_mut("b").log.append_entries(0, 0, stale_log).unwrap();
        for name in ["a", "b", "c"] {
            cluster.node_mut(name).current_term = 3;
        }

        // b would refuse a leader whose last term is older than its own
        cluster.crash("b");
        cluster.elect("a");
        assert!(cluster.node("a").is_leader());
        cluster.recover("b");

        let probe = AppendEntriesRequest {
            term: 4,
            leader_id: "a".to_string(),
            prev_log_index: 10,
            prev_log_term: 2,
            entries: Vec::new(),
            leader_commit: 0,
        };
        let (response, _) = cluster.node_mut("b").handle_append_entries(probe).unwrap();
        assert!(!response.success);
        assert_eq!(response.conflict_index, Some(9));

        cluster.replicate("a");
        let follower = cluster.node("b");
        assert_eq!(follower.last_log_index(), 11);
        assert_eq!(follower.log.term_at(9), Some(2));
        assert_eq!(follower.log.term_at(10), Some(2));
        assert_eq!(cluster.node("a").peers["b"].match_index, 11);
    }

    /// a proposal that never reached a majority is lost on failover
    #[test]
    fn scenario_d_lost_proposal_fails() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.elect("a");
        for i in 1..=6 {
            cluster.propose("a", "k", &i.to_string());
        }
        cluster.replicate("a");
        cluster.node_mut("a").take_completions();

        cluster.crash("a");
        let orphan = cluster.node_mut("a").propose_command(&set("k", "7")).unwrap();
        assert_eq!(orphan.index, 7);

        cluster.elect("b");
        assert!(cluster.node("b").is_leader());
        cluster.propose("b", "k", "new");
        assert_eq!(cluster.node("b").commit_index(), 7);

        cluster.recover("a");
        cluster.replicate("b");

        let old_leader = cluster.node_mut("a");
        assert_eq!(old_leader.state, NodeState::Follower);
        let completions = old_leader.take_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].index, 7);
        assert!(matches!(
            completions[0].result,
            Err(RaftError::CommandFailed { index: 7, term: 1, .. })
        ));
        assert_eq!(old_leader.state_machine().data["k"], "new");
    }

    /// once D has joined, commits need 3 of 4 members
    #[test]
    fn scenario_e_join_grows_the_quorum() {
        let mut cluster = Cluster::new(&["a", "b", "c"]);
        cluster.add(new_node("d", &["a", "b", "c", "d"], RaftConfig::default()));
        cluster.elect("a");

        cluster.node_mut("a").propose_add_peer(info("d")).unwrap();
        cluster.replicate("a");
        cluster.replicate("a");
        let leader = cluster.node("a");
        assert!(leader.peers.contains_key("d"));
        assert_eq!(leader.quorum_size(), 3);
        assert!(cluster.node("b").peers.contains_key("d"));
        assert_eq!(cluster.node("d").last_log_index(), 1);

        cluster.crash("c");
        cluster.crash("d");
        let entry = cluster.propose("a", "x", "1");
        // a and b hold it: a majority of {a,b,c} but not of {a,b,c,d}
        assert_eq!(cluster.node("b").last_log_index(), entry.index);
        assert!(cluster.node("a").commit_index() < entry.index);

        cluster.recover("d");
        cluster.replicate("a");
        assert_eq!(cluster.node("a").commit_index(), entry.index);
    }
}
