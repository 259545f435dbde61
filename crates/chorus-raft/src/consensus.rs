//! The consensus state machine: follower/candidate/leader transitions,
//! elections, and heartbeat-driven replication of an opaque state blob.
//!
//! The shape of this module is a pure `cycle()` step that mutates internal
//! state and appends side effects (RPCs to send, flags to persist) onto a
//! caller-supplied [`Tick`] rather than performing I/O itself. That keeps the
//! state machine trivially testable by feeding it synthetic time and
//! responses, with all actual network I/O pushed to the caller.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chorus_util::timing::random_duration_between;

use crate::errors::RaftError;
use crate::protos::*;

/// Side effects requested by the consensus module during one `cycle()`: a
/// single mutable out-parameter the state machine appends to, rather than
/// a channel or callback.
pub struct Tick {
    pub time: Instant,

    /// Set if `(current_term, voted_for)` changed and must be persisted
    /// before any RPC response referencing it is sent.
    pub meta_changed: bool,

    /// Set exactly once, on the cycle that wins an election. The caller
    /// (the higher-level `Node`/`LeaderCoordinator` supervisor) uses this to
    /// call its own explicit `Start`, never as an implicit side effect of a
    /// state assignment.
    pub became_leader: bool,

    /// Set exactly once, on the cycle a leader or candidate steps down.
    pub stepped_down: bool,

    pub messages: Vec<Message>,

    pub next_tick: Option<Duration>,
}

impl Tick {
    pub fn empty(time: Instant) -> Self {
        Tick {
            time,
            meta_changed: false,
            became_leader: false,
            stepped_down: false,
            messages: vec![],
            next_tick: None,
        }
    }

    fn send(&mut self, to: NodeId, body: MessageBody) {
        self.messages.push(Message { to, body });
    }
}

#[derive(Debug, Clone, Default)]
struct Metadata {
    current_term: Term,
    voted_for: Option<NodeId>,
}

struct FollowerState {
    last_heartbeat: Instant,
    election_timeout: Duration,
    last_leader_id: Option<NodeId>,
}

struct CandidateState {
    election_start: Instant,
    election_timeout: Duration,
    votes_received: HashSet<NodeId>,
}

struct ServerProgress {
    request_pending: bool,
    last_sent: Option<Instant>,
}

impl ServerProgress {
    fn new() -> Self {
        ServerProgress {
            request_pending: false,
            last_sent: None,
        }
    }
}

struct LeaderState {
    servers: HashMap<NodeId, ServerProgress>,
}

enum ServerState {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

/// The Raft-style state machine for one node. Owns the node's own identity,
/// the current membership, and the minimal `(term, last_index)` bookkeeping
/// needed for leader election; does not own or interpret the replicated
/// state blob itself.
pub struct ConsensusModule {
    id: NodeId,
    meta: Metadata,
    members: HashSet<NodeId>,
    state: ServerState,

    /// Stands in for "last log index/term" in a textbook Raft: bumped by one
    /// every time the leader successfully starts a new heartbeat round.
    /// Used only to let `RequestVote` prefer the more recently active
    /// leader's lineage during a split vote; it carries no data itself.
    last_index: u64,
    last_term: Term,

    /// The state blob supplied by `propose_state`, waiting to be replicated
    /// on the next heartbeat. Only meaningful while leader.
    pending_blob: Option<Vec<u8>>,

    /// Bounds a follower's randomized election timeout is drawn from.
    election_timeout_range: (Duration, Duration),
    /// Bounds a leader's randomized heartbeat period is drawn from. The low
    /// end matters more than the high: a healthy leader should never look
    /// idle to a follower waiting out its own election timeout.
    heartbeat_interval_range: (Duration, Duration),
}

impl ConsensusModule {
    pub fn new(
        id: NodeId,
        members: HashSet<NodeId>,
        election_timeout_range: (Duration, Duration),
        heartbeat_interval_range: (Duration, Duration),
        now: Instant,
    ) -> Self {
        let election_timeout = random_duration_between(election_timeout_range.0, election_timeout_range.1);
        ConsensusModule {
            id,
            meta: Metadata::default(),
            members,
            state: ServerState::Follower(FollowerState {
                last_heartbeat: now,
                election_timeout,
                last_leader_id: None,
            }),
            last_index: 0,
            last_term: 0,
            pending_blob: None,
            election_timeout_range,
            heartbeat_interval_range,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn current_term(&self) -> Term {
        self.meta.current_term
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state, ServerState::Leader(_))
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        match &self.state {
            ServerState::Leader(_) => Some(self.id.clone()),
            ServerState::Follower(s) => s.last_leader_id.clone(),
            ServerState::Candidate(_) => None,
        }
    }

    /// Replaces the known membership. Called every monitoring cycle with
    /// the latest `PeerDirectory` result; membership here is a live view,
    /// not a log-replicated configuration change, because the only thing
    /// this consensus module replicates is the opaque state blob, and
    /// membership changes (nodes joining/leaving/respawning) are handled by
    /// the leader coordinator, not by this module.
    pub fn set_members(&mut self, members: HashSet<NodeId>) {
        self.members = members;
    }

    pub fn members(&self) -> &HashSet<NodeId> {
        &self.members
    }

    /// Queues `blob` to be replicated on the next heartbeat. Only takes
    /// effect while leader; silently dropped otherwise (the caller should
    /// check `is_leader()` first and surface `RaftError::NotLeader`).
    pub fn propose_state(&mut self, blob: Vec<u8>) -> Result<(), RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_hint(),
            });
        }
        self.pending_blob = Some(blob);
        Ok(())
    }

    fn new_election_timeout(&self) -> Duration {
        random_duration_between(self.election_timeout_range.0, self.election_timeout_range.1)
    }

    fn new_heartbeat_interval(&self) -> Duration {
        random_duration_between(self.heartbeat_interval_range.0, self.heartbeat_interval_range.1)
    }

    fn majority_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Advances the state machine by one step given the current time,
    /// appending any RPCs to send and flags to act on onto `tick`.
    pub fn cycle(&mut self, tick: &mut Tick) {
        if self.members.is_empty() || !self.members.contains(&self.id) {
            // Not (yet) part of any known cluster: nothing to do but wait.
            tick.next_tick = Some(Duration::from_secs(1));
            return;
        }

        match &self.state {
            ServerState::Follower(s) => {
                let elapsed = tick.time.duration_since(s.last_heartbeat);
                let timeout = s.election_timeout;

                if elapsed >= timeout || self.members.len() == 1 {
                    self.start_election(tick);
                } else {
                    tick.next_tick = Some(timeout - elapsed);
                }
            }
            ServerState::Candidate(s) => {
                let vote_count = 1 + s.votes_received.len();
                if vote_count >= self.majority_size() {
                    self.become_leader(tick);
                } else {
                    let elapsed = tick.time.duration_since(s.election_start);
                    let timeout = s.election_timeout;
                    if elapsed >= timeout {
                        self.start_election(tick);
                    } else {
                        tick.next_tick = Some(timeout - elapsed);
                    }
                }
            }
            ServerState::Leader(_) => {
                let next_heartbeat = self.replicate(tick);
                tick.next_tick = Some(next_heartbeat);
            }
        }
    }

    fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>, now: Instant) {
        self.meta.current_term = term;
        self.meta.voted_for = None;
        self.pending_blob = None;
        let election_timeout = self.new_election_timeout();
        self.state = ServerState::Follower(FollowerState {
            last_heartbeat: now,
            election_timeout,
            last_leader_id: leader_id,
        });
    }

    fn start_election(&mut self, tick: &mut Tick) {
        self.meta.current_term += 1;
        self.meta.voted_for = Some(self.id.clone());
        tick.meta_changed = true;

        tracing::info!(term = self.meta.current_term, node = %self.id, "starting election");

        let mut votes_received = HashSet::new();
        votes_received.insert(self.id.clone());

        let election_timeout = self.new_election_timeout();
        self.state = ServerState::Candidate(CandidateState {
            election_start: tick.time,
            election_timeout,
            votes_received,
        });

        if self.members.len() == 1 {
            self.become_leader(tick);
            return;
        }

        for peer in self.members.iter().filter(|m| **m != self.id) {
            tick.send(
                peer.clone(),
                MessageBody::RequestVote(RequestVoteRequest {
                    term: self.meta.current_term,
                    candidate_id: self.id.clone(),
                    last_log_index: self.last_index,
                    last_log_term: self.last_term,
                }),
            );
        }
    }

    fn become_leader(&mut self, tick: &mut Tick) {
        tracing::info!(term = self.meta.current_term, node = %self.id, "became leader");

        let servers = self
            .members
            .iter()
            .filter(|m| **m != self.id)
            .map(|m| (m.clone(), ServerProgress::new()))
            .collect();

        self.state = ServerState::Leader(LeaderState { servers });
        tick.became_leader = true;

        // Issue the first heartbeat round immediately rather than waiting a
        // full interval, so followers observe the new leader promptly.
        let next = self.replicate(tick);
        tick.next_tick = Some(next.min(Duration::from_millis(50)));
    }

    fn step_down(&mut self, term: Term, leader_id: Option<NodeId>, tick: &mut Tick) {
        let was_leader_or_candidate = !matches!(self.state, ServerState::Follower(_));
        self.become_follower(term, leader_id, tick.time);
        tick.meta_changed = true;
        if was_leader_or_candidate {
            tick.stepped_down = true;
        }
    }

    fn replicate(&mut self, tick: &mut Tick) -> Duration {
        let term = self.meta.current_term;
        let leader_id = self.id.clone();
        let commit_index = self.last_index;

        self.last_index += 1;
        self.last_term = term;
        let blob = self.pending_blob.take().unwrap_or_default();

        let members: Vec<NodeId> = self
            .members
            .iter()
            .filter(|m| **m != self.id)
            .cloned()
            .collect();

        let heartbeat_interval_range = self.heartbeat_interval_range;
        let state = match &mut self.state {
            ServerState::Leader(s) => s,
            _ => return random_duration_between(heartbeat_interval_range.0, heartbeat_interval_range.1),
        };

        let mut soonest_remaining = random_duration_between(heartbeat_interval_range.0, heartbeat_interval_range.1);

        for peer in members {
            let progress = state
                .servers
                .entry(peer.clone())
                .or_insert_with(ServerProgress::new);

            if progress.request_pending {
                continue;
            }

            progress.request_pending = true;
            progress.last_sent = Some(tick.time);

            tick.send(
                peer,
                MessageBody::AppendEntries(AppendEntriesRequest {
                    term,
                    leader_id: leader_id.clone(),
                    prev_log_index: commit_index,
                    prev_log_term: self.last_term,
                    commit_index,
                    state_blob: blob.clone(),
                }),
            );
        }

        if soonest_remaining > heartbeat_interval_range.1 {
            soonest_remaining = heartbeat_interval_range.1;
        }
        soonest_remaining
    }

    /// Handles an incoming `RequestVote` RPC.
    pub fn handle_request_vote(&mut self, req: &RequestVoteRequest, now: Instant) -> RequestVoteResponse {
        if req.term < self.meta.current_term {
            return RequestVoteResponse {
                term: self.meta.current_term,
                granted: false,
            };
        }

        if req.term > self.meta.current_term {
            let mut tick = Tick::empty(now);
            self.step_down(req.term, None, &mut tick);
        }

        let up_to_date = req.last_log_term > self.last_term
            || (req.last_log_term == self.last_term && req.last_log_index >= self.last_index);

        let can_grant = up_to_date
            && match &self.meta.voted_for {
                None => true,
                Some(v) => v == &req.candidate_id,
            };

        if can_grant {
            self.meta.voted_for = Some(req.candidate_id.clone());
            if let ServerState::Follower(s) = &mut self.state {
                s.last_heartbeat = now;
            }
        }

        RequestVoteResponse {
            term: self.meta.current_term,
            granted: can_grant,
        }
    }

    pub fn handle_request_vote_response(&mut self, from: &NodeId, resp: &RequestVoteResponse, now: Instant) {
        if resp.term > self.meta.current_term {
            let mut tick = Tick::empty(now);
            self.step_down(resp.term, None, &mut tick);
            return;
        }

        if resp.term < self.meta.current_term || !resp.granted {
            return;
        }

        if let ServerState::Candidate(s) = &mut self.state {
            s.votes_received.insert(from.clone());
        }
    }

    /// Handles an incoming `AppendEntries` RPC. Returns the response to send
    /// back, and (if the RPC carried a new leader state) the decoded blob
    /// for the caller to install as its local replicated state.
    ///
    /// `own_state_blob` is the follower's own serialized state, supplied by
    /// the caller; it's attached to the response on rejection so the leader
    /// can fold it into its own state via an additive merge rather than
    /// discarding whatever this follower knows that the leader doesn't.
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
        own_state_blob: Option<Vec<u8>>,
        now: Instant,
    ) -> (AppendEntriesResponse, Option<Vec<u8>>) {
        if req.term < self.meta.current_term {
            return (
                AppendEntriesResponse {
                    term: self.meta.current_term,
                    success: false,
                    own_state_blob,
                    last_log_index: self.last_index,
                },
                None,
            );
        }

        let was_non_follower = !matches!(self.state, ServerState::Follower(_));
        if req.term > self.meta.current_term || was_non_follower {
            let mut tick = Tick::empty(now);
            self.step_down(req.term, Some(req.leader_id.clone()), &mut tick);
        }

        if let ServerState::Follower(s) = &mut self.state {
            s.last_heartbeat = now;
            s.last_leader_id = Some(req.leader_id.clone());
        }

        self.last_index = self.last_index.max(req.prev_log_index + 1);
        self.last_term = req.term;

        (
            AppendEntriesResponse {
                term: self.meta.current_term,
                success: true,
                own_state_blob: None,
                last_log_index: self.last_index,
            },
            Some(req.state_blob.clone()),
        )
    }

    /// Handles the leader-side response to a previously sent
    /// `AppendEntries`. On rejection with a higher term, steps down and
    /// returns the follower's own state blob so the caller can perform an
    /// additive merge of it into its own state.
    pub fn handle_append_entries_response(
        &mut self,
        from: &NodeId,
        resp: &AppendEntriesResponse,
        now: Instant,
    ) -> Option<Vec<u8>> {
        if resp.term > self.meta.current_term {
            let mut tick = Tick::empty(now);
            self.step_down(resp.term, None, &mut tick);
            return resp.own_state_blob.clone();
        }

        if let ServerState::Leader(s) = &mut self.state {
            if let Some(progress) = s.servers.get_mut(from) {
                progress.request_pending = false;
            }
        }

        if !resp.success {
            return resp.own_state_blob.clone();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> HashSet<NodeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    const ELECTION_TIMEOUT: (Duration, Duration) = (Duration::from_secs(3), Duration::from_secs(7));
    const HEARTBEAT_INTERVAL: (Duration, Duration) = (Duration::from_millis(1000), Duration::from_millis(2900));

    fn new_module(id: &str, members: HashSet<NodeId>, now: Instant) -> ConsensusModule {
        ConsensusModule::new(id.to_string(), members, ELECTION_TIMEOUT, HEARTBEAT_INTERVAL, now)
    }

    #[test]
    fn single_node_cluster_becomes_leader_immediately() {
        let now = Instant::now();
        let mut m = new_module("a", members(&["a"]), now);
        let mut tick = Tick::empty(now);
        m.cycle(&mut tick);
        assert!(m.is_leader());
        assert!(tick.became_leader);
    }

    #[test]
    fn follower_waits_until_election_timeout() {
        let now = Instant::now();
        let mut m = new_module("a", members(&["a", "b", "c"]), now);
        let mut tick = Tick::empty(now);
        m.cycle(&mut tick);
        assert!(!m.is_leader());
        assert!(tick.next_tick.is_some());
    }

    #[test]
    fn wins_election_with_majority_votes() {
        let now = Instant::now();
        let mut m = new_module("a", members(&["a", "b", "c"]), now);

        // Force past the election timeout.
        let later = now + Duration::from_secs(8);
        let mut tick = Tick::empty(later);
        m.cycle(&mut tick);
        assert!(!m.is_leader());
        let term = m.current_term();
        assert_eq!(term, 1);

        m.handle_request_vote_response(
            &"b".to_string(),
            &RequestVoteResponse { term, granted: true },
            later,
        );

        let mut tick2 = Tick::empty(later);
        m.cycle(&mut tick2);
        assert!(m.is_leader());
        assert!(tick2.became_leader);
    }

    #[test]
    fn higher_term_append_entries_converts_leader_to_follower() {
        let now = Instant::now();
        let mut m = new_module("a", members(&["a", "b"]), now);
        // Make "a" the leader of term 1 via the single-peer fast path isn't
        // available (2 members), so drive an election directly.
        let mut tick = Tick::empty(now + Duration::from_secs(8));
        m.cycle(&mut tick);
        m.handle_request_vote_response(
            &"b".to_string(),
            &RequestVoteResponse { term: 1, granted: true },
            tick.time,
        );
        let mut tick2 = Tick::empty(tick.time);
        m.cycle(&mut tick2);
        assert!(m.is_leader());

        let (resp, blob) = m.handle_append_entries(
            &AppendEntriesRequest {
                term: 5,
                leader_id: "b".into(),
                prev_log_index: 0,
                prev_log_term: 5,
                commit_index: 0,
                state_blob: vec![1, 2, 3],
            },
            None,
            tick2.time,
        );
        assert!(resp.success);
        assert_eq!(blob, Some(vec![1, 2, 3]));
        assert!(!m.is_leader());
        assert_eq!(m.current_term(), 5);
    }

    #[test]
    fn stale_term_append_entries_carries_own_state_blob_on_rejection() {
        let now = Instant::now();
        let mut m = new_module("a", members(&["a", "b"]), now);
        m.meta.current_term = 5;

        let (resp, blob) = m.handle_append_entries(
            &AppendEntriesRequest {
                term: 3,
                leader_id: "b".into(),
                prev_log_index: 0,
                prev_log_term: 3,
                commit_index: 0,
                state_blob: vec![],
            },
            Some(vec![9, 9, 9]),
            now,
        );
        assert!(!resp.success);
        assert_eq!(resp.own_state_blob, Some(vec![9, 9, 9]));
        assert_eq!(blob, None);
    }

    #[test]
    fn stale_term_request_vote_is_rejected() {
        let now = Instant::now();
        let mut m = new_module("a", members(&["a", "b"]), now);
        m.meta.current_term = 5;
        let resp = m.handle_request_vote(
            &RequestVoteRequest {
                term: 3,
                candidate_id: "b".into(),
                last_log_index: 0,
                last_log_term: 0,
            },
            now,
        );
        assert!(!resp.granted);
        assert_eq!(resp.term, 5);
    }
}
