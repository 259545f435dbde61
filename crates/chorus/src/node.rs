//! `Node`: the top-level owned value wiring `ConsensusCore`,
//! `LeaderCoordinator`, and the two local stores together. Constructed once
//! at process startup and passed explicitly to whatever external HTTP
//! layer a deployment wires in; no module here reaches for a process-wide
//! singleton or cached instance.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use chorus_raft::{ConsensusModule, Tick};
use chorus_util::dir_lock::DirLock;

use crate::client_facade::ClientFacade;
use crate::config::NodeConfig;
use crate::errors::Result;
use crate::file_sharding::FileShardingCoordinator;
use crate::global_index::{GlobalIndex, NodeId};
use crate::journal::OperationJournal;
use crate::leader_coordinator::LeaderCoordinator;
use crate::local_meta_store::{InMemoryMetaStore, MetaStore};
use crate::local_range_store::{FsRangeStore, RangeStore};
use crate::metadata_protocol::MetadataProtocol;
use crate::peer_directory::PeerDirectory;
use crate::peer_rpc::PeerTransport;

pub struct Node {
    id: NodeId,
    config: Arc<NodeConfig>,
    consensus: Arc<StdMutex<ConsensusModule>>,
    transport: Arc<dyn PeerTransport>,
    peer_directory: Arc<dyn PeerDirectory>,
    index: Arc<RwLock<GlobalIndex>>,
    journal: Arc<OperationJournal>,
    meta_store: Arc<dyn MetaStore>,
    range_store: Arc<dyn RangeStore>,
    leader_coordinator: Arc<LeaderCoordinator>,
    /// Keeps the data directory exclusively locked for this process's
    /// lifetime.
    _dir_lock: DirLock,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub async fn new(
        id: NodeId,
        config: NodeConfig,
        transport: Arc<dyn PeerTransport>,
        peer_directory: Arc<dyn PeerDirectory>,
    ) -> Result<Arc<Self>> {
        let dir_lock = DirLock::open(&config.dir)?;
        let range_store: Arc<dyn RangeStore> = Arc::new(FsRangeStore::new(config.dir.clone()));
        let meta_store: Arc<dyn MetaStore> = Arc::new(InMemoryMetaStore::new());
        let journal = Arc::new(OperationJournal::open(&config.dir, id.clone()).await?);

        for entry in journal.pending_entries().await {
            let outcome = meta_store.prepare(&entry.task_id, entry.op, entry.entity.clone()).await?;
            if matches!(
                outcome,
                crate::local_meta_store::ApplyOutcome::Applied | crate::local_meta_store::ApplyOutcome::AlreadyApplied
            ) {
                meta_store.commit(&entry.task_id).await?;
            }
            journal.mark_completed(&entry.task_id).await?;
        }

        let index = Arc::new(RwLock::new(GlobalIndex::new()));
        let config = Arc::new(config);

        let consensus = Arc::new(StdMutex::new(ConsensusModule::new(
            id.clone(),
            HashSet::from([id.clone()]),
            config.election_timeout_range(),
            config.heartbeat_range(),
            Instant::now(),
        )));

        let leader_coordinator = Arc::new(LeaderCoordinator::new(
            id.clone(),
            config.clone(),
            transport.clone(),
            peer_directory.clone(),
            index.clone(),
            journal.clone(),
            meta_store.clone(),
            range_store.clone(),
        ));

        Ok(Arc::new(Node {
            id,
            config,
            consensus,
            transport,
            peer_directory,
            index,
            journal,
            meta_store,
            range_store,
            leader_coordinator,
            _dir_lock: dir_lock,
            driver: StdMutex::new(None),
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.lock().unwrap().is_leader()
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.consensus.lock().unwrap().leader_hint()
    }

    pub async fn live_nodes(&self) -> HashSet<NodeId> {
        let mut live = HashSet::new();
        live.insert(self.id.clone());
        if let Ok(discovered) = self.peer_directory.discover().await {
            for p in discovered {
                live.insert(p.ip);
            }
        }
        live
    }

    pub async fn index_snapshot(&self) -> GlobalIndex {
        self.index.read().await.clone()
    }

    /// Accessors used by the HTTP peer layer to service inbound RPCs that
    /// target this node directly (every `PeerTransport` method besides the
    /// consensus ones is, server-side, just a call into one of these).
    pub fn meta_store(&self) -> Arc<dyn MetaStore> {
        self.meta_store.clone()
    }

    pub fn range_store(&self) -> Arc<dyn RangeStore> {
        self.range_store.clone()
    }

    pub fn journal(&self) -> Arc<OperationJournal> {
        self.journal.clone()
    }

    /// Builds a fresh [`ClientFacade`] bound to the node's current term and
    /// leadership state. Cheap: everything it wraps is an `Arc` clone.
    pub async fn client_facade(self: &Arc<Self>) -> ClientFacade {
        let term = self.consensus.lock().unwrap().current_term();
        let metadata = MetadataProtocol::new(
            self.id.clone(),
            term,
            self.transport.clone(),
            self.meta_store.clone(),
            self.journal.clone(),
            self.index.clone(),
        );
        let sharding = FileShardingCoordinator::new(
            self.id.clone(),
            self.config.clone(),
            self.transport.clone(),
            self.range_store.clone(),
            self.index.clone(),
        );

        let is_leader = self.is_leader();
        let leader_hint = self.leader_hint();
        let live = self.live_nodes().await;

        ClientFacade::new(is_leader, leader_hint, live, metadata, sharding)
    }

    /// Starts the consensus driver loop (election/heartbeat ticking and
    /// peer message dispatch) and, implicitly, the leader coordinator once
    /// this node wins an election. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut driver = self.driver.lock().unwrap();
        if driver.is_some() {
            return;
        }
        let this = self.clone();
        *driver = Some(tokio::spawn(async move { this.drive_consensus().await }));
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.driver.lock().unwrap().take() {
            handle.abort();
        }
        self.leader_coordinator.stop().await;
    }

    async fn drive_consensus(self: Arc<Self>) {
        loop {
            let members = self.live_nodes().await;
            {
                let mut consensus = self.consensus.lock().unwrap();
                consensus.set_members(members);
            }

            if self.is_leader() {
                if let Ok(blob) = self.index.read().await.to_blob() {
                    let mut consensus = self.consensus.lock().unwrap();
                    let _ = consensus.propose_state(blob);
                }
            }

            let mut tick = Tick::empty(Instant::now());
            let wait = {
                let mut consensus = self.consensus.lock().unwrap();
                consensus.cycle(&mut tick);
                tick.next_tick
            };

            if tick.became_leader {
                self.journal.set_become_new_leader(true).await.ok();
                self.leader_coordinator.start().await;
                tracing::info!(node = %self.id, "node became leader");
            }
            if tick.stepped_down {
                self.leader_coordinator.stop().await;
                tracing::info!(node = %self.id, "node stepped down");
            }

            for message in tick.messages {
                self.dispatch(message).await;
            }

            tokio::time::sleep(wait.unwrap_or(std::time::Duration::from_millis(200))).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, message: chorus_raft::Message) {
        use chorus_raft::MessageBody;
        match message.body {
            MessageBody::RequestVote(req) => {
                if let Ok(resp) = self.transport.request_vote(&message.to, req).await {
                    let mut consensus = self.consensus.lock().unwrap();
                    consensus.handle_request_vote_response(&message.to, &resp, Instant::now());
                }
            }
            MessageBody::AppendEntries(req) => {
                match self.transport.append_entries(&message.to, req).await {
                    Ok(resp) => {
                        let merge_blob = {
                            let mut consensus = self.consensus.lock().unwrap();
                            consensus.handle_append_entries_response(&message.to, &resp, Instant::now())
                        };
                        if let Some(blob) = merge_blob {
                            if let Ok(other) = GlobalIndex::from_blob(&blob) {
                                self.index.write().await.merge_additive(&other);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(to = %message.to, error = %e, "append_entries failed, will retry next cycle");
                    }
                }
            }
        }
    }

    /// Server-side handling of an inbound `RequestVote`, for whatever peer
    /// RPC listener a deployment binds to this node.
    pub fn handle_request_vote(&self, req: chorus_raft::RequestVoteRequest) -> chorus_raft::RequestVoteResponse {
        self.consensus.lock().unwrap().handle_request_vote(&req, Instant::now())
    }

    /// Server-side handling of an inbound `AppendEntries`. Installs the
    /// leader's replicated `GlobalIndex` blob wholesale on success; on
    /// rejection, attaches this node's own serialized index to the response
    /// so the leader can fold it in via an additive merge.
    pub async fn handle_append_entries(&self, req: chorus_raft::AppendEntriesRequest) -> chorus_raft::AppendEntriesResponse {
        let own_blob = self.index.read().await.to_blob().ok();
        let (resp, blob) = {
            let mut consensus = self.consensus.lock().unwrap();
            consensus.handle_append_entries(&req, own_blob, Instant::now())
        };
        if let Some(blob) = blob {
            if let Ok(incoming) = GlobalIndex::from_blob(&blob) {
                *self.index.write().await = incoming;
            }
        }
        resp
    }
}
