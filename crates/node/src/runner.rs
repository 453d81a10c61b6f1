//! The node runner.
//!
//! Owns every I/O surface - timers, peer mesh, user server, vfs actor,
//! execution fence, ledger writer, sync workers - and threads events
//! through the two deterministic state machines (stage engine and input
//! pool), executing the actions they return.

use crate::config::{read_config, ContractCtx, HpConfig, InstanceLock, PatchConfig};
use crate::network::{MeshConfig, MeshInbound, PeerMesh};
use crate::role::RoleController;
use crate::timers::TimerManager;
use crate::user_io::{UserInbound, UserServer};
use hotpocket_consensus::{ConsensusConfig, ConsensusState};
use hotpocket_core::{Action, Event, OutboundMessage, StateMachine};
use hotpocket_executor::{ContractConfig, ExecLimits, ExecutionFence, ExecutionRequest};
use hotpocket_ledger::LedgerStore;
use hotpocket_messages::PeerMessage;
use hotpocket_pool::{PoolConfig, PoolState};
use hotpocket_sync::{LogSyncManager, LogSyncOutcome, StateSyncManager, StateSyncOutcome, SyncTarget};
use hotpocket_types::{epoch_millis, Hash, SeqHash, Unl};
use hotpocket_vfs::{DirFs, VfsClient, VfsMount};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::HistoryMode;

/// How often the sync workers get a driving tick.
const SYNC_TICK: Duration = Duration::from_millis(100);

/// An in-flight ledger catch-up toward the quorum's advertised tail.
#[derive(Debug, Clone, Copy)]
struct LedgerCatchUp {
    /// The quorum's advertised tail hash; catch-up ends when the local
    /// tail matches it.
    tail_hash: Hash,
    /// When the last record run was requested.
    requested_on: Duration,
    /// The local tail when catch-up started; the adopted distance is
    /// the node's real seq_no lag, fed to the role controller.
    start_seq: u64,
}

/// Run the node until shutdown. Fatal errors (config, lock, stores)
/// surface here; peer-sourced errors never do.
pub async fn run(ctx: ContractCtx) -> anyhow::Result<()> {
    let config = read_config(&ctx.config_file)?;
    config.validate()?;
    let _lock = InstanceLock::acquire(&ctx.config_file)?;

    let node = NodeRunner::boot(ctx, config).await?;
    node.run_loop().await
}

struct NodeRunner {
    ctx: ContractCtx,
    config: HpConfig,
    unl: Arc<RwLock<Unl>>,

    consensus: ConsensusState,
    pool: PoolState,
    role: RoleController,

    mount: Arc<DirFs>,
    vfs: VfsClient,
    fence: Arc<ExecutionFence>,
    ledger: Arc<LedgerStore>,
    state_sync: StateSyncManager,
    log_sync: LogSyncManager,

    mesh: Arc<PeerMesh>,
    users: Arc<UserServer>,
    timers: TimerManager,

    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    mesh_rx: mpsc::Receiver<MeshInbound>,
    user_rx: mpsc::Receiver<UserInbound>,

    /// Internal events jump the queue (EventPriority::Internal).
    internal: VecDeque<Event>,
    /// Input digests of the commit in flight, applied to the pool when
    /// the writer confirms.
    pending_commit_inputs: Vec<Hash>,
    /// Quorum-advertised ledger tail we are still pulling records
    /// toward.
    ledger_catch_up: Option<LedgerCatchUp>,
}

impl NodeRunner {
    async fn boot(ctx: ContractCtx, config: HpConfig) -> anyhow::Result<NodeRunner> {
        let key = config.keypair()?;
        let unl = Arc::new(RwLock::new(config.unl()?));

        // Contract filesystem and its actor.
        let mount = Arc::new(DirFs::open(0, &ctx.contract_fs_dir)?);
        seed_patch_file(&mount, &config)?;
        let vfs = VfsClient::spawn(mount.clone() as Arc<dyn VfsMount>);

        let ledger = Arc::new(LedgerStore::open(&ctx.ledger_dir)?);

        // Stage engine, recovered to the ledger tail.
        let consensus_config = ConsensusConfig {
            roundtime_ms: config.contract.consensus.roundtime_ms,
            stage_slice_percent: config.contract.consensus.stage_slice_percent,
            mode: config.contract.consensus.mode,
            full_history: config.node.history == HistoryMode::Full,
        };
        let mut consensus = ConsensusState::new(
            key.clone(),
            config.node.role,
            unl.read().clone(),
            consensus_config.clone(),
        );
        let (state_hash, patch_hash) = mount.state_and_patch_hashes()?;
        consensus.set_chain_tip(
            ledger.lcl(),
            ledger.primary_shard_tail(),
            ledger.raw_shard_tail(),
            state_hash,
            patch_hash,
        );

        let pool = PoolState::new(PoolConfig {
            user_input_bytes: config.contract.round_limits.user_input_bytes,
            max_input_ledger_offset: config.contract.max_input_ledger_offset,
            forward_non_unl: config.mesh.msg_forwarding,
        });

        let fence = Arc::new(ExecutionFence::new(
            vfs.clone(),
            key.clone(),
            contract_config(&config),
            ctx.exec_dir.clone(),
        ));

        let resubmit = consensus_config.resubmit_timeout();
        let state_sync =
            StateSyncManager::new(mount.clone() as Arc<dyn VfsMount>, resubmit);
        let log_sync = LogSyncManager::new(
            mount.clone() as Arc<dyn VfsMount>,
            ledger.clone(),
            resubmit,
        );

        let (mesh, mesh_rx) = PeerMesh::start(
            key.clone(),
            MeshConfig {
                port: config.mesh.port,
                known_peers: config.mesh.known_peers.clone(),
                contract_id: config.contract.id.clone(),
                idle_timeout: Duration::from_millis(config.mesh.idle_timeout_ms),
                roundtime_ms: config.contract.consensus.roundtime_ms,
                time_config: config.contract.consensus.roundtime_ms,
                is_full_history: config.node.history == HistoryMode::Full,
                unl_only: config.contract.consensus.mode
                    == hotpocket_consensus::ConsensusMode::Private,
                max_bad_msgs_per_min: config.mesh.max_bad_msgs_per_min,
            },
            unl.clone(),
        )
        .await?;

        let (users, user_rx) =
            UserServer::start(config.user.port, config.user.max_bad_msgs_per_min).await?;

        let (event_tx, event_rx) = mpsc::channel(4096);
        let timers = TimerManager::new(event_tx.clone());

        info!(
            contract = %config.contract.id,
            lcl = %ledger.lcl(),
            role = ?config.node.role,
            "Node booted"
        );

        Ok(NodeRunner {
            role: RoleController::new(config.node.role),
            ctx,
            config,
            unl,
            consensus,
            pool,
            mount,
            vfs,
            fence,
            ledger,
            state_sync,
            log_sync,
            mesh,
            users,
            timers,
            event_tx,
            event_rx,
            mesh_rx,
            user_rx,
            internal: VecDeque::new(),
            pending_commit_inputs: Vec::new(),
            ledger_catch_up: None,
        })
    }

    async fn run_loop(mut self) -> anyhow::Result<()> {
        // Arm the first stage timer.
        let startup = self.consensus.start();
        for action in startup {
            self.dispatch(action).await;
        }

        let mut sync_interval = tokio::time::interval(SYNC_TICK);
        loop {
            // Internal events first, preserving causality.
            if let Some(event) = self.internal.pop_front() {
                self.process_event(event).await;
                continue;
            }

            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    self.process_event(event).await;
                }
                Some(inbound) = self.mesh_rx.recv() => {
                    self.process_mesh(inbound).await;
                }
                Some(inbound) = self.user_rx.recv() => {
                    self.process_user(inbound).await;
                }
                _ = sync_interval.tick() => {
                    self.drive_sync().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.timers.cancel_all();
        crate::config::write_config(&self.ctx.config_file, &self.config)?;
        info!("Clean shutdown");
        Ok(())
    }

    async fn process_event(&mut self, event: Event) {
        let now = Duration::from_millis(epoch_millis());
        self.consensus.set_now(now);
        self.pool.set_now(now);

        // The pool learns about committed inputs before the machines see
        // the event, so replay windows are current within the same tick.
        if let Event::LedgerCommitted { .. } = &event {
            let inputs = std::mem::take(&mut self.pending_commit_inputs);
            self.pool.committed(&inputs);
        }

        let mut actions = self.consensus.handle(event.clone());
        actions.extend(self.pool.handle(event));
        for action in actions {
            self.dispatch(action).await;
        }
    }

    async fn process_mesh(&mut self, inbound: MeshInbound) {
        match inbound.message {
            PeerMessage::Proposal(proposal) => {
                self.process_event(Event::ProposalReceived {
                    proposal: *proposal,
                })
                .await;
            }
            PeerMessage::NonUnlProposal { user_inputs } => {
                self.process_event(Event::NonUnlInputsReceived {
                    inputs: user_inputs,
                })
                .await;
            }
            PeerMessage::Npl(npl) => {
                self.process_event(Event::NplReceived { npl }).await;
            }
            PeerMessage::HpfsRequest(request) => {
                if let Some(response) = self.state_sync.serve(&request) {
                    self.mesh
                        .send_to(inbound.session_id, PeerMessage::HpfsResponse(response))
                        .await;
                }
            }
            PeerMessage::HpfsResponse(response) => {
                let outcomes = self.state_sync.on_response(response);
                self.handle_state_sync_outcomes(outcomes).await;
            }
            PeerMessage::HpfsLogRequest(request) => {
                if let Some(response) = self.log_sync.serve(&request) {
                    self.mesh
                        .send_to(inbound.session_id, PeerMessage::HpfsLogResponse(response))
                        .await;
                }
            }
            PeerMessage::HpfsLogResponse(response) => {
                let outcomes = self.log_sync.on_response(response);
                self.handle_log_sync_outcomes(outcomes).await;
            }
            PeerMessage::LedgerRequest(request) => {
                let records = self.ledger.read_run(
                    request.min_seq_no,
                    hotpocket_messages::LEDGER_SYNC_BATCH,
                );
                match records {
                    Ok(records) if !records.is_empty() => {
                        self.mesh
                            .send_to(
                                inbound.session_id,
                                PeerMessage::LedgerResponse(
                                    hotpocket_messages::LedgerResponse { records },
                                ),
                            )
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Serving ledger records failed"),
                }
            }
            PeerMessage::LedgerResponse(response) => {
                let Some(catch_up) = self.ledger_catch_up else {
                    return;
                };
                match self.ledger.adopt_records(&response.records) {
                    Ok(adopted) if adopted > 0 => {
                        debug!(adopted, lcl = %self.ledger.lcl(), "Ledger records adopted");
                        self.refresh_chain_tip();

                        // The adopted distance is how far behind the
                        // UNL's ledger this node actually was; past the
                        // controller's threshold it costs validator
                        // status until catch-up completes.
                        let behind_by = self
                            .ledger
                            .lcl()
                            .seq_no
                            .saturating_sub(catch_up.start_seq);
                        if let Some(role) = self.role.on_seq_lag(behind_by) {
                            self.consensus.set_role(role);
                        }

                        // Ask for the next run without waiting out the
                        // resubmit timer.
                        self.ledger_catch_up = Some(LedgerCatchUp {
                            requested_on: Duration::ZERO,
                            ..catch_up
                        });
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Adopting ledger records failed"),
                }
            }
            PeerMessage::PeerListRequest => {
                let peers = self
                    .config
                    .mesh
                    .known_peers
                    .iter()
                    .map(|addr| {
                        let (host, port) = addr
                            .rsplit_once(':')
                            .map(|(h, p)| (h.to_string(), p.parse().unwrap_or(0)))
                            .unwrap_or((addr.clone(), 0));
                        hotpocket_messages::PeerProperties {
                            host_address: host,
                            port,
                            timestamp: epoch_millis(),
                            available_capacity: -1,
                        }
                    })
                    .collect();
                self.mesh
                    .send_to(
                        inbound.session_id,
                        PeerMessage::PeerListResponse { peers },
                    )
                    .await;
            }
            // Tracked by the mesh itself or intentionally inert.
            PeerMessage::PeerListResponse { .. }
            | PeerMessage::CapacityAnnouncement(_)
            | PeerMessage::RequirementAnnouncement(_)
            | PeerMessage::Suppress(_)
            | PeerMessage::Challenge(_)
            | PeerMessage::ChallengeResponse(_) => {}
        }
    }

    async fn process_user(&mut self, inbound: UserInbound) {
        match inbound {
            UserInbound::Input(input) => {
                self.process_event(Event::UserInputSubmitted { input }).await;
            }
            UserInbound::ReadRequest {
                session_id, blob, ..
            } => {
                self.spawn_read_request(session_id, blob);
            }
        }
    }

    async fn dispatch(&mut self, action: Action) {
        match action {
            Action::Broadcast { message } => {
                self.mesh.broadcast(to_peer_message(message)).await;
            }
            Action::SendTo { session_id, message } => {
                self.mesh.send_to(session_id, to_peer_message(message)).await;
            }
            Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),
            Action::CancelTimer { id } => self.timers.cancel_timer(id),
            Action::EnqueueInternal { event } => self.internal.push_back(event),

            Action::StartExecution {
                seq_no,
                time,
                users,
                input_hashes,
                npl_messages,
            } => {
                if !self.config.contract.execute {
                    self.internal.push_back(Event::ExecutionFailed {
                        reason: "execution disabled".to_string(),
                    });
                    return;
                }
                let inputs = self.pool.resolve(&input_hashes);
                if inputs.len() != input_hashes.len() {
                    warn!(
                        expected = input_hashes.len(),
                        resolved = inputs.len(),
                        "Some admitted inputs are missing from the pool"
                    );
                }
                let request = ExecutionRequest {
                    seq_no,
                    time,
                    users,
                    inputs,
                    npl_messages,
                };
                let fence = Arc::clone(&self.fence);
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let event = match fence.execute(request).await {
                        Ok(result) => Event::ExecutionCompleted {
                            result: Box::new(result),
                        },
                        Err(e) => Event::ExecutionFailed {
                            reason: e.to_string(),
                        },
                    };
                    let _ = event_tx.send(event).await;
                });
            }

            Action::CommitLedger {
                record,
                users,
                input_hashes,
                outputs,
            } => {
                let inputs = self.pool.resolve(&input_hashes);
                self.pending_commit_inputs = input_hashes;
                let ledger = Arc::clone(&self.ledger);
                let event_tx = self.event_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let event = match ledger.append(&record, &users, &inputs, &outputs) {
                        Ok(()) => Event::LedgerCommitted {
                            record,
                            primary_shard: ledger.primary_shard_tail(),
                            raw_shard: ledger.raw_shard_tail(),
                        },
                        Err(e) => Event::LedgerCommitFailed {
                            reason: e.to_string(),
                        },
                    };
                    let _ = event_tx.blocking_send(event);
                });
            }

            Action::PromoteState { seq_no } => {
                let vfs = self.vfs.clone();
                let full_history = self.config.node.history == HistoryMode::Full;
                tokio::spawn(async move {
                    if let Err(e) = vfs.promote_rw().await {
                        error!(error = %e, "Promoting state failed");
                    }
                    if full_history {
                        if let Err(e) = vfs.update_log_index(seq_no).await {
                            error!(error = %e, "Updating log index failed");
                        }
                    }
                    if let Err(e) = vfs.release_rw().await {
                        debug!(error = %e, "RW release after promote");
                    }
                });
            }

            Action::RevertState => {
                let vfs = self.vfs.clone();
                tokio::spawn(async move {
                    if let Err(e) = vfs.revert_rw().await {
                        debug!(error = %e, "Revert with no RW session held");
                    }
                    let _ = vfs.release_rw().await;
                });
            }

            Action::ApplyPatch => self.apply_patch(),

            Action::StartStateSync {
                state_hash,
                patch_hash,
                ledger_tail_hash,
            } => {
                self.start_ledger_catch_up(ledger_tail_hash);
                if let Err(e) = self.state_sync.set_target(SyncTarget {
                    state_hash,
                    patch_hash,
                }) {
                    warn!(error = %e, "Starting state sync failed");
                    self.internal.push_back(Event::StateSyncAbandoned);
                }
            }

            Action::StartLogSync {
                target,
                ledger_tail_hash,
            } => {
                self.start_ledger_catch_up(ledger_tail_hash);
                if let Some(outcome) = self.log_sync.set_target(target) {
                    self.handle_log_sync_outcomes(vec![outcome]).await;
                }
            }

            Action::EmitUserOutputs { seq_no, outputs } => {
                self.users.send_outputs(seq_no, &outputs).await;
            }
            Action::EmitInputStatus {
                pubkey,
                input_hash,
                status,
            } => {
                self.users.send_status(pubkey, input_hash, status).await;
            }

            Action::NotifyRoundOutcome {
                committed,
                contributed,
                ..
            } => {
                if let Some(role) = self.role.on_round_outcome(committed, contributed) {
                    self.consensus.set_role(role);
                }
            }
        }
    }

    async fn drive_sync(&mut self) {
        let now = Duration::from_millis(epoch_millis());

        let outcomes = self.state_sync.tick(now);
        self.handle_state_sync_outcomes(outcomes).await;

        let outcomes = self.log_sync.tick(now);
        self.handle_log_sync_outcomes(outcomes).await;

        self.drive_ledger_catch_up(now).await;
    }

    /// Start pulling ledger records toward the quorum's tail.
    fn start_ledger_catch_up(&mut self, tail_hash: Hash) {
        if tail_hash.is_zero() || self.ledger.lcl().hash == tail_hash {
            return;
        }
        if self.ledger_catch_up.map(|c| c.tail_hash) != Some(tail_hash) {
            info!(tail = ?tail_hash, "Ledger catch-up starting");
            self.ledger_catch_up = Some(LedgerCatchUp {
                tail_hash,
                requested_on: Duration::ZERO,
                start_seq: self.ledger.lcl().seq_no,
            });
        }
    }

    async fn drive_ledger_catch_up(&mut self, now: Duration) {
        let Some(catch_up) = self.ledger_catch_up else {
            return;
        };
        if self.ledger.lcl().hash == catch_up.tail_hash {
            info!(lcl = %self.ledger.lcl(), "Ledger caught up with the quorum tail");
            self.ledger_catch_up = None;
            self.refresh_chain_tip();
            if !self.state_sync.is_syncing() && !self.log_sync.is_syncing() {
                if let Some(role) = self.role.on_caught_up() {
                    self.consensus.set_role(role);
                }
            }
            return;
        }
        let resubmit = Duration::from_millis(
            (self.config.contract.consensus.roundtime_ms as u64 * 7) / 10,
        );
        if now.saturating_sub(catch_up.requested_on) <= resubmit {
            return;
        }
        let request = hotpocket_messages::LedgerRequest {
            min_seq_no: self.ledger.lcl().seq_no + 1,
        };
        if self
            .mesh
            .send_to_random(PeerMessage::LedgerRequest(request), false)
            .await
            .is_some()
        {
            self.ledger_catch_up = Some(LedgerCatchUp {
                requested_on: now,
                ..catch_up
            });
        }
    }

    /// Point the stage engine at the current store tail and vfs roots.
    fn refresh_chain_tip(&mut self) {
        let (state_hash, patch_hash) = match self.mount.state_and_patch_hashes() {
            Ok(hashes) => hashes,
            Err(e) => {
                warn!(error = %e, "Reading vfs roots failed");
                return;
            }
        };
        self.consensus.set_chain_tip(
            self.ledger.lcl(),
            self.ledger.primary_shard_tail(),
            self.ledger.raw_shard_tail(),
            state_hash,
            patch_hash,
        );
    }

    async fn handle_state_sync_outcomes(&mut self, outcomes: Vec<StateSyncOutcome>) {
        for outcome in outcomes {
            match outcome {
                StateSyncOutcome::Request(request) => {
                    if self
                        .mesh
                        .send_to_random(PeerMessage::HpfsRequest(request), false)
                        .await
                        .is_none()
                    {
                        debug!("No peer available for state sync request");
                    }
                }
                StateSyncOutcome::Completed(target) => {
                    // Re-promotion waits for the ledger tail too.
                    if self.ledger_catch_up.is_none() {
                        if let Some(role) = self.role.on_caught_up() {
                            self.consensus.set_role(role);
                        }
                    }
                    self.process_event(Event::StateSyncCompleted {
                        state_hash: target.state_hash,
                        patch_hash: target.patch_hash,
                    })
                    .await;
                }
                StateSyncOutcome::Abandoned => {
                    self.process_event(Event::StateSyncAbandoned).await;
                }
            }
        }
    }

    async fn handle_log_sync_outcomes(&mut self, outcomes: Vec<LogSyncOutcome>) {
        for outcome in outcomes {
            match outcome {
                LogSyncOutcome::Request(request) => {
                    if self
                        .mesh
                        .send_to_random(PeerMessage::HpfsLogRequest(request), true)
                        .await
                        .is_none()
                    {
                        debug!("No full-history peer available for log sync");
                    }
                }
                LogSyncOutcome::Completed {
                    target,
                    state_hash,
                    patch_hash,
                } => {
                    // Re-promotion waits for the ledger tail too.
                    if self.ledger_catch_up.is_none() {
                        if let Some(role) = self.role.on_caught_up() {
                            self.consensus.set_role(role);
                        }
                    }
                    self.process_event(Event::LogSyncCompleted {
                        target,
                        state_hash,
                        patch_hash,
                    })
                    .await;
                }
                LogSyncOutcome::Abandoned => {
                    self.process_event(Event::LogSyncAbandoned).await;
                }
            }
        }
    }

    /// Re-read `patch.cfg` from the canonical tree and apply the
    /// consensus-mutable subset.
    fn apply_patch(&mut self) {
        let path = self.mount.physical_path("seed", hotpocket_vfs::PATCH_FILE_PATH);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "Reading patch.cfg failed");
                return;
            }
        };
        let patch: PatchConfig = match serde_json::from_slice(&bytes) {
            Ok(patch) => patch,
            Err(e) => {
                warn!(error = %e, "patch.cfg did not parse, keeping current config");
                return;
            }
        };

        self.config.apply_patch(patch);
        match self.config.unl() {
            Ok(new_unl) => {
                *self.unl.write() = new_unl.clone();
                self.consensus.set_unl(new_unl);
            }
            Err(e) => warn!(error = %e, "Patched UNL invalid, keeping current"),
        }
        self.pool.set_config(PoolConfig {
            user_input_bytes: self.config.contract.round_limits.user_input_bytes,
            max_input_ledger_offset: self.config.contract.max_input_ledger_offset,
            forward_non_unl: self.config.mesh.msg_forwarding,
        });
        // Patch fields never include the node keys.
        if let Ok(key) = self.config.keypair() {
            self.fence = Arc::new(ExecutionFence::new(
                self.vfs.clone(),
                key,
                contract_config(&self.config),
                self.ctx.exec_dir.clone(),
            ));
        }
        if let Err(e) = crate::config::write_config(&self.ctx.config_file, &self.config) {
            warn!(error = %e, "Persisting patched config failed");
        }
        info!("Patch config applied");
    }

    /// Contract read requests run the binary read-only against the
    /// canonical state and return its stdout.
    fn spawn_read_request(&self, session_id: u64, blob: Vec<u8>) {
        if !self.config.contract.execute {
            return;
        }
        let users = Arc::clone(&self.users);
        let bin = PathBuf::from(&self.config.contract.bin_path);
        let state_root = self.mount.physical_path("seed", hotpocket_vfs::STATE_DIR_PATH);
        let output_cap = self.config.contract.round_limits.user_output_bytes as usize;

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut child = match tokio::process::Command::new(&bin)
                .current_dir(&state_root)
                .env("HP_READONLY", "1")
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    debug!(error = %e, "Read request spawn failed");
                    return;
                }
            };
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(&blob).await;
            }
            match tokio::time::timeout(Duration::from_secs(10), child.wait_with_output()).await {
                Ok(Ok(output)) => {
                    let mut content = output.stdout;
                    content.truncate(output_cap);
                    users.send_read_response(session_id, content).await;
                }
                _ => debug!("Read request timed out or failed"),
            }
        });
    }
}

fn contract_config(config: &HpConfig) -> ContractConfig {
    ContractConfig {
        bin_path: PathBuf::from(&config.contract.bin_path),
        bin_args: config.contract.bin_args.clone(),
        environment: config.contract.environment.clone(),
        run_as: config.contract.run_as,
        limits: ExecLimits {
            proc_cpu_seconds: config.contract.round_limits.proc_cpu_seconds,
            proc_mem_bytes: config.contract.round_limits.proc_mem_bytes,
            proc_ofd_count: config.contract.round_limits.proc_ofd_count,
            exec_timeout: Duration::from_millis(config.contract.round_limits.exec_timeout_ms),
        },
    }
}

fn to_peer_message(message: OutboundMessage) -> PeerMessage {
    match message {
        OutboundMessage::Proposal(proposal) => PeerMessage::Proposal(proposal),
        OutboundMessage::NonUnlProposal { user_inputs } => {
            PeerMessage::NonUnlProposal { user_inputs }
        }
        OutboundMessage::Npl(npl) => PeerMessage::Npl(npl),
        OutboundMessage::HpfsRequest(request) => PeerMessage::HpfsRequest(request),
        OutboundMessage::HpfsResponse(response) => PeerMessage::HpfsResponse(response),
        OutboundMessage::HpfsLogRequest(request) => PeerMessage::HpfsLogRequest(request),
        OutboundMessage::HpfsLogResponse(response) => PeerMessage::HpfsLogResponse(response),
    }
}

/// Write the initial `patch.cfg` into the vfs when it is empty, so the
/// patch hash participates in consensus from the first round.
fn seed_patch_file(mount: &DirFs, config: &HpConfig) -> anyhow::Result<()> {
    let seed_path = mount.physical_path("seed", hotpocket_vfs::PATCH_FILE_PATH);
    let existing = std::fs::read(&seed_path).unwrap_or_default();
    if !existing.is_empty() {
        return Ok(());
    }
    let json = serde_json::to_vec_pretty(&config.patch())?;
    mount.acquire_rw()?;
    std::fs::write(
        mount.physical_path(hotpocket_vfs::RW_SESSION_NAME, hotpocket_vfs::PATCH_FILE_PATH),
        json,
    )?;
    mount.promote_rw()?;
    mount.release_rw()?;
    info!("Seeded patch.cfg into the contract filesystem");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContractCtx;
    use hotpocket_types::KeyPair;

    #[test]
    fn outbound_mapping_is_total() {
        let kp = KeyPair::generate();
        let npl = hotpocket_messages::NplMessage::sign_new(&kp, vec![1], SeqHash::genesis());
        let mapped = to_peer_message(OutboundMessage::Npl(npl));
        assert_eq!(mapped.type_name(), "Npl");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn boot_seeds_patch_and_recovers_tip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContractCtx::new(dir.path().join("contract"));
        ctx.create_new().unwrap();

        let mut config = read_config(&ctx.config_file).unwrap();
        // Unused ports so parallel tests do not collide.
        config.mesh.port = 39371;
        config.user.port = 39372;
        crate::config::write_config(&ctx.config_file, &config).unwrap();
        let config = read_config(&ctx.config_file).unwrap();

        let runner = NodeRunner::boot(ctx.clone(), config).await.unwrap();
        assert_eq!(runner.consensus.lcl(), SeqHash::genesis());

        // patch.cfg was seeded and parses back to the config subset.
        let patch_path = runner
            .mount
            .physical_path("seed", hotpocket_vfs::PATCH_FILE_PATH);
        let patch: PatchConfig =
            serde_json::from_slice(&std::fs::read(patch_path).unwrap()).unwrap();
        assert_eq!(patch, runner.config.patch());
    }
}
