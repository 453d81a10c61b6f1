//! TCP peer mesh.
//!
//! Message-oriented, authenticated peer channels: length-prefixed
//! bincode frames, a random-challenge handshake on connect, per-peer
//! bad-message accounting, and an idle sweeper. The mesh verifies
//! signatures, UNL membership, and staleness at the IO edge so the
//! state machines only ever see trusted events.

use hotpocket_messages::{
    decode_envelope, encode_envelope, is_stale, PeerChallenge, PeerChallengeResponse, PeerMessage,
    CHALLENGE_LEN,
};
use hotpocket_types::{epoch_millis, KeyPair, PublicKey, Unl};
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// A verified message delivered to the runner.
#[derive(Debug)]
pub struct MeshInbound {
    /// Session the message arrived on.
    pub session_id: u64,
    /// Sender's node key.
    pub from: PublicKey,
    /// The message.
    pub message: PeerMessage,
}

/// Mesh tunables.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Listen port.
    pub port: u16,
    /// Peers to dial at startup, `host:port`.
    pub known_peers: Vec<String>,
    /// Contract this mesh serves.
    pub contract_id: String,
    /// Kill sessions silent for this long.
    pub idle_timeout: Duration,
    /// Current roundtime for the staleness check.
    pub roundtime_ms: u32,
    /// Our time granularity, advertised in the handshake.
    pub time_config: u32,
    /// Whether we keep full history (advertised in the handshake).
    pub is_full_history: bool,
    /// Only UNL members may hold sessions.
    pub unl_only: bool,
    /// Bad messages tolerated per accounting minute before the peer is
    /// banned for the session (0 = unlimited).
    pub max_bad_msgs_per_min: u32,
}

struct Session {
    tx: mpsc::Sender<Vec<u8>>,
    #[allow(dead_code)]
    pubkey: PublicKey,
    is_full_history: bool,
    needs_forwarding: bool,
    last_activity_ms: u64,
    bad_msgs: u32,
    bad_window_start_ms: u64,
}

/// The peer mesh. The connections map owns sessions; sessions carry a
/// stable opaque id and look the map up, never the reverse.
pub struct PeerMesh {
    key: KeyPair,
    config: MeshConfig,
    unl: Arc<RwLock<Unl>>,
    sessions: Arc<Mutex<HashMap<u64, Session>>>,
    next_session_id: AtomicU64,
    inbound_tx: mpsc::Sender<MeshInbound>,
}

impl PeerMesh {
    /// Start listening, dial the known peers, and return the mesh with
    /// the inbound message stream.
    pub async fn start(
        key: KeyPair,
        config: MeshConfig,
        unl: Arc<RwLock<Unl>>,
    ) -> std::io::Result<(Arc<Self>, mpsc::Receiver<MeshInbound>)> {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let mesh = Arc::new(Self {
            key,
            config,
            unl,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session_id: AtomicU64::new(1),
            inbound_tx,
        });

        let listener = TcpListener::bind(("0.0.0.0", mesh.config.port)).await?;
        info!(port = mesh.config.port, "Peer mesh listening");

        let accept_mesh = Arc::clone(&mesh);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "Inbound peer connection");
                        let mesh = Arc::clone(&accept_mesh);
                        tokio::spawn(async move {
                            if let Err(e) = mesh.run_session(stream).await {
                                debug!(%addr, error = %e, "Peer session ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
            }
        });

        for peer in mesh.config.known_peers.clone() {
            let mesh = Arc::clone(&mesh);
            tokio::spawn(async move {
                loop {
                    match TcpStream::connect(&peer).await {
                        Ok(stream) => {
                            debug!(%peer, "Outbound peer connection established");
                            if let Err(e) = mesh.run_session(stream).await {
                                debug!(%peer, error = %e, "Peer session ended");
                            }
                        }
                        Err(e) => {
                            trace!(%peer, error = %e, "Dial failed");
                        }
                    }
                    // Redial after losing the session.
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            });
        }

        mesh.clone().spawn_idle_sweeper();
        Ok((mesh, inbound_rx))
    }

    /// Send a message to every verified session.
    pub async fn broadcast(&self, message: PeerMessage) {
        let frame = match encode_envelope(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Encoding broadcast failed");
                return;
            }
        };
        let targets: Vec<mpsc::Sender<Vec<u8>>> =
            self.sessions.lock().values().map(|s| s.tx.clone()).collect();
        for tx in targets {
            let _ = tx.send(frame.clone()).await;
        }
    }

    /// Send a message to one session.
    pub async fn send_to(&self, session_id: u64, message: PeerMessage) {
        let Ok(frame) = encode_envelope(message) else {
            return;
        };
        let tx = self.sessions.lock().get(&session_id).map(|s| s.tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(frame).await;
        }
    }

    /// Send a message to one random verified peer, optionally requiring
    /// a full-history peer. Returns the chosen session id.
    pub async fn send_to_random(&self, message: PeerMessage, full_history_only: bool) -> Option<u64> {
        let target = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|(_, s)| !full_history_only || s.is_full_history)
                .map(|(id, s)| (*id, s.tx.clone()))
                .choose(&mut rand::thread_rng())
        };
        let (id, tx) = target?;
        let frame = encode_envelope(message).ok()?;
        tx.send(frame).await.ok()?;
        Some(id)
    }

    /// Number of verified sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    // ── session lifecycle ────────────────────────────────────────────────

    async fn run_session(&self, stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        // Mutual handshake: each side challenges, each side answers.
        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        let hello = encode_envelope(PeerMessage::Challenge(PeerChallenge {
            contract_id: self.config.contract_id.clone(),
            time_config: self.config.time_config,
            is_full_history: self.config.is_full_history,
            challenge,
        }))
        .map_err(io_other)?;
        writer.write_all(&hello).await?;

        let mut peer_pubkey: Option<PublicKey> = None;
        let mut peer_full_history = false;
        let mut answered_theirs = false;

        // Handshake phase: answer their challenge, verify their answer
        // to ours. Full duplex, so either may arrive first.
        while peer_pubkey.is_none() || !answered_theirs {
            let body = read_frame(&mut reader).await?;
            let envelope = decode_envelope(&body).map_err(io_other)?;
            match envelope.content {
                PeerMessage::Challenge(their_challenge) => {
                    if their_challenge.contract_id != self.config.contract_id {
                        debug!("Peer serves a different contract, dropping");
                        return Ok(());
                    }
                    peer_full_history = their_challenge.is_full_history;
                    let answer = encode_envelope(PeerMessage::ChallengeResponse(
                        PeerChallengeResponse {
                            challenge: their_challenge.challenge,
                            pubkey: self.key.public_key(),
                            sig: self.key.sign(&their_challenge.challenge),
                        },
                    ))
                    .map_err(io_other)?;
                    writer.write_all(&answer).await?;
                    answered_theirs = true;
                }
                PeerMessage::ChallengeResponse(response) => {
                    if response.challenge != challenge || !response.verify() {
                        debug!("Peer challenge response failed verification, dropping");
                        return Ok(());
                    }
                    if self.config.unl_only && !self.unl.read().exists(&response.pubkey) {
                        debug!(peer = ?response.pubkey, "Peer not in UNL, dropping");
                        return Ok(());
                    }
                    peer_pubkey = Some(response.pubkey);
                }
                other => {
                    debug!(kind = other.type_name(), "Message before handshake, dropping");
                    return Ok(());
                }
            }
        }
        let pubkey = peer_pubkey.expect("handshake complete");

        // Register the verified session.
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(256);
        self.sessions.lock().insert(
            session_id,
            Session {
                tx,
                pubkey,
                is_full_history: peer_full_history,
                needs_forwarding: false,
                last_activity_ms: epoch_millis(),
                bad_msgs: 0,
                bad_window_start_ms: epoch_millis(),
            },
        );
        info!(session_id, peer = ?pubkey, "Peer session verified");

        // Writer half.
        let write_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        // Reader half.
        let result = self.read_loop(&mut reader, session_id, pubkey).await;

        self.sessions.lock().remove(&session_id);
        write_task.abort();
        info!(session_id, peer = ?pubkey, "Peer session closed");
        result
    }

    async fn read_loop(
        &self,
        reader: &mut tokio::net::tcp::OwnedReadHalf,
        session_id: u64,
        pubkey: PublicKey,
    ) -> std::io::Result<()> {
        loop {
            let body = read_frame(reader).await?;
            let now = epoch_millis();

            let envelope = match decode_envelope(&body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    trace!(session_id, error = %e, "Malformed frame");
                    if self.count_bad_message(session_id, now) {
                        return Ok(());
                    }
                    continue;
                }
            };

            if is_stale(envelope.created_on, now, self.config.roundtime_ms, body.len()) {
                trace!(
                    session_id,
                    kind = envelope.content.type_name(),
                    "Stale peer message dropped"
                );
                continue;
            }

            if !self.verify_and_track(session_id, &envelope.content, now) {
                if self.count_bad_message(session_id, now) {
                    return Ok(());
                }
                continue;
            }

            self.touch(session_id, now);

            // Relay consensus traffic to peers that asked for it (they
            // cannot see the whole UNL themselves).
            if matches!(
                envelope.content,
                PeerMessage::Proposal(_) | PeerMessage::NonUnlProposal { .. }
            ) {
                self.forward_to_needy(session_id, &body).await;
            }

            if self
                .inbound_tx
                .send(MeshInbound {
                    session_id,
                    from: pubkey,
                    message: envelope.content,
                })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }

    /// Re-frame and forward a consensus message to every session that
    /// announced it needs forwarding, except the one it came from.
    async fn forward_to_needy(&self, from_session: u64, body: &[u8]) {
        let targets: Vec<mpsc::Sender<Vec<u8>>> = self
            .sessions
            .lock()
            .iter()
            .filter(|(id, s)| **id != from_session && s.needs_forwarding)
            .map(|(_, s)| s.tx.clone())
            .collect();
        if targets.is_empty() {
            return;
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);
        for tx in targets {
            let _ = tx.send(frame.clone()).await;
        }
    }

    /// Content-level verification at the IO edge. Returns false for
    /// messages that must be dropped silently.
    fn verify_and_track(&self, session_id: u64, message: &PeerMessage, _now: u64) -> bool {
        match message {
            PeerMessage::Proposal(proposal) => {
                if !self.unl.read().exists(&proposal.pubkey) {
                    trace!(from = ?proposal.pubkey, "Proposal signer not in UNL");
                    return false;
                }
                proposal.verify().is_ok()
            }
            PeerMessage::Npl(npl) => {
                self.unl.read().exists(&npl.pubkey) && npl.verify()
            }
            PeerMessage::RequirementAnnouncement(req) => {
                if let Some(session) = self.sessions.lock().get_mut(&session_id) {
                    session.needs_forwarding = req.need_consensus_msg_forwarding;
                }
                true
            }
            // Handshake messages have no business after verification.
            PeerMessage::Challenge(_) | PeerMessage::ChallengeResponse(_) => false,
            _ => true,
        }
    }

    /// Increment the bad-message counter; true means the session must
    /// be dropped (banned for its lifetime).
    fn count_bad_message(&self, session_id: u64, now: u64) -> bool {
        let budget = self.config.max_bad_msgs_per_min;
        if budget == 0 {
            return false;
        }
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(&session_id) else {
            return true;
        };
        if now.saturating_sub(session.bad_window_start_ms) > 60_000 {
            session.bad_window_start_ms = now;
            session.bad_msgs = 0;
        }
        session.bad_msgs += 1;
        if session.bad_msgs > budget {
            warn!(session_id, "Peer exceeded bad-message budget, banning");
            return true;
        }
        false
    }

    fn touch(&self, session_id: u64, now: u64) {
        if let Some(session) = self.sessions.lock().get_mut(&session_id) {
            session.last_activity_ms = now;
        }
    }

    fn spawn_idle_sweeper(self: Arc<Self>) {
        if self.config.idle_timeout.is_zero() {
            return;
        }
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let cutoff = epoch_millis().saturating_sub(self.config.idle_timeout.as_millis() as u64);
                let idle: Vec<u64> = self
                    .sessions
                    .lock()
                    .iter()
                    .filter(|(_, s)| s.last_activity_ms < cutoff)
                    .map(|(id, _)| *id)
                    .collect();
                for session_id in idle {
                    debug!(session_id, "Dropping idle peer session");
                    // Dropping the sender closes the writer; the reader
                    // ends on socket close.
                    self.sessions.lock().remove(&session_id);
                }
            }
        });
    }
}

async fn read_frame(reader: &mut tokio::net::tcp::OwnedReadHalf) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > 64 * 1024 * 1024 {
        return Err(io_other("frame too large"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

fn io_other<E: ToString>(e: E) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpocket_types::test_utils::{test_keypair, test_unl};

    fn mesh_config(port: u16, known: Vec<String>) -> MeshConfig {
        MeshConfig {
            port,
            known_peers: known,
            contract_id: "test-contract".to_string(),
            idle_timeout: Duration::ZERO,
            roundtime_ms: 1000,
            time_config: 1000,
            is_full_history: false,
            unl_only: true,
            max_bad_msgs_per_min: 200,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_and_proposal_delivery() {
        let unl = Arc::new(RwLock::new(test_unl(&[1, 2], 60)));

        let (mesh_a, _rx_a) = PeerMesh::start(
            test_keypair(1),
            mesh_config(36801, vec![]),
            unl.clone(),
        )
        .await
        .unwrap();

        let (mesh_b, mut rx_b) = PeerMesh::start(
            test_keypair(2),
            mesh_config(36802, vec!["127.0.0.1:36801".to_string()]),
            unl.clone(),
        )
        .await
        .unwrap();

        assert!(wait_for(|| mesh_a.session_count() == 1 && mesh_b.session_count() == 1).await);

        // A broadcasts a signed proposal; B's runner receives it.
        let mut proposal = hotpocket_types::Proposal::build(
            hotpocket_types::Stage::Stage0,
            epoch_millis(),
            1000,
        );
        proposal.sign(&test_keypair(1));
        mesh_a
            .broadcast(PeerMessage::Proposal(Box::new(proposal.clone())))
            .await;

        let inbound = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .expect("timeout")
            .expect("closed");
        match inbound.message {
            PeerMessage::Proposal(received) => {
                assert_eq!(received.pubkey, proposal.pubkey);
                assert!(received.verify().is_ok());
            }
            other => panic!("unexpected message: {}", other.type_name()),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_unl_peer_is_rejected() {
        // UNL contains only node 1; node 9 dials in and must be dropped.
        let unl = Arc::new(RwLock::new(test_unl(&[1], 60)));
        let (mesh_a, _rx_a) =
            PeerMesh::start(test_keypair(1), mesh_config(36811, vec![]), unl.clone())
                .await
                .unwrap();

        let outsider_unl = Arc::new(RwLock::new(test_unl(&[1, 9], 60)));
        let (_mesh_b, _rx_b) = PeerMesh::start(
            test_keypair(9),
            mesh_config(36812, vec!["127.0.0.1:36811".to_string()]),
            outsider_unl,
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(mesh_a.session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tampered_proposal_is_dropped_at_the_edge() {
        let unl = Arc::new(RwLock::new(test_unl(&[1, 2], 60)));
        let (mesh_a, _rx_a) =
            PeerMesh::start(test_keypair(1), mesh_config(36821, vec![]), unl.clone())
                .await
                .unwrap();
        let (mesh_b, mut rx_b) = PeerMesh::start(
            test_keypair(2),
            mesh_config(36822, vec!["127.0.0.1:36821".to_string()]),
            unl.clone(),
        )
        .await
        .unwrap();
        assert!(wait_for(|| mesh_a.session_count() == 1 && mesh_b.session_count() == 1).await);

        let mut tampered = hotpocket_types::Proposal::build(
            hotpocket_types::Stage::Stage0,
            epoch_millis(),
            1000,
        );
        tampered.sign(&test_keypair(1));
        tampered.time += 1; // breaks the signature
        mesh_a
            .broadcast(PeerMessage::Proposal(Box::new(tampered)))
            .await;

        let result = tokio::time::timeout(Duration::from_millis(500), rx_b.recv()).await;
        assert!(result.is_err(), "tampered proposal must not be delivered");
    }
}
