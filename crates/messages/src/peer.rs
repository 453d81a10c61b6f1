//! Peer-to-peer message envelope and handshake messages.

use crate::hpfs::{HpfsLogRequest, HpfsLogResponse, HpfsRequest, HpfsResponse};
use crate::ledger_sync::{LedgerRequest, LedgerResponse};
use crate::npl::NplMessage;
use hotpocket_types::{Proposal, PublicKey, Signature, UserInput};
use serde::{Deserialize, Serialize};

/// Wire protocol version, bumped on incompatible changes.
pub const PROTOCOL_VERSION: [u8; 3] = [0, 3, 0];

/// Length of the random handshake challenge.
pub const CHALLENGE_LEN: usize = 16;

/// The outer envelope every peer message travels in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEnvelope {
    /// Sender's protocol version.
    pub version: [u8; 3],
    /// Sender's wall clock at send time, ms.
    pub created_on: u64,
    /// The message itself.
    pub content: PeerMessage,
}

/// Every message a peer can send.
///
/// Dispatch points match exhaustively; adding a variant is a protocol
/// change and must bump [`PROTOCOL_VERSION`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Server's opening handshake.
    Challenge(PeerChallenge),
    /// Client's signed handshake answer.
    ChallengeResponse(PeerChallengeResponse),
    /// A consensus stage proposal.
    Proposal(Box<Proposal>),
    /// User inputs relayed on behalf of a non-UNL observer.
    NonUnlProposal { user_inputs: Vec<UserInput> },
    /// Node-party-line gossip.
    Npl(NplMessage),
    /// State-sync subtree request.
    HpfsRequest(HpfsRequest),
    /// State-sync subtree response.
    HpfsResponse(HpfsResponse),
    /// Full-history log request.
    HpfsLogRequest(HpfsLogRequest),
    /// Full-history log response.
    HpfsLogResponse(HpfsLogResponse),
    /// Ledger record catch-up request.
    LedgerRequest(LedgerRequest),
    /// Ledger record catch-up response.
    LedgerResponse(LedgerResponse),
    /// Ask a peer for its known-peer list.
    PeerListRequest,
    /// Known-peer list answer.
    PeerListResponse { peers: Vec<PeerProperties> },
    /// Periodic capacity advertisement.
    CapacityAnnouncement(PeerCapacityAnnouncement),
    /// Requirement advertisement (message forwarding).
    RequirementAnnouncement(PeerRequirementAnnouncement),
    /// Ask peers to stop relaying traffic for a pubkey.
    Suppress(SuppressMessage),
}

impl PeerMessage {
    /// Message type name for logs and counters.
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::Challenge(_) => "Challenge",
            PeerMessage::ChallengeResponse(_) => "ChallengeResponse",
            PeerMessage::Proposal(_) => "Proposal",
            PeerMessage::NonUnlProposal { .. } => "NonUnlProposal",
            PeerMessage::Npl(_) => "Npl",
            PeerMessage::HpfsRequest(_) => "HpfsRequest",
            PeerMessage::HpfsResponse(_) => "HpfsResponse",
            PeerMessage::HpfsLogRequest(_) => "HpfsLogRequest",
            PeerMessage::HpfsLogResponse(_) => "HpfsLogResponse",
            PeerMessage::LedgerRequest(_) => "LedgerRequest",
            PeerMessage::LedgerResponse(_) => "LedgerResponse",
            PeerMessage::PeerListRequest => "PeerListRequest",
            PeerMessage::PeerListResponse { .. } => "PeerListResponse",
            PeerMessage::CapacityAnnouncement(_) => "CapacityAnnouncement",
            PeerMessage::RequirementAnnouncement(_) => "RequirementAnnouncement",
            PeerMessage::Suppress(_) => "Suppress",
        }
    }

    /// Whether this message may arrive before the handshake completes.
    pub fn allowed_pre_handshake(&self) -> bool {
        matches!(
            self,
            PeerMessage::Challenge(_) | PeerMessage::ChallengeResponse(_)
        )
    }
}

/// Server's opening handshake: prove key ownership and compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerChallenge {
    /// Contract this mesh serves; mismatch drops the connection.
    pub contract_id: String,
    /// The server's time granularity, ms.
    pub time_config: u32,
    /// Whether the server keeps full history (serves log sync).
    pub is_full_history: bool,
    /// Random bytes the client must sign.
    pub challenge: [u8; CHALLENGE_LEN],
}

/// Client's handshake answer: the challenge signed with the node key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerChallengeResponse {
    /// Echo of the challenge bytes.
    pub challenge: [u8; CHALLENGE_LEN],
    /// Responder's node key.
    pub pubkey: PublicKey,
    /// Signature over the raw challenge bytes.
    pub sig: Signature,
}

impl PeerChallengeResponse {
    /// Verify the signature over the challenge bytes.
    pub fn verify(&self) -> bool {
        self.pubkey.verify(&self.challenge, &self.sig).is_ok()
    }
}

/// Address and capacity of a known peer, exchanged in peer discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProperties {
    /// Reachable host.
    pub host_address: String,
    /// Peer port.
    pub port: u16,
    /// When this entry was last refreshed, ms.
    pub timestamp: u64,
    /// Advertised remaining connection capacity; negative means unknown.
    pub available_capacity: i16,
}

/// Periodic capacity advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapacityAnnouncement {
    /// Remaining connection capacity; negative means unknown.
    pub available_capacity: i16,
    /// Sender's clock, ms.
    pub timestamp: u64,
}

/// Requirement advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRequirementAnnouncement {
    /// The sender cannot see the full UNL and needs consensus messages
    /// forwarded to it.
    pub need_consensus_msg_forwarding: bool,
}

/// Reason codes for a suppress request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressReason {
    /// The named key flooded the mesh.
    MessageFlood,
}

/// Ask peers to stop relaying traffic originated by `pubkey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressMessage {
    /// Key whose traffic should be dropped.
    pub pubkey: PublicKey,
    /// Why.
    pub reason: SuppressReason,
}
