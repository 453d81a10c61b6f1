//! Outbound message types for network communication.

use hotpocket_messages::{HpfsLogRequest, HpfsLogResponse, HpfsRequest, HpfsResponse, NplMessage};
use hotpocket_types::{Proposal, UserInput};

/// Outbound network messages.
///
/// These are the messages a node can send to its peers. The runner's
/// peer IO handles the actual framing and sockets.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Our stage proposal for the round.
    Proposal(Box<Proposal>),

    /// Inputs forwarded on behalf of non-UNL observers.
    NonUnlProposal { user_inputs: Vec<UserInput> },

    /// Node-party-line payload from the contract.
    Npl(NplMessage),

    /// State-sync request.
    HpfsRequest(HpfsRequest),

    /// State-sync response to a peer's request.
    HpfsResponse(HpfsResponse),

    /// Log-sync request.
    HpfsLogRequest(HpfsLogRequest),

    /// Log-sync response to a peer's request.
    HpfsLogResponse(HpfsLogResponse),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Proposal(_) => "Proposal",
            OutboundMessage::NonUnlProposal { .. } => "NonUnlProposal",
            OutboundMessage::Npl(_) => "Npl",
            OutboundMessage::HpfsRequest(_) => "HpfsRequest",
            OutboundMessage::HpfsResponse(_) => "HpfsResponse",
            OutboundMessage::HpfsLogRequest(_) => "HpfsLogRequest",
            OutboundMessage::HpfsLogResponse(_) => "HpfsLogResponse",
        }
    }

    /// Check if this is a consensus message (proposal traffic).
    pub fn is_consensus(&self) -> bool {
        matches!(
            self,
            OutboundMessage::Proposal(_) | OutboundMessage::NonUnlProposal { .. }
        )
    }

    /// Check if this is sync traffic.
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            OutboundMessage::HpfsRequest(_)
                | OutboundMessage::HpfsResponse(_)
                | OutboundMessage::HpfsLogRequest(_)
                | OutboundMessage::HpfsLogResponse(_)
        )
    }
}
