//! Peer wire messages for the HotPocket protocol.
//!
//! Every peer message travels as a length-prefixed [`PeerEnvelope`]
//! carrying the protocol version, the sender's wall clock, and one
//! [`PeerMessage`] variant. Signature preimages are independent of this
//! framing (see `hotpocket_types::signing`), so the codec can change
//! without breaking signatures.

mod codec;
mod hpfs;
mod ledger_sync;
mod npl;
mod peer;

pub use codec::{decode_envelope, encode_envelope, is_stale, CodecError, MAX_SIZE_FOR_TIME_CHECK};
pub use hpfs::{
    FsEntryResponseType, FsHashEntry, HpfsLogRequest, HpfsLogResponse, HpfsRequest,
    HpfsRequestHint, HpfsResponse, HpfsResponseContent,
};
pub use ledger_sync::{LedgerRequest, LedgerResponse, LEDGER_SYNC_BATCH};
pub use npl::NplMessage;
pub use peer::{
    PeerCapacityAnnouncement, PeerChallenge, PeerChallengeResponse, PeerEnvelope, PeerMessage,
    PeerProperties, PeerRequirementAnnouncement, SuppressMessage, SuppressReason, CHALLENGE_LEN,
    PROTOCOL_VERSION,
};
