//! # etincelle-shared
//!
//! Wire protocol, domain types, and error taxonomy shared between the
//! Étincelle relay server and the device-side client core.
//!
//! This crate is pure data: no I/O, no runtime. Everything here is the
//! contract both sides of the connection agree on without coordination —
//! most importantly the conversation key derivation, which lets two
//! participants address the same conversation without a server round trip.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ErrorBody, SendError};
pub use types::{
    BlockRelationship, BlockStatus, ChatListEntry, ConversationKey, ConversationSummary, Message,
    MessageBody, PeerSummary, PresenceSnapshot, UserId, UserRecord,
};
