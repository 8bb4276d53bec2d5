//! # etincelle-store
//!
//! Durable-store contract for the Étincelle relay, plus an in-memory
//! reference implementation.
//!
//! The relay core never talks to a storage engine directly; it consumes the
//! trait family in [`traits`] (create / find-by-key / update-by-key /
//! delete-by-key, strongly consistent per single-document mutation). The
//! production document store is an external collaborator that plugs in
//! behind the same traits. [`MemoryStore`] honors the same consistency
//! contract with per-conversation locks and is what the server binary and
//! the test suites run against.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use traits::{BlockStore, MessageStore, Store, SummaryStore, UserStore};
