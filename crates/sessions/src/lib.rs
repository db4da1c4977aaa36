//! Session model and persistence for Slipway.
//!
//! A session is one conversation with the external agent: its message
//! history, the bounded queue of messages waiting behind the running turn,
//! and the scratch directories the agent works in. Only sessions the user
//! explicitly saved are written to the ideas document.

pub mod model;
pub mod scratch;
pub mod store;

pub use model::{ChatStatus, IdeaStatus, Message, QueuedMessage, Role, Session, SessionMode};
pub use scratch::ScratchSpace;
pub use store::IdeaStore;
