//! Session runtime: lifecycle manager, turn pipeline, context-window
//! manager and quota allocator, plus the plumbing they share.
//!
//! Data flow for one message: [`SessionManager::send_message`] runs it or
//! queues it; a turn asks the [`QuotaAllocator`] for admission, builds the
//! prompt with the [`ContextManager`]'s summaries, streams the agent's
//! events through the [`EventBroadcaster`], then records usage back into
//! both managers and drains the queue.

pub mod broadcast;
pub mod cancel;
pub mod context;
pub mod events;
pub mod manager;
pub mod prompt;
pub mod quota;
pub mod sampler;
mod turn;

pub use broadcast::{ChannelBroadcaster, EventBroadcaster};
pub use cancel::ProcessMap;
pub use context::{ContextManager, ContextState, ContextSummary, SummarizationStatus};
pub use events::SessionEvent;
pub use manager::{ManagerDeps, PromoteOptions, Promotion, SessionManager};
pub use quota::QuotaAllocator;
