pub mod action;
pub mod effect;
pub mod event;
pub mod reduce;
pub mod runtime;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;

pub use action::Action;
pub use effect::Effect;
pub use event::{GenerationOutcome, NoticeLevel, ReplaceReason, SessionEvent};
pub use reduce::{InvalidActionKind, ReduceError, reduce};
pub use state::{DEFAULT_PAGE_SIZE, SessionState};
pub use types::{ConversationId, MessageId, OpId, RequestId};
