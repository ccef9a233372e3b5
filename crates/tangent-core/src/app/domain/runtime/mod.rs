mod interpreter;
mod session_actor;
mod subscription;

pub use interpreter::EffectInterpreter;
pub use session_actor::{
    HistoryOutcome, SessionError, SessionHandle, SessionOptions, SwitchOutcome, spawn_session,
};
pub use subscription::{SessionEventEnvelope, SessionEventSubscription};
