pub mod client_state;

pub use client_state::{
    ClientState, ClientStateError, ClientStateStore, FileClientStateStore,
    InMemoryClientStateStore,
};
