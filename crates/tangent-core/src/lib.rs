// Branching conversation core without UI dependencies

pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;
pub mod utils;

pub use error::{Error, Result};
