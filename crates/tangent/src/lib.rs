pub mod cli;
pub mod commands;
pub mod server;

pub use tangent_core::{api, app, config, session, transport, utils};
