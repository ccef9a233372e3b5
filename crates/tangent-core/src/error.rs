use thiserror::Error;

use crate::api::ApiError;
use crate::app::domain::runtime::SessionError;
use crate::config::ConfigError;
use crate::session::ClientStateError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    ClientState(#[from] ClientStateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
