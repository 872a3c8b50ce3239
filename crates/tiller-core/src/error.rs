use thiserror::Error;
use transport_bus::BusError;

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::signaling::SignalingError;

#[derive(Debug, Error)]
pub enum TillerError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("rendezvous transport: {0}")]
    Bus(#[from] BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type TillerResult<T> = Result<T, TillerError>;
