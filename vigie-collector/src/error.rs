use crate::models::HostId;
use crate::persist::PersistError;

/// Erreurs remontées par le store et l'agrégateur
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Identifiant d'hôte inconnu : toujours remonté, jamais avalé
    #[error("Host not found: {0}")]
    NotFound(HostId),
    /// Échantillon hors bornes, rejeté à l'ingestion et non stocké
    #[error("Invalid sample: {0}")]
    InvalidSample(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistError),
}

pub type CollectorResult<T> = Result<T, CollectorError>;
