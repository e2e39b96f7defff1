use thiserror::Error;

pub type AbTrackResult<T> = Result<T, AbTrackError>;

#[derive(Error, Debug)]
pub enum AbTrackError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown experiment referenced: {0}")]
    UnknownExperiment(String),

    #[error("Experiment {0} declares no variations")]
    NoVariations(String),

    #[error("Experiment {experiment_id} names winner {winner} outside its variation set")]
    UnknownWinner {
        experiment_id: String,
        winner: String,
    },

    #[error("Corrupt persisted record under {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Invalid selector {0:?}")]
    Selector(String),

    #[error("Frame access denied: {0}")]
    FrameAccess(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AbTrackError {
    /// Configuration anomalies are reported for diagnostics but never abort a page load.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            AbTrackError::Config(_)
                | AbTrackError::UnknownExperiment(_)
                | AbTrackError::NoVariations(_)
                | AbTrackError::UnknownWinner { .. }
        )
    }
}
