// pipelite-core/src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipeliteError {
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Unsupported aggregation stage: {0}")]
    UnsupportedStage(String),

    #[error("Invalid {stage} stage: {message}")]
    InvalidStage { stage: String, message: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unsupported expression operator: {0}")]
    UnsupportedOperator(String),

    #[error("Error in {stage} stage: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Collection '{name}' could not be fetched: {reason}")]
    CollectionUnavailable { name: String, reason: String },
}

impl PipeliteError {
    pub(crate) fn invalid_stage(stage: &str, message: impl Into<String>) -> Self {
        PipeliteError::InvalidStage {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn stage_failed(stage: &str, message: impl Into<String>) -> Self {
        PipeliteError::StageFailed {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// True for errors raised while parsing and validating, before any stage ran
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipeliteError::Deserialization(_)
                | PipeliteError::InvalidPipeline(_)
                | PipeliteError::UnsupportedStage(_)
                | PipeliteError::InvalidStage { .. }
                | PipeliteError::InvalidQuery(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipeliteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PipeliteError::invalid_stage("$limit", "must have a numeric value");
        assert_eq!(err.to_string(), "Invalid $limit stage: must have a numeric value");

        let err = PipeliteError::stage_failed("$bucketAuto", "no valid 'groupBy' values");
        assert_eq!(err.to_string(), "Error in $bucketAuto stage: no valid 'groupBy' values");
    }

    #[test]
    fn test_validation_classification() {
        assert!(PipeliteError::UnsupportedStage("$out".into()).is_validation());
        assert!(PipeliteError::invalid_stage("$sort", "empty").is_validation());
        assert!(!PipeliteError::stage_failed("$addFields", "boom").is_validation());
        assert!(!PipeliteError::UnsupportedOperator("$zip".into()).is_validation());
    }

    #[test]
    fn test_json_error_converts() {
        let json_err = serde_json::from_str::<serde_json::Value>("[{").unwrap_err();
        let err: PipeliteError = json_err.into();
        assert!(matches!(err, PipeliteError::Deserialization(_)));
    }
}
