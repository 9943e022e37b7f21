use thiserror::Error;

/// A generation request that cannot be run as given.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RequestError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("Prompt text is required")]
    EmptyPrompt,

    #[error("{name} must be a multiple of 8 between 8 and {max}, got {value}", max = crate::MAX_DIMENSION)]
    InvalidDimension { name: &'static str, value: usize },

    #[error("the number of inference steps must be between 1 and {max}, got {0}", max = crate::MAX_STEPS)]
    InvalidSteps(usize),

    #[error("guidance scale must be a finite non-negative number, got {0}")]
    InvalidGuidance(f64),

    #[error("refiner strength must be in (0, 1], got {0}")]
    InvalidStrength(f64),
}
