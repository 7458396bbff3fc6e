use std::fmt::{self, Display};

/// Errors produced by model constructors and parsing routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    EmptyId(&'static str),
    InvalidPolicy { field: &'static str, value: String },
    InvalidTrigger(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::EmptyId(kind) => write!(f, "{kind} id cannot be empty"),
            ModelError::InvalidPolicy { field, value } => {
                write!(f, "invalid value '{value}' for '{field}'")
            }
            ModelError::InvalidTrigger(value) => {
                write!(f, "unknown event kind '{value}'")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
