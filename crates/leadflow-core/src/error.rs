use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeadflowError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Invalid sequence {sequence}: {issues}")]
    InvalidSequence { sequence: String, issues: String },

    // Lookup errors
    #[error("Lead not found: {0}")]
    LeadNotFound(String),

    #[error("Sequence not found: {0}")]
    SequenceNotFound(String),

    #[error("Cursor not found: {0}")]
    CursorNotFound(String),

    #[error("Stage not found in pipeline {product}: {stage}")]
    StageNotFound { product: String, stage: String },

    #[error("Pipeline not found for product: {0}")]
    PipelineNotFound(String),

    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    // Cursor state machine errors
    #[error("Invalid cursor transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Lead {0} already has an active cursor")]
    ActiveCursorExists(String),

    #[error("Sequence is inactive: {0}")]
    SequenceInactive(String),

    // Dispatch errors
    #[error("Dispatch failed after {attempts} attempt(s): {message}")]
    Dispatch { attempts: u32, message: String },

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LeadflowError>;
