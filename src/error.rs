//! Error types for the occlusion pipeline
//!
//! Setup failures (device, programs, mandatory resources) are fatal and bubble up
//! to the caller. Resource-state misuse is only detected by the backend validator.

use crate::gpu::{ResourceId, ResourceState};

/// Result type used throughout the crate
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("GPU device initialization failed: {message}")]
    DeviceInit { message: String },

    #[error("Failed to create program '{program}': {error}")]
    ProgramCreation { program: String, error: String },

    #[error("Failed to create resource '{label}': {error}")]
    ResourceCreation { label: String, error: String },

    #[error("Unknown {kind} handle {index}")]
    InvalidHandle { kind: &'static str, index: u32 },

    #[error("Invalid transition on {resource:?}: expected {expected:?}, resource is in {actual:?}")]
    InvalidTransition {
        resource: ResourceId,
        expected: ResourceState,
        actual: ResourceState,
    },

    #[error("{resource:?} used as {usage} while in {actual:?}")]
    StateMismatch {
        resource: ResourceId,
        usage: &'static str,
        actual: ResourceState,
    },

    #[error("Malformed command list: {message}")]
    CommandList { message: String },

    #[error("Out of bounds access on {label}: offset {offset} + {size} > {capacity}")]
    OutOfBounds {
        label: String,
        offset: u64,
        size: u64,
        capacity: u64,
    },

    #[error("Feature not supported by backend: {feature}")]
    Unsupported { feature: &'static str },

    #[error("Surface error: {message}")]
    Surface { message: String },

    #[error("Buffer readback failed: {message}")]
    Readback { message: String },

    #[error("Scene load failed: {message}")]
    SceneLoad { message: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Create a program creation error
pub fn program_error(program: &str, error: impl std::fmt::Display) -> PipelineError {
    PipelineError::ProgramCreation {
        program: program.to_string(),
        error: error.to_string(),
    }
}

/// Create a resource creation error
pub fn resource_error(label: &str, error: impl std::fmt::Display) -> PipelineError {
    PipelineError::ResourceCreation {
        label: label.to_string(),
        error: error.to_string(),
    }
}
