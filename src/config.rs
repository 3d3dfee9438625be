//! Interpreter limits.

use serde::Deserialize;

use crate::error::RuntimeError;

pub const DEFAULT_MAX_FRAMES: usize = 256;
pub const DEFAULT_TRACE_LIMIT: usize = 32;
pub const DEFAULT_STACK_CAPACITY: usize = 256;
pub const DEFAULT_MAX_STRING_BYTES: usize = 64 * 1024 * 1024;

/// Tunables for one interpreter instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Deepest frame stack before `RecursionLimit` is raised.
    pub max_frames: usize,
    /// Maximum number of entries kept in an error trace.
    pub trace_limit: usize,
    pub initial_stack_capacity: usize,
    /// Largest string, in bytes, that string repetition may build.
    pub max_string_bytes: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            trace_limit: DEFAULT_TRACE_LIMIT,
            initial_stack_capacity: DEFAULT_STACK_CAPACITY,
            max_string_bytes: DEFAULT_MAX_STRING_BYTES,
        }
    }
}

impl InterpreterConfig {
    /// Defaults overridden by `TPLVM_MAX_FRAMES`, `TPLVM_TRACE_LIMIT`,
    /// `TPLVM_STACK_CAPACITY` and `TPLVM_MAX_STRING_BYTES` when set.
    pub fn from_env() -> Result<Self, RuntimeError> {
        let mut config = Self::default();
        if let Some(n) = env_usize("TPLVM_MAX_FRAMES")? {
            config.max_frames = n;
        }
        if let Some(n) = env_usize("TPLVM_TRACE_LIMIT")? {
            config.trace_limit = n;
        }
        if let Some(n) = env_usize("TPLVM_STACK_CAPACITY")? {
            config.initial_stack_capacity = n;
        }
        if let Some(n) = env_usize("TPLVM_MAX_STRING_BYTES")? {
            config.max_string_bytes = n;
        }
        Ok(config)
    }

    pub fn from_json(source: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(source)
            .map_err(|e| RuntimeError::new(format!("Invalid interpreter config: {}", e)))
    }
}

fn env_usize(key: &str) -> Result<Option<usize>, RuntimeError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RuntimeError::new(format!("{} must be a non-negative integer, got '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
