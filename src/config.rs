//! Runtime configuration types.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vm::DEFAULT_GC_THRESHOLD;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// Compile functions once their call count reaches the threshold
    #[default]
    On,
    /// Compile every function on its first call
    Always,
}

/// Output format for `--stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Calls before a function is compiled
    pub jit_threshold: u32,
    /// Whether leaf calls are inlined into compiled callers
    pub jit_inline: bool,
    /// Report JIT events at `info` instead of `debug`
    pub trace_jit: bool,
    /// Emit a `trace` event for every interpreted instruction
    pub trace_exec: bool,
    /// Whether `array_new` may trigger a collection (default: true)
    pub gc_enabled: bool,
    /// Live words that trigger an automatic collection
    pub gc_threshold: usize,
    pub gc_stats: bool,
    /// Operand stack capacity
    pub max_stack: usize,
    /// Call stack capacity
    pub max_call_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::On,
            jit_threshold: 10,
            jit_inline: true,
            trace_jit: false,
            trace_exec: false,
            gc_enabled: true,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            gc_stats: false,
            max_stack: 65_536,
            max_call_depth: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Interpreter-only configuration.
    pub fn interpreter() -> Self {
        Self {
            jit_mode: JitMode::Off,
            ..Self::default()
        }
    }

    /// Configuration that compiles every function on first call.
    pub fn eager_jit() -> Self {
        Self {
            jit_mode: JitMode::Always,
            ..Self::default()
        }
    }

    /// Load a configuration from a TOML file. Missing keys keep their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
