// File: src/config.rs
//
// Tunable limits for the Ember VM, loadable from a TOML fragment.

use serde::Deserialize;
use std::fmt;
use std::path::Path;

/// Number of ticks a method gets before dying with an out-of-ticks error.
pub const METHOD_TICKS: i32 = 20_000;

/// Number of ticks a resumed paused method gets.
pub const PAUSED_METHOD_TICKS: i32 = 5_000;

/// Maximum depth of method calls.
pub const MAX_CALL_DEPTH: usize = 128;

const STACK_STARTING_SIZE: usize = 256;
const ARG_STACK_STARTING_SIZE: usize = 32;

/// Engine limits. All fields default to the canonical constants; embedders
/// normally override at most the tick budgets.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    pub method_ticks: i32,
    pub paused_method_ticks: i32,
    pub max_call_depth: usize,
    pub stack_capacity: usize,
    pub arg_stack_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            method_ticks: METHOD_TICKS,
            paused_method_ticks: PAUSED_METHOD_TICKS,
            max_call_depth: MAX_CALL_DEPTH,
            stack_capacity: STACK_STARTING_SIZE,
            arg_stack_capacity: ARG_STACK_STARTING_SIZE,
        }
    }
}

/// Failure to load a config file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "cannot parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl VmConfig {
    pub fn from_toml_str(s: &str) -> Result<VmConfig, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_file(path: &Path) -> Result<VmConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        VmConfig::from_toml_str(&text).map_err(ConfigError::Parse)
    }
}
