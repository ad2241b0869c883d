// Lunar Script Options
// Host-facing configuration, loadable from JSON

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_MAX_ENTRIES;
use crate::error::{LuaError, LuaResult};
use crate::profile::LuaVersion;

/// Standard library modules to register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreModules {
    pub basic: bool,
    pub coroutine: bool,
    pub table: bool,
    pub string: bool,
    pub math: bool,
    pub bit32: bool,
    pub utf8: bool,
    pub os: bool,
}

impl CoreModules {
    pub const ALL: CoreModules = CoreModules {
        basic: true,
        coroutine: true,
        table: true,
        string: true,
        math: true,
        bit32: true,
        utf8: true,
        os: true,
    };

    pub const NONE: CoreModules = CoreModules {
        basic: false,
        coroutine: false,
        table: false,
        string: false,
        math: false,
        bit32: false,
        utf8: false,
        os: false,
    };
}

impl Default for CoreModules {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptOptions {
    pub compatibility: LuaVersion,
    /// Compiled chunks kept in the LRU cache; 0 disables it
    pub cache_capacity: usize,
    pub stdlib: CoreModules,
    /// Script call frames per VM
    pub max_call_depth: usize,
    /// Nested native re-entries (metamethods, sort comparators, host calls)
    pub max_native_depth: usize,
    /// Prefix of generated chunk names
    pub chunk_name_prefix: String,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            compatibility: LuaVersion::Latest,
            cache_capacity: DEFAULT_MAX_ENTRIES,
            stdlib: CoreModules::ALL,
            max_call_depth: 100_000,
            max_native_depth: 200,
            chunk_name_prefix: "chunk".to_string(),
        }
    }
}

impl ScriptOptions {
    pub fn with_version(version: LuaVersion) -> Self {
        Self {
            compatibility: version,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> LuaResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| LuaError::runtime(format!("invalid script options: {}", e)))
    }

    pub fn to_json(&self) -> LuaResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LuaError::internal(format!("cannot serialize script options: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let options = ScriptOptions::from_json(r#"{ "compatibility": "5.2", "stdlib": { "os": false } }"#)
            .unwrap();
        assert_eq!(options.compatibility, LuaVersion::Lua52);
        assert_eq!(options.cache_capacity, DEFAULT_MAX_ENTRIES);
        assert!(!options.stdlib.os);
        assert!(options.stdlib.math);
    }

    #[test]
    fn json_round_trip_and_errors() {
        let options = ScriptOptions::with_version(LuaVersion::Lua51);
        let text = options.to_json().unwrap();
        assert!(text.contains("\"5.1\""));
        assert_eq!(ScriptOptions::from_json(&text).unwrap(), options);
        assert!(ScriptOptions::from_json("{ \"compatibility\": \"6.0\" }").is_err());
    }
}
