// Lunar Compatibility Profiles
// Per-version feature toggles consulted by the parser, VM and standard library

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LuaError, LuaResult};

/// Lua dialect versions the interpreter can emulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LuaVersion {
    #[serde(rename = "5.1")]
    Lua51,
    #[serde(rename = "5.2")]
    Lua52,
    #[serde(rename = "5.3")]
    Lua53,
    #[serde(rename = "5.4")]
    Lua54,
    #[serde(rename = "5.5")]
    Lua55,
    #[serde(rename = "latest")]
    Latest,
}

impl LuaVersion {
    /// Version `Latest` stands for
    pub const DEFAULT: LuaVersion = LuaVersion::Lua54;

    pub fn resolve(self) -> LuaVersion {
        match self {
            LuaVersion::Latest => Self::DEFAULT,
            v => v,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            LuaVersion::Lua51 => "Lua 5.1",
            LuaVersion::Lua52 => "Lua 5.2",
            LuaVersion::Lua53 => "Lua 5.3",
            LuaVersion::Lua54 => "Lua 5.4",
            LuaVersion::Lua55 => "Lua 5.5",
            LuaVersion::Latest => "Lua Latest",
        }
    }

    /// Parse the CLI / config spelling ("5.3", "lua54", "latest")
    pub fn parse(text: &str) -> Option<LuaVersion> {
        let t = text.trim().to_ascii_lowercase();
        let t = t.trim_start_matches("lua").trim();
        match t {
            "5.1" | "51" => Some(LuaVersion::Lua51),
            "5.2" | "52" => Some(LuaVersion::Lua52),
            "5.3" | "53" => Some(LuaVersion::Lua53),
            "5.4" | "54" => Some(LuaVersion::Lua54),
            "5.5" | "55" => Some(LuaVersion::Lua55),
            "latest" | "" => Some(LuaVersion::Latest),
            _ => None,
        }
    }
}

impl Default for LuaVersion {
    fn default() -> Self {
        LuaVersion::Latest
    }
}

impl fmt::Display for LuaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Immutable feature-flag record for one resolved version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatibilityProfile {
    pub version: LuaVersion,
    pub goto_statement: bool,
    pub bitwise_operators: bool,
    pub floor_division: bool,
    pub integer_subtype: bool,
    pub bit32_library: bool,
    pub utf8_library: bool,
    pub table_move: bool,
    pub const_locals: bool,
    pub to_be_closed_variables: bool,
    pub warn_function: bool,
    pub coroutine_close: bool,
    pub global_unpack: bool,
    pub label_end_of_block_exemption: bool,
}

const LUA51: CompatibilityProfile = CompatibilityProfile {
    version: LuaVersion::Lua51,
    goto_statement: false,
    bitwise_operators: false,
    floor_division: false,
    integer_subtype: false,
    bit32_library: false,
    utf8_library: false,
    table_move: false,
    const_locals: false,
    to_be_closed_variables: false,
    warn_function: false,
    coroutine_close: false,
    global_unpack: true,
    label_end_of_block_exemption: false,
};

const LUA52: CompatibilityProfile = CompatibilityProfile {
    version: LuaVersion::Lua52,
    goto_statement: true,
    bit32_library: true,
    global_unpack: false,
    label_end_of_block_exemption: true,
    ..LUA51
};

const LUA53: CompatibilityProfile = CompatibilityProfile {
    version: LuaVersion::Lua53,
    bitwise_operators: true,
    floor_division: true,
    integer_subtype: true,
    bit32_library: false,
    utf8_library: true,
    table_move: true,
    ..LUA52
};

const LUA54: CompatibilityProfile = CompatibilityProfile {
    version: LuaVersion::Lua54,
    const_locals: true,
    to_be_closed_variables: true,
    warn_function: true,
    coroutine_close: true,
    label_end_of_block_exemption: false,
    ..LUA53
};

const LUA55: CompatibilityProfile = CompatibilityProfile {
    version: LuaVersion::Lua55,
    ..LUA54
};

impl CompatibilityProfile {
    pub fn for_version(version: LuaVersion) -> &'static CompatibilityProfile {
        match version.resolve() {
            LuaVersion::Lua51 => &LUA51,
            LuaVersion::Lua52 => &LUA52,
            LuaVersion::Lua53 => &LUA53,
            LuaVersion::Lua55 => &LUA55,
            LuaVersion::Lua54 | LuaVersion::Latest => &LUA54,
        }
    }

    pub fn display_name(&self) -> &'static str {
        self.version.display_name()
    }

    /// Value of the `_VERSION` global
    pub fn version_string(&self) -> &'static str {
        self.version.display_name()
    }
}

impl Default for CompatibilityProfile {
    fn default() -> Self {
        *Self::for_version(LuaVersion::Latest)
    }
}

/// Availability checks for version-gated library functions
pub struct VersionGuard;

impl VersionGuard {
    pub fn is_available(current: LuaVersion, minimum: LuaVersion) -> bool {
        current.resolve() >= minimum.resolve()
    }

    pub fn is_available_in_range(current: LuaVersion, minimum: LuaVersion, maximum: LuaVersion) -> bool {
        let c = current.resolve();
        c >= minimum.resolve() && c <= maximum.resolve()
    }

    pub fn ensure_available(current: LuaVersion, minimum: LuaVersion, function: &str) -> LuaResult<()> {
        if Self::is_available(current, minimum) {
            return Ok(());
        }
        Err(LuaError::runtime(format!(
            "attempt to call a nil value (function '{}' requires {} or later, but script is running in {} mode)",
            function,
            minimum.resolve().display_name(),
            current.resolve().display_name()
        )))
    }

    pub fn ensure_not_removed(current: LuaVersion, removed_in: LuaVersion, function: &str) -> LuaResult<()> {
        if current.resolve() < removed_in.resolve() {
            return Ok(());
        }
        Err(LuaError::runtime(format!(
            "attempt to call a nil value (function '{}' was removed in {}, but script is running in {} mode)",
            function,
            removed_in.resolve().display_name(),
            current.resolve().display_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_resolves_to_default() {
        let p = CompatibilityProfile::for_version(LuaVersion::Latest);
        assert_eq!(p.version, LuaVersion::Lua54);
        assert_eq!(LuaVersion::Latest.display_name(), "Lua Latest");
    }

    #[test]
    fn lua52_has_bit32_but_no_table_move() {
        let p = CompatibilityProfile::for_version(LuaVersion::Lua52);
        assert!(p.bit32_library);
        assert!(!p.table_move);
        assert!(!p.bitwise_operators);
        assert!(p.goto_statement);
    }

    #[test]
    fn lua54_accepts_attributes() {
        let p = CompatibilityProfile::for_version(LuaVersion::Lua54);
        assert!(p.const_locals);
        assert!(p.to_be_closed_variables);
        assert!(!p.bit32_library);
        assert!(p.integer_subtype);
    }

    #[test]
    fn lua51_keeps_legacy_globals() {
        let p = CompatibilityProfile::for_version(LuaVersion::Lua51);
        assert!(!p.goto_statement);
        assert!(p.global_unpack);
        assert!(!p.integer_subtype);
    }

    #[test]
    fn guard_messages_name_both_versions() {
        let err = VersionGuard::ensure_available(LuaVersion::Lua52, LuaVersion::Lua54, "warn")
            .unwrap_err();
        assert_eq!(
            err.message,
            "attempt to call a nil value (function 'warn' requires Lua 5.4 or later, but script is running in Lua 5.2 mode)"
        );
        assert!(VersionGuard::ensure_not_removed(LuaVersion::Lua51, LuaVersion::Lua52, "setfenv").is_ok());
        assert!(VersionGuard::is_available_in_range(LuaVersion::Latest, LuaVersion::Lua53, LuaVersion::Lua54));
    }

    #[test]
    fn versions_parse_from_cli_spellings() {
        assert_eq!(LuaVersion::parse("5.3"), Some(LuaVersion::Lua53));
        assert_eq!(LuaVersion::parse("lua51"), Some(LuaVersion::Lua51));
        assert_eq!(LuaVersion::parse("latest"), Some(LuaVersion::Latest));
        assert_eq!(LuaVersion::parse("6.0"), None);
    }

    #[test]
    fn version_serializes_as_dotted_string() {
        let json = serde_json::to_string(&LuaVersion::Lua53).unwrap();
        assert_eq!(json, "\"5.3\"");
        let back: LuaVersion = serde_json::from_str("\"latest\"").unwrap();
        assert_eq!(back, LuaVersion::Latest);
    }
}
