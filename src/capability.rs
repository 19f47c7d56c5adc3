//! Capability tokens for handler authorization.
//!
//! Panels declare required capabilities in NXML and the host grants them per
//! invocation. For extension calls the tokens are advisory on top of the
//! extension registry, which is the ground truth: a method absent from the
//! registry is denied regardless of tokens. An empty token set means the
//! host opted out of the hint and the registry alone governs access.
//!
//! [`infer_capabilities`] derives the minimal token set from handler source
//! so hosts can populate grants at panel install time.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability token format
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CapabilityToken {
    /// Read a specific state key: `state:read:{key}`
    StateRead(String),
    /// Write a specific state key: `state:write:{key}`
    StateWrite(String),
    /// Read all state: `state:read:*`
    StateReadAll,
    /// Write all state: `state:write:*`
    StateWriteAll,
    /// Emit a specific event: `events:emit:{name}`
    EventsEmit(String),
    /// Emit all events: `events:emit:*`
    EventsEmitAll,
    /// Update a specific component: `view:update:{id}`
    ViewUpdate(String),
    /// Update all components: `view:update:*`
    ViewUpdateAll,
    /// Access a specific extension: `ext:{name}`
    Extension(String),
    /// Access all extensions: `ext:*`
    ExtensionAll,
}

impl CapabilityToken {
    /// Parse a capability token from a string
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();

        match parts.as_slice() {
            ["state", "read", "*"] => Some(Self::StateReadAll),
            ["state", "write", "*"] => Some(Self::StateWriteAll),
            ["state", "read", key] => Some(Self::StateRead((*key).to_string())),
            ["state", "write", key] => Some(Self::StateWrite((*key).to_string())),
            ["events", "emit", "*"] => Some(Self::EventsEmitAll),
            ["events", "emit", name] => Some(Self::EventsEmit((*name).to_string())),
            ["view", "update", "*"] => Some(Self::ViewUpdateAll),
            ["view", "update", id] => Some(Self::ViewUpdate((*id).to_string())),
            ["ext", "*"] => Some(Self::ExtensionAll),
            ["ext", name] => Some(Self::Extension((*name).to_string())),
            _ => None,
        }
    }

    /// Check if this capability satisfies a required capability string
    pub fn matches(&self, required: &str) -> bool {
        let parts: Vec<&str> = required.split(':').collect();

        match (self, parts.as_slice()) {
            (Self::StateReadAll, ["state", "read", _]) => true,
            (Self::StateRead(key), ["state", "read", k]) => key == *k,

            (Self::StateWriteAll, ["state", "write", _]) => true,
            (Self::StateWrite(key), ["state", "write", k]) => key == *k,

            (Self::EventsEmitAll, ["events", "emit", _]) => true,
            (Self::EventsEmit(name), ["events", "emit", n]) => name == *n,

            (Self::ViewUpdateAll, ["view", "update", _]) => true,
            (Self::ViewUpdate(id), ["view", "update", i]) => id == *i,

            (Self::ExtensionAll, ["ext", _]) => true,
            (Self::Extension(name), ["ext", n]) => name == *n,

            _ => false,
        }
    }
}

impl fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateRead(key) => write!(f, "state:read:{}", key),
            Self::StateWrite(key) => write!(f, "state:write:{}", key),
            Self::StateReadAll => write!(f, "state:read:*"),
            Self::StateWriteAll => write!(f, "state:write:*"),
            Self::EventsEmit(name) => write!(f, "events:emit:{}", name),
            Self::EventsEmitAll => write!(f, "events:emit:*"),
            Self::ViewUpdate(id) => write!(f, "view:update:{}", id),
            Self::ViewUpdateAll => write!(f, "view:update:*"),
            Self::Extension(name) => write!(f, "ext:{}", name),
            Self::ExtensionAll => write!(f, "ext:*"),
        }
    }
}

impl From<String> for CapabilityToken {
    fn from(s: String) -> Self {
        Self::parse(&s).unwrap_or(Self::Extension(s))
    }
}

impl From<CapabilityToken> for String {
    fn from(cap: CapabilityToken) -> Self {
        cap.to_string()
    }
}

/// Capability checker for runtime enforcement
#[derive(Debug)]
pub struct CapabilityChecker {
    capabilities: Vec<CapabilityToken>,
}

impl CapabilityChecker {
    /// Create a new capability checker
    pub fn new(capabilities: Vec<CapabilityToken>) -> Self {
        Self { capabilities }
    }

    /// Whether the token set is empty (hint absent)
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Check if an extension access is allowed by the token set
    pub fn can_access_extension(&self, ext_name: &str) -> bool {
        let required = format!("ext:{}", ext_name);
        self.capabilities.iter().any(|c| c.matches(&required))
    }

    /// Check an arbitrary required capability
    pub fn check(&self, required: &str) -> bool {
        self.capabilities.iter().any(|c| c.matches(required))
    }
}

static STATE_WRITE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$state\.(\w+)\s*=[^=]").expect("static regex"));
static STATE_READ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$state\.(\w+)").expect("static regex"));
static EMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\$emit\s*\(\s*['"]([\w-]+)['"]"#).expect("static regex"));
static EXT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$ext\.(\w+)").expect("static regex"));
static VIEW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\$view\.\w+\s*\(\s*['"]([\w-]+)['"]"#).expect("static regex"));

/// Infer the minimal capability set from handler source.
///
/// This is a lexical scan, not a parse: dynamic key access such as
/// `$state[expr]` is invisible to it, so hosts treating the result as a
/// grant list should widen to the `*` forms for such handlers.
pub fn infer_capabilities(handler_source: &str) -> Vec<CapabilityToken> {
    let mut capabilities = Vec::new();

    let mut push = |cap: CapabilityToken| {
        if !capabilities.contains(&cap) {
            capabilities.push(cap);
        }
    };

    for cap in STATE_WRITE_RE.captures_iter(handler_source) {
        if let Some(key) = cap.get(1) {
            push(CapabilityToken::StateWrite(key.as_str().to_string()));
        }
    }

    for cap in STATE_READ_RE.captures_iter(handler_source) {
        if let Some(key) = cap.get(1) {
            push(CapabilityToken::StateRead(key.as_str().to_string()));
        }
    }

    for cap in EMIT_RE.captures_iter(handler_source) {
        if let Some(name) = cap.get(1) {
            push(CapabilityToken::EventsEmit(name.as_str().to_string()));
        }
    }

    for cap in EXT_RE.captures_iter(handler_source) {
        if let Some(ext) = cap.get(1) {
            push(CapabilityToken::Extension(ext.as_str().to_string()));
        }
    }

    for cap in VIEW_RE.captures_iter(handler_source) {
        if let Some(id) = cap.get(1) {
            push(CapabilityToken::ViewUpdate(id.as_str().to_string()));
        }
    }

    capabilities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parse() {
        assert_eq!(
            CapabilityToken::parse("state:read:*"),
            Some(CapabilityToken::StateReadAll)
        );
        assert_eq!(
            CapabilityToken::parse("state:write:count"),
            Some(CapabilityToken::StateWrite("count".to_string()))
        );
        assert_eq!(
            CapabilityToken::parse("ext:http"),
            Some(CapabilityToken::Extension("http".to_string()))
        );
        assert_eq!(CapabilityToken::parse("bogus"), None);
    }

    #[test]
    fn test_token_matches() {
        let all_ext = CapabilityToken::ExtensionAll;
        assert!(all_ext.matches("ext:http"));
        assert!(all_ext.matches("ext:ai"));

        let specific = CapabilityToken::Extension("http".to_string());
        assert!(specific.matches("ext:http"));
        assert!(!specific.matches("ext:ai"));
    }

    #[test]
    fn test_checker() {
        let checker = CapabilityChecker::new(vec![
            CapabilityToken::Extension("http".to_string()),
            CapabilityToken::StateReadAll,
        ]);

        assert!(checker.can_access_extension("http"));
        assert!(!checker.can_access_extension("ai"));
        assert!(checker.check("state:read:anything"));
    }

    #[test]
    fn test_token_display_roundtrip() {
        for raw in ["state:read:*", "state:write:count", "events:emit:toast", "ext:http"] {
            let token = CapabilityToken::parse(raw).expect("parse");
            assert_eq!(token.to_string(), raw);
        }
    }

    #[test]
    fn test_infer_state_and_emit() {
        let source = r#"
            $state.count = $state.count + 1;
            $emit('toast', 'saved');
        "#;
        let caps = infer_capabilities(source);

        assert!(caps.contains(&CapabilityToken::StateWrite("count".to_string())));
        assert!(caps.contains(&CapabilityToken::StateRead("count".to_string())));
        assert!(caps.contains(&CapabilityToken::EventsEmit("toast".to_string())));
    }

    #[test]
    fn test_infer_extensions_and_view() {
        let source = r#"
            const r = $ext.http.get(url);
            $view.focus('search-box');
        "#;
        let caps = infer_capabilities(source);

        assert!(caps.contains(&CapabilityToken::Extension("http".to_string())));
        assert!(caps.contains(&CapabilityToken::ViewUpdate("search-box".to_string())));
    }

    #[test]
    fn test_infer_ignores_equality_comparison() {
        let caps = infer_capabilities("if ($state.mode === 'edit') {}");
        assert!(!caps.contains(&CapabilityToken::StateWrite("mode".to_string())));
        assert!(caps.contains(&CapabilityToken::StateRead("mode".to_string())));
    }
}
