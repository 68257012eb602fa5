//! Capability tokens (§3, §4.2, §6.4).
//!
//! Wire form is `domain:action:scope`, where `scope = "*"` denotes the
//! wildcard (`*All`) variant of the token.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single granted permission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CapabilityToken {
    StateRead(String),
    StateReadAll,
    StateWrite(String),
    StateWriteAll,
    EventsEmit(String),
    EventsEmitAll,
    ViewUpdate(String),
    ViewUpdateAll,
    Extension(String),
    ExtensionAll,
}

/// Why a call was denied a capability, kept separate from `ErrorCode` so
/// callers can render a precise message before wrapping it into a
/// `RuntimeError::permission_denied`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityParseError {
    #[error("malformed capability string: {0:?}")]
    Malformed(String),
    #[error("unknown capability domain: {0:?}")]
    UnknownDomain(String),
    #[error("unknown action {action:?} for domain {domain:?}")]
    UnknownAction { domain: String, action: String },
}

impl CapabilityToken {
    /// Parses the `domain:action:scope` wire form. The `ext` domain has no
    /// action segment (§6.4: "Actions: ... none (ext)"), so `ext:scope` (two
    /// segments) is accepted alongside the three-segment form for the other
    /// domains.
    pub fn parse(wire: &str) -> Result<Self, CapabilityParseError> {
        if let Some(scope) = wire.strip_prefix("ext:") {
            if scope.is_empty() || scope.contains(':') {
                return Err(CapabilityParseError::Malformed(wire.to_string()));
            }
            return Ok(if scope == "*" {
                CapabilityToken::ExtensionAll
            } else {
                CapabilityToken::Extension(scope.to_string())
            });
        }

        let mut parts = wire.splitn(3, ':');
        let (domain, action, scope) = match (parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(a), Some(s)) => (d, a, s),
            _ => return Err(CapabilityParseError::Malformed(wire.to_string())),
        };
        let all = scope == "*";
        match (domain, action) {
            ("state", "read") => Ok(if all {
                CapabilityToken::StateReadAll
            } else {
                CapabilityToken::StateRead(scope.to_string())
            }),
            ("state", "write") => Ok(if all {
                CapabilityToken::StateWriteAll
            } else {
                CapabilityToken::StateWrite(scope.to_string())
            }),
            ("events", "emit") => Ok(if all {
                CapabilityToken::EventsEmitAll
            } else {
                CapabilityToken::EventsEmit(scope.to_string())
            }),
            ("view", "update") => Ok(if all {
                CapabilityToken::ViewUpdateAll
            } else {
                CapabilityToken::ViewUpdate(scope.to_string())
            }),
            ("state", other) | ("events", other) | ("view", other) => {
                Err(CapabilityParseError::UnknownAction {
                    domain: domain.to_string(),
                    action: other.to_string(),
                })
            }
            _ => Err(CapabilityParseError::UnknownDomain(domain.to_string())),
        }
    }

    /// True iff this granted token covers the `required` wire-form string.
    ///
    /// A malformed `required` string always denies (testable property 3).
    pub fn matches(&self, required: &str) -> bool {
        let Ok(required) = CapabilityToken::parse(required) else {
            return false;
        };
        match (self, &required) {
            (CapabilityToken::StateReadAll, CapabilityToken::StateRead(_) | CapabilityToken::StateReadAll) => true,
            (CapabilityToken::StateWriteAll, CapabilityToken::StateWrite(_) | CapabilityToken::StateWriteAll) => true,
            (CapabilityToken::EventsEmitAll, CapabilityToken::EventsEmit(_) | CapabilityToken::EventsEmitAll) => true,
            (CapabilityToken::ViewUpdateAll, CapabilityToken::ViewUpdate(_) | CapabilityToken::ViewUpdateAll) => true,
            (CapabilityToken::ExtensionAll, CapabilityToken::Extension(_) | CapabilityToken::ExtensionAll) => true,
            _ => self == &required,
        }
    }
}

impl fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityToken::StateRead(k) => write!(f, "state:read:{k}"),
            CapabilityToken::StateReadAll => write!(f, "state:read:*"),
            CapabilityToken::StateWrite(k) => write!(f, "state:write:{k}"),
            CapabilityToken::StateWriteAll => write!(f, "state:write:*"),
            CapabilityToken::EventsEmit(n) => write!(f, "events:emit:{n}"),
            CapabilityToken::EventsEmitAll => write!(f, "events:emit:*"),
            CapabilityToken::ViewUpdate(id) => write!(f, "view:update:{id}"),
            CapabilityToken::ViewUpdateAll => write!(f, "view:update:*"),
            CapabilityToken::Extension(name) => write!(f, "ext:{name}"),
            CapabilityToken::ExtensionAll => write!(f, "ext:*"),
        }
    }
}

impl TryFrom<String> for CapabilityToken {
    type Error = CapabilityParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        CapabilityToken::parse(&value)
    }
}

impl From<CapabilityToken> for String {
    fn from(value: CapabilityToken) -> Self {
        value.to_string()
    }
}

/// A set of granted tokens plus whether they were declared by the handler
/// author or inferred by a conservative scan (§4.2, §9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub tokens: Vec<CapabilityToken>,
    pub inferred: bool,
}

impl CapabilitySet {
    pub fn declared(tokens: Vec<CapabilityToken>) -> Self {
        Self {
            tokens,
            inferred: false,
        }
    }

    pub fn inferred(tokens: Vec<CapabilityToken>) -> Self {
        Self {
            tokens,
            inferred: true,
        }
    }

    pub fn check(&self, required: &str) -> bool {
        self.tokens.iter().any(|t| t.matches(required))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scoped_and_wildcard() {
        assert_eq!(
            CapabilityToken::parse("state:read:count").unwrap(),
            CapabilityToken::StateRead("count".into())
        );
        assert_eq!(
            CapabilityToken::parse("state:write:*").unwrap(),
            CapabilityToken::StateWriteAll
        );
        assert_eq!(
            CapabilityToken::parse("ext:*").unwrap(),
            CapabilityToken::ExtensionAll
        );
        assert_eq!(
            CapabilityToken::parse("ext:http").unwrap(),
            CapabilityToken::Extension("http".into())
        );
    }

    #[test]
    fn malformed_denies() {
        assert!(CapabilityToken::parse("nope").is_err());
        assert!(!CapabilityToken::StateReadAll.matches("nope"));
    }

    #[test]
    fn wildcard_matches_any_scope_same_domain_action() {
        let all = CapabilityToken::StateWriteAll;
        assert!(all.matches("state:write:public"));
        assert!(all.matches("state:write:secret"));
        assert!(!all.matches("state:read:secret"));
    }

    #[test]
    fn scoped_matches_only_exact_scope() {
        let scoped = CapabilityToken::StateWrite("public".into());
        assert!(scoped.matches("state:write:public"));
        assert!(!scoped.matches("state:write:secret"));
    }
}
