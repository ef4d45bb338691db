//! Correlation handle shared between a host and a manager
//!
//! A `Context` carries the caller's intent and the manager's state token.
//! The host never interprets the token; reusing the same Context (or a
//! thawed equivalent) is what makes otherwise stateless calls related.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What the caller intends to do with the entities it touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessIntent {
    Read,
    Write,
    Unknown,
}

impl AccessIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessIntent::Read => "read",
            AccessIntent::Write => "write",
            AccessIntent::Unknown => "unknown",
        }
    }
}

impl Default for AccessIntent {
    fn default() -> Self {
        AccessIntent::Unknown
    }
}

/// How long references produced under this Context need to stay stable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    Transient,
    PersistentHint,
    Permanent,
}

impl Retention {
    pub fn as_str(&self) -> &'static str {
        match self {
            Retention::Transient => "transient",
            Retention::PersistentHint => "persistent_hint",
            Retention::Permanent => "permanent",
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Retention::Transient
    }
}

/// Opaque manager-defined state token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateToken(String);

impl StateToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for StateToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Caller-supplied description of who is calling (a tool, a UI panel, a
/// batch process). Passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locale {
    pub schema: String,
    pub fields: BTreeMap<String, String>,
}

impl Locale {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Per-operation correlation handle
///
/// The state token is fixed for the lifetime of the Context; there is no
/// setter. Access intent, retention and locale belong to the caller and may
/// be changed freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    access: AccessIntent,
    retention: Retention,
    state: StateToken,
    locale: Locale,
}

impl Context {
    /// Build a Context around a token the manager handed out
    pub fn new(state: StateToken) -> Self {
        Self {
            access: AccessIntent::default(),
            retention: Retention::default(),
            state,
            locale: Locale::default(),
        }
    }

    pub(crate) fn from_parts(
        state: StateToken,
        access: AccessIntent,
        retention: Retention,
        locale: Locale,
    ) -> Self {
        Self {
            access,
            retention,
            state,
            locale,
        }
    }

    pub fn with_access(mut self, access: AccessIntent) -> Self {
        self.access = access;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }

    pub fn access(&self) -> AccessIntent {
        self.access
    }

    pub fn set_access(&mut self, access: AccessIntent) {
        self.access = access;
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub fn set_retention(&mut self, retention: Retention) {
        self.retention = retention;
    }

    pub fn locale(&self) -> &Locale {
        &self.locale
    }

    pub fn set_locale(&mut self, locale: Locale) {
        self.locale = locale;
    }

    pub fn state_token(&self) -> &StateToken {
        &self.state
    }

    pub fn is_read(&self) -> bool {
        self.access == AccessIntent::Read
    }

    pub fn is_write(&self) -> bool {
        self.access == AccessIntent::Write
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Context(state={}, access={}, retention={})",
            self.state,
            self.access.as_str(),
            self.retention.as_str()
        )
    }
}
