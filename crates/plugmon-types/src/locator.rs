//! Textual service references: `sid/<uuid>` or `name/<identifier>`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ServiceId;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9\-]{0,30}$").expect("service name pattern is a valid regex")
});

static SID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("service id pattern is a valid regex")
});

/// A reference to a service by identity or by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ServiceLocator {
    Id(ServiceId),
    Name(String),
}

impl ServiceLocator {
    /// Build a name locator, validating the identifier grammar.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError::InvalidName`] if `name` does not match
    /// `[a-zA-Z][a-zA-Z0-9-]{0,30}`.
    pub fn name(name: impl Into<String>) -> Result<Self, LocatorError> {
        let name = name.into();
        if NAME_PATTERN.is_match(&name) {
            Ok(Self::Name(name))
        } else {
            Err(LocatorError::InvalidName(name))
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<ServiceId> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Name(_) => None,
        }
    }

    #[must_use]
    pub fn name_str(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Name(name) => Some(name),
        }
    }
}

impl From<ServiceId> for ServiceLocator {
    fn from(id: ServiceId) -> Self {
        Self::Id(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    #[error("service locator must start with 'sid/' or 'name/': {0}")]
    MissingPrefix(String),

    #[error("invalid service id '{0}'")]
    InvalidId(String),

    #[error("invalid service name '{0}'")]
    InvalidName(String),
}

impl FromStr for ServiceLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(raw) = s.strip_prefix("sid/") {
            // Hyphenated 8-4-4-4-12 form only
            if !SID_PATTERN.is_match(raw) {
                return Err(LocatorError::InvalidId(raw.to_string()));
            }
            raw.parse::<ServiceId>()
                .map(Self::Id)
                .map_err(|_| LocatorError::InvalidId(raw.to_string()))
        } else if let Some(raw) = s.strip_prefix("name/") {
            Self::name(raw)
        } else {
            Err(LocatorError::MissingPrefix(s.to_string()))
        }
    }
}

impl TryFrom<String> for ServiceLocator {
    type Error = LocatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceLocator> for String {
    fn from(locator: ServiceLocator) -> Self {
        locator.to_string()
    }
}

impl fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "sid/{id}"),
            Self::Name(name) => write!(f, "name/{name}"),
        }
    }
}
