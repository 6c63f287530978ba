use serde::{Serialize, Serializer};
use std::fmt;

const SYSTEM_IDENTITY: &str = "system";

/// Who a job is attributed to.
///
/// `System` is a reserved attribution for automatic runs; it never
/// authenticates anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    User(String),
    System,
}

impl Actor {
    pub fn user(name: impl Into<String>) -> Self {
        Actor::User(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Actor::User(name) => name,
            Actor::System => SYSTEM_IDENTITY,
        }
    }

    pub(crate) fn from_stored(raw: String) -> Self {
        if raw == SYSTEM_IDENTITY {
            Actor::System
        } else {
            Actor::User(raw)
        }
    }

    /// User names may not collide with the reserved system identity.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Actor::User(name) if name.trim().is_empty() => Err("user identity must not be empty".into()),
            Actor::User(name) if name == SYSTEM_IDENTITY => {
                Err(format!("'{SYSTEM_IDENTITY}' is a reserved identity"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Actor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
