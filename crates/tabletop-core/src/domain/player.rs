//! Connected players and their roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authorization level of a connected player.
///
/// Each role is gated by its own server password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Game master: full control over the session.
    Gm,
    /// Ordinary participant.
    Player,
}

/// Returned when a role name cannot be parsed.
#[derive(Debug, Error, PartialEq)]
#[error("unknown role '{0}', expected GM or PLAYER")]
pub struct UnknownRole(pub String);

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Gm => f.write_str("GM"),
            Role::Player => f.write_str("PLAYER"),
        }
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GM" => Ok(Role::Gm),
            "PLAYER" => Ok(Role::Player),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// How a player proved who they are during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    /// Knowledge of the role password.
    Password,
    /// Possession of the private key matching this public-key fingerprint.
    PublicKey { fingerprint: String },
}

/// A participant admitted into the session.
///
/// Created by a successful handshake and kept for as long as the connection
/// that produced it stays registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub role: Role,
    pub auth: AuthMethod,
}

impl Player {
    pub fn new(name: impl Into<String>, role: Role, auth: AuthMethod) -> Self {
        Self {
            name: name.into(),
            role,
            auth,
        }
    }

    pub fn is_gm(&self) -> bool {
        self.role == Role::Gm
    }

    /// Case-insensitive name comparison; player names are unique regardless of case.
    pub fn has_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.role)
    }
}
