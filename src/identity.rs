//! Partner identity abstraction.
//!
//! The session core only needs a partner identity for friend-relationship
//! lookups in the surrounding application; negotiation itself runs purely
//! on transport ids. The trait keeps the core independent of whatever
//! identity scheme the application uses.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Trait for stable user identities attached to a session partner.
///
/// Implementations must be serializable, comparable and displayable.
pub trait PeerIdentity:
    Clone + Debug + Display + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Convert the identity to its canonical string representation
    fn to_string_repr(&self) -> String;

    /// Try to parse an identity from its string representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}

/// Simple string-based identity, suitable for tests and applications
/// whose account ids are already strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentityString(pub String);

impl PeerIdentityString {
    /// Create a new string-based identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentityString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for PeerIdentityString {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PeerIdentityString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
