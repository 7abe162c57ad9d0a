use std::fmt::{self, Display};
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::ClientError;

/// The stable identity of a peer on the maritime network.
///
/// Identities are URN-like strings of the form `scheme://body`, for example
/// `mmsi://219000606`. The protocol treats them as opaque labels; only the
/// syntactic shape is validated:
/// - scheme and body must both be non-empty
/// - the whole identifier must be ASCII
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaritimeId(String);

impl MaritimeId {
    /// Parses an identifier, validating its shape.
    ///
    /// # Errors
    /// Returns [`ClientError::Protocol`] if the input is not of the form
    /// `scheme://body` with non-empty ASCII parts.
    pub fn parse(id: impl Into<String>) -> Result<Self, ClientError> {
        let id = id.into();
        if !id.is_ascii() {
            return Err(ClientError::protocol("maritime id must be ASCII"));
        }
        let Some((scheme, body)) = id.split_once("://") else {
            return Err(ClientError::protocol(
                "maritime id must be of the form scheme://body",
            ));
        };
        if scheme.is_empty() || body.is_empty() {
            return Err(ClientError::protocol(
                "maritime id scheme and body must be non-empty",
            ));
        }
        Ok(Self(id))
    }

    /// Builds an MMSI-schemed identifier.
    #[must_use]
    pub fn mmsi(number: u64) -> Self {
        Self(format!("mmsi://{number}"))
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        // parse() guarantees the separator is present
        self.0.split_once("://").map(|(s, _)| s).unwrap_or_default()
    }

    #[must_use]
    pub fn body(&self) -> &str {
        self.0.split_once("://").map(|(_, b)| b).unwrap_or_default()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MaritimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MaritimeId {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MaritimeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MaritimeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urn_like_ids() {
        let id = MaritimeId::parse("mmsi://219000606").unwrap();
        assert_eq!(id.scheme(), "mmsi");
        assert_eq!(id.body(), "219000606");
        assert_eq!(id, MaritimeId::mmsi(219000606));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(MaritimeId::parse("219000606").is_err());
        assert!(MaritimeId::parse("://body").is_err());
        assert!(MaritimeId::parse("mmsi://").is_err());
        assert!(MaritimeId::parse("mmsi://øresund").is_err());
    }
}
