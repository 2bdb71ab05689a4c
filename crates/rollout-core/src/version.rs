//! Dotted numeric version type.
//!
//! The wire protocol and the version store use dotted numeric versions
//! with up to four components (`"110.0.5478.1"`). Ordering compares
//! component-wise with missing components treated as zero, so `"1.0"`
//! and `"1.0.0.0"` compare equal.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Maximum number of dotted components accepted.
pub const MAX_COMPONENTS: usize = 4;

/// Error parsing a version string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The string was empty or had an empty component.
    #[error("empty version component in {0:?}")]
    EmptyComponent(String),

    /// A component was not a decimal number.
    #[error("invalid version component {component:?} in {input:?}")]
    InvalidComponent {
        /// The offending component.
        component: String,
        /// The full input string.
        input: String,
    },

    /// Too many dotted components.
    #[error("too many components in {0:?} (max {MAX_COMPONENTS})")]
    TooManyComponents(String),
}

/// An ordered, dotted numeric version.
#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<u32>,
}

impl Version {
    /// Parse a version from its dotted string form.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError`] if the string is empty, has a
    /// non-numeric component, or has more than [`MAX_COMPONENTS`]
    /// components.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        if input.is_empty() {
            return Err(VersionError::EmptyComponent(input.to_string()));
        }
        let mut components = Vec::new();
        for part in input.split('.') {
            if part.is_empty() {
                return Err(VersionError::EmptyComponent(input.to_string()));
            }
            let value: u32 = part
                .parse()
                .map_err(|_| VersionError::InvalidComponent {
                    component: part.to_string(),
                    input: input.to_string(),
                })?;
            components.push(value);
        }
        if components.len() > MAX_COMPONENTS {
            return Err(VersionError::TooManyComponents(input.to_string()));
        }
        Ok(Self { components })
    }

    /// The all-zero version used for registrations of apps that are
    /// not installed yet.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            components: vec![0],
        }
    }

    /// The raw components.
    #[must_use]
    pub fn components(&self) -> &[u32] {
        &self.components
    }

    /// Whether this version's string form starts with `prefix`.
    ///
    /// Used for server-directed version targeting and rollback: a
    /// target prefix of `"2.0."` matches `"2.0.1"` but not `"2.01"`
    /// (the match is on the rendered string, as in the wire protocol).
    #[must_use]
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.to_string().starts_with(prefix)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.components {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{c}")?;
            first = false;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {},
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality and hashing follow the zero-padded ordering, so `"1.0"`
// and `"1.0.0.0"` are one value everywhere.
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let trimmed = self
            .components
            .iter()
            .rposition(|&c| c != 0)
            .map_or(0, |i| i + 1);
        self.components[..trimmed].hash(state);
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
