//! Opaque identifiers handed out by the media server.
//!
//! Plex addresses every library section, show, season and episode by a
//! string "rating key" and every account by a numeric id. None of them carry
//! meaning on our side, so they are modelled as distinct string newtypes that
//! cannot be mixed up at call sites.

use std::fmt;

use crate::error::{ModelError, Result};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Builds the id, rejecting empty or whitespace-only input.
            pub fn parse(id: &str) -> Result<Self> {
                let trimmed = id.trim();
                if trimmed.is_empty() {
                    return Err(ModelError::EmptyId($label));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_id!(
    /// Library section key.
    LibraryId,
    "library"
);
opaque_id!(
    /// Show (grandparent) rating key.
    ShowId,
    "show"
);
opaque_id!(
    /// Season (parent) rating key.
    SeasonId,
    "season"
);
opaque_id!(
    /// Episode rating key.
    EpisodeId,
    "episode"
);
opaque_id!(
    /// Account id, covering the owner as well as managed/home users.
    UserId,
    "user"
);
opaque_id!(
    /// Media part key. An episode owns one part per file.
    PartId,
    "part"
);
