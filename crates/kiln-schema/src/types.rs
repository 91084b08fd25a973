//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings so the state document
//! stays readable and stable across versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Logical name of an image/container (e.g. `ldap`, `hgmaster`, `ansible-centos7`).
    Role
);

string_newtype!(
    /// Image identifier as reported by the container engine.
    ImageId
);

string_newtype!(
    /// Container identifier as reported by the container engine.
    ContainerId
);

string_newtype!(
    /// Network identifier as reported by the container engine.
    NetworkId
);

impl ImageId {
    /// The id without a `sha256:` algorithm prefix.
    pub fn bare(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }

    /// The 12-character prefix printed by build logs.
    pub fn short(&self) -> &str {
        let bare = self.bare();
        &bare[..12.min(bare.len())]
    }
}

/// Split a `repository:tag` reference. Registry hosts with ports
/// (`host:5000/repo:tag`) split on the last colon.
pub fn split_repo_tag(repotag: &str) -> (&str, &str) {
    match repotag.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (repotag, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_display_and_as_ref() {
        let role = Role::new("hgmaster");
        assert_eq!(role.to_string(), "hgmaster");
        assert_eq!(role.as_str(), "hgmaster");
        assert_eq!(AsRef::<str>::as_ref(&role), "hgmaster");
    }

    #[test]
    fn image_id_serde_roundtrip() {
        let id = ImageId::new("deadbeef");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: ImageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn image_id_short_strips_algorithm() {
        let id = ImageId::new(format!("sha256:{}", "ab".repeat(32)));
        assert_eq!(id.bare().len(), 64);
        assert_eq!(id.short(), "abababababab");

        let bare = ImageId::new("0123456789abcdef");
        assert_eq!(bare.short(), "0123456789ab");
    }

    #[test]
    fn split_repo_tag_handles_ports() {
        assert_eq!(split_repo_tag("ldap:abc"), ("ldap", "abc"));
        assert_eq!(
            split_repo_tag("registry:5000/ldap:abc"),
            ("registry:5000/ldap", "abc")
        );
        assert_eq!(split_repo_tag("registry:5000/ldap"), ("registry:5000/ldap", ""));
        assert_eq!(split_repo_tag("<none>:<none>"), ("<none>", "<none>"));
    }

    #[test]
    fn container_id_equality() {
        let a = ContainerId::new("same");
        let b = ContainerId::from("same");
        let c = ContainerId::new("diff");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a == "same");
    }
}
