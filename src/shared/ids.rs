use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

pub fn validate_identifier_value(kind: &str, value: &str, allow_dot: bool) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value.starts_with('.') {
        return Err(format!("{kind} must not start with '.'"));
    }
    if value.chars().all(|ch| {
        ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || (allow_dot && ch == '.')
    }) {
        return Ok(());
    }
    if allow_dot {
        Err(format!(
            "{kind} must use only ASCII letters, digits, '.', '-' or '_'"
        ))
    } else {
        Err(format!(
            "{kind} must use only ASCII letters, digits, '-' or '_'"
        ))
    }
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal, $allow_dot:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                validate_identifier_value($kind, raw, $allow_dot)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

// Task ids are task file names, so they keep their extension.
define_id_type!(TaskId, "task id", true);
define_id_type!(StepId, "step id", false);

impl TaskId {
    /// File name without its extension, used to label snapshot directories.
    pub fn stem(&self) -> &str {
        match self.0.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.0,
        }
    }
}

/// Four lowercase hex characters of OS randomness.
pub fn random_suffix() -> Result<String, String> {
    let mut bytes = [0_u8; 2];
    getrandom::getrandom(&mut bytes)
        .map_err(|err| format!("failed to generate id randomness: {err}"))?;
    Ok(format!("{:02x}{:02x}", bytes[0], bytes[1]))
}
