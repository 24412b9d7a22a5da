use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::models::normalize_id;

/// CRUD access levels granted on a claimed hierarchy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    #[serde(rename = "C")]
    Create,
    #[serde(rename = "R")]
    Read,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
}

impl AccessLevel {
    pub const fn all() -> [AccessLevel; 4] {
        [
            AccessLevel::Create,
            AccessLevel::Read,
            AccessLevel::Update,
            AccessLevel::Delete,
        ]
    }

    pub const fn as_letter(self) -> char {
        match self {
            AccessLevel::Create => 'C',
            AccessLevel::Read => 'R',
            AccessLevel::Update => 'U',
            AccessLevel::Delete => 'D',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'C' => Some(AccessLevel::Create),
            'R' => Some(AccessLevel::Read),
            'U' => Some(AccessLevel::Update),
            'D' => Some(AccessLevel::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_letter())
    }
}

/// The caller's decoded hierarchy claims: path -> granted access levels.
///
/// Built once per inbound request from the token claim and threaded through
/// explicitly as part of [`RequestContext`]; never stored globally, never
/// persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    by_path: BTreeMap<String, BTreeSet<AccessLevel>>,
}

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes claims of the form `"/region/site-a:CRUD"` or `"/path:*"`.
    /// `*` expands to all four access levels.
    pub fn from_encoded<S: AsRef<str>>(encoded: &[S]) -> Result<Self> {
        let mut claims = Self::default();
        for entry in encoded {
            let entry = entry.as_ref();
            let (path, levels) = entry.rsplit_once(':').ok_or_else(|| {
                LibError::invalid(
                    "Claim entries must be path:accessLevels",
                    anyhow!("malformed claim entry {entry:?}"),
                )
            })?;
            if path.is_empty() {
                return Err(LibError::invalid(
                    "Claim entries must carry a hierarchy path",
                    anyhow!("empty path in claim entry {entry:?}"),
                ));
            }
            let granted = claims.by_path.entry(normalize_id(path)).or_default();
            if levels == "*" {
                granted.extend(AccessLevel::all());
                continue;
            }
            for letter in levels.chars() {
                let level = AccessLevel::from_letter(letter).ok_or_else(|| {
                    LibError::invalid(
                        "Unrecognized access level in claim",
                        anyhow!("unknown access level {letter:?} in claim entry {entry:?}"),
                    )
                })?;
                granted.insert(level);
            }
        }
        Ok(claims)
    }

    pub fn grant(&mut self, path: &str, levels: impl IntoIterator<Item = AccessLevel>) {
        self.by_path
            .entry(normalize_id(path))
            .or_default()
            .extend(levels);
    }

    /// All claimed hierarchy paths, in stable order.
    pub fn list_paths(&self) -> Vec<String> {
        self.by_path.keys().cloned().collect()
    }

    pub fn has_access_for_path(&self, path: &str, level: AccessLevel) -> bool {
        self.by_path
            .get(&normalize_id(path))
            .is_some_and(|granted| granted.contains(&level))
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

impl FromStr for Claims {
    type Err = LibError;

    /// Parses a comma-separated claim list, e.g. `"/a:CR,/b:*"`.
    fn from_str(s: &str) -> Result<Self> {
        let entries: Vec<&str> = s.split(',').filter(|e| !e.trim().is_empty()).collect();
        Self::from_encoded(&entries)
    }
}

/// Explicit per-request context. Created at request entry, dropped at exit.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    claims: Claims,
}

impl RequestContext {
    pub fn new(claims: Claims) -> Self {
        Self { claims }
    }

    /// Context for callers outside any FGAC boundary (e.g. trusted internal
    /// jobs when authorization is disabled).
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }
}
