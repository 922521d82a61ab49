//! Scope hierarchy
//!
//! A scope is one geographic level (city, country, continent, ...) with its own
//! notability threshold. The configured scopes run from most specific to least
//! specific and always end with the unrestricted global scope.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Default notability threshold when a place does not configure one
pub const DEFAULT_THRESHOLD: i64 = 5;

/// Identifier text used for the unrestricted scope in configuration
pub const GLOBAL_ID: &str = "global";

/// Upstream place restriction of a scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScopeId {
    /// One or more iNaturalist place ids, queried together
    Places(Vec<u64>),
    /// No geographic restriction
    Global,
}

impl ScopeId {
    /// Parse the configuration form: `"global"`, `"6744"` or `"6744,97394"`
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(GLOBAL_ID) || raw.eq_ignore_ascii_case("__global") {
            return Some(ScopeId::Global);
        }

        let ids = raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse::<u64>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .ok()?;

        Some(ScopeId::Places(ids))
    }

    pub fn is_global(&self) -> bool {
        matches!(self, ScopeId::Global)
    }

    /// Value for the upstream `place_id` query parameter (`None` for global)
    pub fn query_value(&self) -> Option<String> {
        match self {
            ScopeId::Global => None,
            ScopeId::Places(ids) => Some(
                ids.iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.query_value() {
            Some(ids) => f.write_str(&ids),
            None => f.write_str(GLOBAL_ID),
        }
    }
}

/// One geographic level of the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Upstream place restriction
    pub id: ScopeId,
    /// Short symbolic name, used as a key in derived structures and HTML anchors
    pub key: String,
    /// Human-readable name
    pub name: String,
    /// Species with at most this many observations in the scope are notable
    pub threshold: i64,
    /// Badge text shown next to a first observation
    pub first_text: String,
}

impl Scope {
    /// Build a scope with the default key and first-observation text
    pub fn new(id: ScopeId, name: impl Into<String>, threshold: i64) -> Self {
        let name = name.into();
        Self {
            key: id.to_string(),
            first_text: default_first_text(&name),
            id,
            name,
            threshold,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_first_text(mut self, text: impl Into<String>) -> Self {
        self.first_text = text.into();
        self
    }

    /// Whether a species with `count` observations in this scope is notable
    pub fn is_notable(&self, count: u64) -> bool {
        i64::try_from(count)
            .map(|count| count <= self.threshold)
            .unwrap_or(false)
    }
}

/// Badge text used when a place does not configure `first_text`
pub fn default_first_text(name: &str) -> String {
    format!("First {} observation!", name)
}

/// Validated, ordered list of scopes
///
/// Immutable once built. Iteration is restartable and always yields the
/// configured order, most specific first, global last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeHierarchy {
    scopes: Vec<Scope>,
}

impl ScopeHierarchy {
    /// Validate configured scopes
    ///
    /// Rejects an empty list, a final entry that is not global, a global entry
    /// before the end, negative thresholds, empty place lists, and duplicated
    /// identifiers or keys.
    pub fn validate(scopes: Vec<Scope>) -> Result<Self, ValidationError> {
        let last = scopes.last().ok_or(ValidationError::Empty)?;
        if !last.id.is_global() {
            return Err(ValidationError::GlobalNotLast(last.key.clone()));
        }

        let mut seen_ids = HashSet::new();
        let mut seen_keys = HashSet::new();

        for (position, scope) in scopes.iter().enumerate() {
            if scope.id.is_global() && position + 1 != scopes.len() {
                return Err(ValidationError::GlobalNotTerminal(position));
            }
            if let ScopeId::Places(ids) = &scope.id {
                if ids.is_empty() {
                    return Err(ValidationError::EmptyPlaceIds(scope.key.clone()));
                }
            }
            if scope.threshold < 0 {
                return Err(ValidationError::NegativeThreshold {
                    key: scope.key.clone(),
                    threshold: scope.threshold,
                });
            }
            if !seen_ids.insert(canonical_ids(&scope.id)) {
                return Err(ValidationError::DuplicateIdentifier(scope.id.to_string()));
            }
            if !seen_keys.insert(scope.key.as_str()) {
                return Err(ValidationError::DuplicateKey(scope.key.clone()));
            }
        }

        Ok(Self { scopes })
    }

    /// Scopes in configured order
    pub fn iter(&self) -> std::slice::Iter<'_, Scope> {
        self.scopes.iter()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Scope> {
        self.scopes.iter().find(|scope| scope.key == key)
    }

    /// The terminating unrestricted scope
    pub fn global(&self) -> &Scope {
        // validate() guarantees a non-empty list ending in the global scope
        &self.scopes[self.scopes.len() - 1]
    }

    pub fn as_slice(&self) -> &[Scope] {
        &self.scopes
    }
}

impl<'a> IntoIterator for &'a ScopeHierarchy {
    type Item = &'a Scope;
    type IntoIter = std::slice::Iter<'a, Scope>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Place lists that differ only in order or repetition name the same area
fn canonical_ids(id: &ScopeId) -> ScopeId {
    match id {
        ScopeId::Global => ScopeId::Global,
        ScopeId::Places(ids) => {
            let mut ids = ids.clone();
            ids.sort_unstable();
            ids.dedup();
            ScopeId::Places(ids)
        }
    }
}
