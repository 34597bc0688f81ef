//! Module Reference Resolution
//!
//! Maps the loosely-specified references callers hand to the loader onto one
//! canonical identifier per logical module. Supported reference shapes:
//! - `/abs/path.js` or `scheme://...` - Literal absolute reference, kept as-is
//! - `app` - Exact match in the override table
//! - `./core/errorHandler.js`, `core/errorHandler` - Relative reference; the
//!   last segment is looked up in the category table
//! - `errorHandler` - Bare name, looked up the same way
//!
//! Canonical ids have the form `category/name`. Anything that matches no rule
//! is returned unchanged as a best-effort id.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical identifier of a module.
///
/// Every reference denoting the same logical module resolves to the same
/// `CanonicalId`; it is the key for every loader table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    /// Wrap an already-canonical string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The module name without its category (`core/errorHandler` -> `errorHandler`).
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CanonicalId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CanonicalId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CanonicalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which rule produced a resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionRule {
    /// Literal absolute reference, returned unchanged.
    Absolute,
    /// Exact hit in the override table.
    Override,
    /// Relative path whose last segment has a known category.
    Relative,
    /// Bare module name with a known category.
    Bare,
    /// Nothing matched; the cleaned reference is used as a best-effort id.
    Unmatched,
}

/// Result of resolving a reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub id: CanonicalId,
    pub rule: ResolutionRule,
}

impl Resolution {
    /// Whether a resolution rule matched (anything but `Unmatched`).
    pub fn is_matched(&self) -> bool {
        self.rule != ResolutionRule::Unmatched
    }
}

/// Pure reference resolver built from static override and category tables.
#[derive(Clone, Debug)]
pub struct PathResolver {
    /// Exact reference -> canonical id.
    overrides: BTreeMap<String, CanonicalId>,

    /// Module name -> category.
    categories: BTreeMap<String, String>,

    /// File extensions stripped from the last path segment.
    extensions: Vec<String>,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PathResolver {
    /// Create a resolver with empty tables and the default extensions.
    pub fn new() -> Self {
        Self {
            overrides: BTreeMap::new(),
            categories: BTreeMap::new(),
            extensions: vec![".js".to_string(), ".mjs".to_string()],
        }
    }

    /// Add an override mapping an exact reference to a canonical id.
    pub fn with_override(mut self, reference: impl Into<String>, id: impl Into<CanonicalId>) -> Self {
        self.overrides.insert(reference.into(), id.into());
        self
    }

    /// Declare the category of a module name.
    pub fn with_category(mut self, name: impl Into<String>, category: impl Into<String>) -> Self {
        self.categories.insert(name.into(), category.into());
        self
    }

    /// Replace the list of strippable extensions.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve a reference to its canonical id.
    pub fn resolve(&self, reference: &str) -> CanonicalId {
        self.resolve_detailed(reference).id
    }

    /// Resolve a reference and report which rule matched.
    pub fn resolve_detailed(&self, reference: &str) -> Resolution {
        let cleaned = strip_disambiguation(reference);

        if is_absolute(cleaned) {
            return Resolution {
                id: CanonicalId::new(cleaned),
                rule: ResolutionRule::Absolute,
            };
        }

        if let Some(id) = self.overrides.get(cleaned) {
            return Resolution {
                id: id.clone(),
                rule: ResolutionRule::Override,
            };
        }

        let (segment, rule) = match cleaned.rsplit_once('/') {
            Some((_, last)) => (last, ResolutionRule::Relative),
            None => (cleaned, ResolutionRule::Bare),
        };
        let name = self.strip_extension(segment);

        match self.categories.get(name) {
            Some(category) => Resolution {
                id: CanonicalId::new(format!("{}/{}", category, name)),
                rule,
            },
            None => Resolution {
                id: CanonicalId::new(cleaned),
                rule: ResolutionRule::Unmatched,
            },
        }
    }

    fn strip_extension<'a>(&self, segment: &'a str) -> &'a str {
        self.extensions
            .iter()
            .find_map(|ext| segment.strip_suffix(ext.as_str()))
            .filter(|name| !name.is_empty())
            .unwrap_or(segment)
    }
}

/// Drop a trailing query or fragment (`?dup=1`, `#2`) and surrounding whitespace.
///
/// Two references that differ only by such a marker denote the same module.
pub fn strip_disambiguation(reference: &str) -> &str {
    let end = reference.find(['?', '#']).unwrap_or(reference.len());
    reference[..end].trim()
}

/// Check if a reference is a literal absolute reference.
pub fn is_absolute(reference: &str) -> bool {
    reference.starts_with('/') || reference.contains("://")
}
