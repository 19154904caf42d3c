//! Pre-admission entry filtering.
//!
//! [`EntryFilter`] decides from metadata alone whether an entry is extracted.
//! Checks run in a fixed, short-circuiting order:
//!
//! 1. the mandatory [`SecurityGate`]
//! 2. exclude patterns
//! 3. size bounds
//! 4. include patterns (at least one must match when any are configured)
//! 5. extension allowlist
//! 6. content-type allowlist (derived from the name)
//! 7. the custom predicate, which may still veto
//!
//! Directory records are structural: they face the security gate, exclude
//! patterns and the custom predicate, and skip the content checks unless
//! [`FilterCriteria::match_directories`] is set.
//!
//! A rejection is not an error. [`EntryFilter::evaluate`] reports why an entry
//! was left out, including whether the security gate refused it, so callers
//! that want to treat unsafe names as hard failures can do so explicitly.

mod content_type;
mod glob;
mod security;

pub use content_type::{content_type_allowed, content_type_for, extension_of};
pub use glob::GlobPattern;
pub use security::{NameViolation, SecurityGate};

use std::sync::Arc;
use tracing::{debug, warn};

use crate::archive::EntryRecord;
use crate::config::FilterConfig;
use crate::error::Result;

/// Caller-supplied final veto over an entry
pub type EntryPredicate = Arc<dyn Fn(&EntryRecord) -> bool + Send + Sync>;

/// Filter configuration for one run
#[derive(Clone)]
pub struct FilterCriteria {
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub allowed_content_types: Option<Vec<String>>,
    pub allowed_extensions: Option<Vec<String>>,
    pub custom_predicate: Option<EntryPredicate>,
    /// Run directories through the content checks too (default: false)
    pub match_directories: bool,
    pub max_name_length: usize,
}

impl Default for FilterCriteria {
    fn default() -> Self {
        Self {
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            min_size: None,
            max_size: None,
            allowed_content_types: None,
            allowed_extensions: None,
            custom_predicate: None,
            match_directories: false,
            max_name_length: SecurityGate::default().max_name_length(),
        }
    }
}

impl FilterCriteria {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            include_patterns: config.include.clone(),
            exclude_patterns: config.exclude.clone(),
            min_size: config.min_size,
            max_size: config.max_size,
            allowed_content_types: config.allowed_content_types.clone(),
            allowed_extensions: config.allowed_extensions.clone(),
            max_name_length: config.max_name_length,
            ..Self::default()
        }
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include_patterns.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    pub fn with_size_bounds(mut self, min_size: Option<u64>, max_size: Option<u64>) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_content_types<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_content_types = Some(content_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&EntryRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.custom_predicate = Some(Arc::new(predicate));
        self
    }
}

impl std::fmt::Debug for FilterCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterCriteria")
            .field("include_patterns", &self.include_patterns)
            .field("exclude_patterns", &self.exclude_patterns)
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("allowed_content_types", &self.allowed_content_types)
            .field("allowed_extensions", &self.allowed_extensions)
            .field("custom_predicate", &self.custom_predicate.is_some())
            .field("match_directories", &self.match_directories)
            .field("max_name_length", &self.max_name_length)
            .finish()
    }
}

/// Why an entry was left out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The security gate refused the name; nothing can override this
    Security(NameViolation),
    Excluded { pattern: String },
    TooSmall { size: u64, min: u64 },
    TooLarge { size: u64, max: u64 },
    NotIncluded,
    ExtensionNotAllowed,
    ContentTypeNotAllowed { content_type: &'static str },
    Predicate,
}

/// Outcome of evaluating one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject(Rejection),
}

impl FilterDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, FilterDecision::Accept)
    }
}

/// Compiled, immutable form of [`FilterCriteria`]
#[derive(Clone)]
pub struct EntryFilter {
    gate: SecurityGate,
    include: Vec<GlobPattern>,
    exclude: Vec<GlobPattern>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    allowed_extensions: Option<Vec<String>>,
    allowed_content_types: Option<Vec<String>>,
    predicate: Option<EntryPredicate>,
    match_directories: bool,
}

impl EntryFilter {
    /// Compile the criteria; fails on a malformed glob pattern
    pub fn new(criteria: FilterCriteria) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<GlobPattern>> {
            patterns.iter().map(|p| GlobPattern::new(p)).collect()
        };

        Ok(Self {
            gate: SecurityGate::new(criteria.max_name_length),
            include: compile(&criteria.include_patterns)?,
            exclude: compile(&criteria.exclude_patterns)?,
            min_size: criteria.min_size,
            max_size: criteria.max_size,
            allowed_extensions: criteria.allowed_extensions.map(|exts| {
                exts.iter()
                    .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                    .collect()
            }),
            allowed_content_types: criteria.allowed_content_types,
            predicate: criteria.custom_predicate,
            match_directories: criteria.match_directories,
        })
    }

    /// Filter that applies only the security gate
    pub fn security_only() -> Self {
        Self {
            gate: SecurityGate::default(),
            include: Vec::new(),
            exclude: Vec::new(),
            min_size: None,
            max_size: None,
            allowed_extensions: None,
            allowed_content_types: None,
            predicate: None,
            match_directories: false,
        }
    }

    /// Whether the entry should be extracted
    pub fn matches(&self, entry: &EntryRecord) -> bool {
        self.evaluate(entry).is_accept()
    }

    /// [`matches`](Self::matches) for callers holding an optional record;
    /// a missing record never matches
    pub fn matches_optional(&self, entry: Option<&EntryRecord>) -> bool {
        entry.is_some_and(|e| self.matches(e))
    }

    /// Decide on the entry and report why it was rejected, if it was
    pub fn evaluate(&self, entry: &EntryRecord) -> FilterDecision {
        match self.decide(entry) {
            Ok(()) => FilterDecision::Accept,
            Err(rejection) => {
                if let Rejection::Security(violation) = &rejection {
                    warn!(entry = %entry.name.escape_debug(), %violation, "unsafe entry name rejected");
                } else {
                    debug!(entry = %entry.name, ?rejection, "entry filtered out");
                }
                FilterDecision::Reject(rejection)
            }
        }
    }

    fn decide(&self, entry: &EntryRecord) -> std::result::Result<(), Rejection> {
        let name = entry.name.as_str();

        self.gate.check(name).map_err(Rejection::Security)?;

        if let Some(pattern) = self.exclude.iter().find(|p| p.matches(name)) {
            return Err(Rejection::Excluded {
                pattern: pattern.as_str().to_string(),
            });
        }

        if !entry.is_directory || self.match_directories {
            self.check_content(entry)?;
        }

        if let Some(predicate) = &self.predicate {
            if !predicate(entry) {
                return Err(Rejection::Predicate);
            }
        }

        Ok(())
    }

    fn check_content(&self, entry: &EntryRecord) -> std::result::Result<(), Rejection> {
        let name = entry.name.as_str();
        let size = entry.uncompressed_size;

        if let Some(min) = self.min_size.filter(|min| size < *min) {
            return Err(Rejection::TooSmall { size, min });
        }
        if let Some(max) = self.max_size.filter(|max| size > *max) {
            return Err(Rejection::TooLarge { size, max });
        }

        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(name)) {
            return Err(Rejection::NotIncluded);
        }

        if let Some(allowed) = &self.allowed_extensions {
            let ext = extension_of(name).unwrap_or_default();
            if !allowed.contains(&ext) {
                return Err(Rejection::ExtensionNotAllowed);
            }
        }

        if let Some(allowed) = &self.allowed_content_types {
            let content_type = content_type_for(name);
            if !allowed.iter().any(|a| content_type_allowed(a, content_type)) {
                return Err(Rejection::ContentTypeNotAllowed { content_type });
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for EntryFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryFilter")
            .field("gate", &self.gate)
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("has_predicate", &self.predicate.is_some())
            .finish_non_exhaustive()
    }
}
