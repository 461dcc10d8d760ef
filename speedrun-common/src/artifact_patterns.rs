//! Artifact file-name patterns used when collecting outputs from the remote
//! project directory.
//!
//! Patterns are `find -name` style globs (`*`, `?`, `[...]`) matched against
//! the final path component only.

use thiserror::Error;

pub const DEFAULT_ARTIFACT_PATTERNS: &str = "*.pt,*.pth,*.pkl,*.h5,*.hdf5";

#[derive(Debug, Error)]
#[error("invalid artifact pattern '{pattern}': {source}")]
pub struct InvalidPattern {
    pub pattern: String,
    #[source]
    source: glob::PatternError,
}

/// A compiled, deduplicated list of artifact globs.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPatterns {
    patterns: Vec<glob::Pattern>,
}

impl Default for ArtifactPatterns {
    fn default() -> Self {
        // The built-in list is static and known to compile.
        Self::parse(None).unwrap_or(Self { patterns: Vec::new() })
    }
}

impl ArtifactPatterns {
    /// Parse comma-separated patterns.
    ///
    /// - Trims whitespace
    /// - Drops empty entries and duplicates
    /// - If input is empty/None, uses the default patterns
    pub fn parse(raw: Option<&str>) -> Result<Self, InvalidPattern> {
        let mut raw_list: Vec<&str> = Vec::new();
        for p in raw.unwrap_or("").split(',').map(str::trim) {
            if !p.is_empty() && !raw_list.contains(&p) {
                raw_list.push(p);
            }
        }
        if raw_list.is_empty() {
            raw_list = DEFAULT_ARTIFACT_PATTERNS.split(',').collect();
        }

        let patterns = raw_list
            .into_iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|source| InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Pattern sources, in configured order.
    pub fn as_strs(&self) -> Vec<&str> {
        self.patterns.iter().map(glob::Pattern::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if the final component of the remote `path` matches any pattern.
    /// Matching is case-sensitive, like `find -name`.
    pub fn matches_file(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        if name.is_empty() {
            return false;
        }
        self.patterns.iter().any(|p| p.matches(name))
    }
}
