use globset::{Glob, GlobSet, GlobSetBuilder};

/// Set of shell-style patterns used to select modules.
///
/// `*` and `?` match any characters including `.` and `/`. A pattern that is
/// not a valid glob is matched literally. Empty patterns and empty values never
/// match.
#[derive(Debug, Clone)]
pub struct Patterns {
    literal: Vec<String>,
    set: GlobSet,
}

impl Patterns {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut literal = Vec::new();
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                continue;
            }
            literal.push(pattern.to_string());
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => tracing::warn!(pattern, "Invalid pattern, matching literally: {}", e),
            }
        }

        let set = builder.build().unwrap_or_else(|e| {
            tracing::warn!("Unable to compile patterns, matching literally: {}", e);
            GlobSet::empty()
        });

        Self { literal, set }
    }

    pub fn is_empty(&self) -> bool {
        self.literal.is_empty()
    }

    /// Exact membership, no wildcard expansion.
    pub fn contains(&self, value: &str) -> bool {
        !value.is_empty() && self.literal.iter().any(|p| p == value)
    }

    pub fn matches(&self, value: &str) -> bool {
        !value.is_empty() && (self.contains(value) || self.set.is_match(value))
    }
}
