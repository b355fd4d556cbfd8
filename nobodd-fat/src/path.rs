//! Slash-separated path resolution against a FAT directory tree.

/// A `/`-separated path into a FAT volume, resolved component-by-component
/// against directory entries with case-insensitive, long-or-short-name
/// matching (`Entry::name_matches`).
#[derive(Debug, Clone)]
pub struct FatPath(String);

impl FatPath {
    pub fn new(raw: impl Into<String>) -> FatPath {
        FatPath(raw.into())
    }

    /// Non-empty, non-`.` path components, in order.
    pub fn components(&self) -> Vec<&str> {
        self.0
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect()
    }

    pub fn is_root(&self) -> bool {
        self.components().is_empty()
    }

    pub fn display(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FatPath {
    fn from(raw: &str) -> FatPath {
        FatPath::new(raw)
    }
}

impl std::fmt::Display for FatPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
