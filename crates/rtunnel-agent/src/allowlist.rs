/// Default entry used when no allow-list is configured
pub const DEFAULT_ALLOW_PREFIX: &str = "127.0.0.1:";

/// Target address allow-list.
///
/// Each entry is a plain string prefix of `host:port` (for example
/// `"127.0.0.1:"` or `"10.0.0.5:5432"`). Matching is case-sensitive and the
/// first matching entry wins. An empty list allows nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowlist {
    prefixes: Vec<String>,
}

impl Allowlist {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|prefix: &String| !prefix.is_empty())
                .collect(),
        }
    }

    /// The entry that permits `address`, if any
    pub fn matching_entry(&self, address: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|prefix| address.starts_with(prefix.as_str()))
            .map(String::as_str)
    }

    pub fn is_allowed(&self, address: &str) -> bool {
        self.matching_entry(address).is_some()
    }

    pub fn entries(&self) -> &[String] {
        &self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl Default for Allowlist {
    fn default() -> Self {
        Self::new([DEFAULT_ALLOW_PREFIX])
    }
}
