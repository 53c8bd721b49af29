//! Version information for genstream.

/// genstream version from Cargo.toml
pub const GENSTREAM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Relay version.
    pub genstream: &'static str,
    /// Name of the configured store backend (e.g. "sqlite", "memory").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            genstream: GENSTREAM_VERSION,
            store: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }
}
