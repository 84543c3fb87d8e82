//! Configuration for the sync engine.

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of documents requested when a read hits an unloaded range.
    pub page_size: u32,
    /// Out-of-order transitions held before the stream is declared broken.
    pub max_buffered_transitions: usize,
    /// Number of reflected mutation ids remembered for status queries.
    pub reflected_history: usize,
    /// Whether pages and pending mutations are written to local persistence.
    pub persistence_enabled: bool,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            page_size: 25,
            max_buffered_transitions: 64,
            reflected_history: 128,
            persistence_enabled: true,
        }
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the transition buffer limit.
    pub fn with_max_buffered_transitions(mut self, max: usize) -> Self {
        self.max_buffered_transitions = max;
        self
    }

    /// Sets the reflected mutation history length.
    pub fn with_reflected_history(mut self, len: usize) -> Self {
        self.reflected_history = len;
        self
    }

    /// Enables or disables persistence.
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persistence_enabled = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
