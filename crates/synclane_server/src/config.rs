//! Server configuration.

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper limit applied to every limited page request.
    pub max_page_size: u32,
    /// How many ids a page loop pulls from an index cursor at a time.
    pub index_batch_size: u32,
    /// Maximum number of page queries per connection.
    pub max_query_set: usize,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_page_size: 256,
            index_batch_size: 16,
            max_query_set: 1024,
        }
    }

    /// Sets the maximum page size.
    pub fn with_max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size;
        self
    }

    /// Sets the index batch size.
    pub fn with_index_batch_size(mut self, size: u32) -> Self {
        self.index_batch_size = size.max(1);
        self
    }

    /// Sets the maximum query set size.
    pub fn with_max_query_set(mut self, max: usize) -> Self {
        self.max_query_set = max;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
