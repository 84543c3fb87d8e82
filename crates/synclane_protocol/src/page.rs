//! Page requests and results.

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::key::{Bound, Direction, IndexKey, KeyRange};

/// A request for one contiguous slice of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Table name.
    pub table: String,
    /// Index name.
    pub index: String,
    /// Inclusive lower cut.
    pub lower: Bound,
    /// Exclusive upper cut.
    pub upper: Bound,
    /// Which end of the range to start reading from.
    pub direction: Direction,
    /// Maximum number of documents. `None` reads the whole range.
    pub limit: Option<u32>,
}

impl PageRequest {
    /// Creates an unlimited ascending request over a range.
    pub fn new(table: impl Into<String>, index: impl Into<String>, range: KeyRange) -> Self {
        Self {
            table: table.into(),
            index: index.into(),
            lower: range.lower,
            upper: range.upper,
            direction: Direction::Asc,
            limit: None,
        }
    }

    /// Sets the direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Sets the limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The requested range.
    pub fn range(&self) -> KeyRange {
        KeyRange::new(self.lower.clone(), self.upper.clone())
    }
}

/// A document together with its key in the page's index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDocument {
    /// Key of the document in the index.
    pub key: IndexKey,
    /// The document.
    pub document: Document,
}

/// A loaded slice: every authorized document of `[lower, upper)`, in
/// ascending key order regardless of the request direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// Documents in ascending key order.
    pub documents: Vec<PageDocument>,
    /// Inclusive lower cut of the slice.
    pub lower: Bound,
    /// Exclusive upper cut of the slice.
    pub upper: Bound,
}

impl PageResult {
    /// The range this slice covers.
    pub fn range(&self) -> KeyRange {
        KeyRange::new(self.lower.clone(), self.upper.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let req = PageRequest::new("messages", "by_id", KeyRange::all())
            .with_direction(Direction::Desc)
            .with_limit(10);
        assert_eq!(req.limit, Some(10));
        assert_eq!(req.direction, Direction::Desc);
        assert_eq!(req.range(), KeyRange::all());
    }
}
