//! Pagination direction.

use serde::{Deserialize, Serialize};

/// Which way a pagination request walks the timeline.
///
/// `Forward` is toward newer events, `Backward` toward older ones. Kept as
/// a proper sum type rather than a boolean so call sites read as what they
/// mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        matches!(self, Direction::Forward)
    }

    pub fn is_backward(self) -> bool {
        matches!(self, Direction::Backward)
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }

    /// The `dir` query parameter value for `/messages`.
    pub fn as_api_str(self) -> &'static str {
        match self {
            Direction::Forward => "f",
            Direction::Backward => "b",
        }
    }
}
