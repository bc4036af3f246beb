#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

/// Index of a physical page record inside the page arena.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageIdx(pub u32);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ObjectId(pub u64);
/// Opaque handle naming the external pager backing a file-backed object.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PagerHandle(pub u64);

impl PageIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PageIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PageIdx {
    fn from(value: u32) -> Self {
        PageIdx(value)
    }
}

impl From<PageIdx> for u32 {
    fn from(value: PageIdx) -> Self {
        value.0
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReclaimError {
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("configuration: {0}")]
    Config(String),
    #[error("queue invariant violated: {0}")]
    InvariantViolation(String),
    #[error("no free page available")]
    Exhausted,
    #[error("pageout subsystem is shutting down")]
    ShuttingDown,
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("stats export: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReclaimError>;
