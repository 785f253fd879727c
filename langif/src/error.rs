use thiserror::Error;

use crate::{FieldRef, ItemKind, Strategy, TagSite};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LangifError {
    /// unknown handle, or its record already reached refcount 0
    #[error("invalid reference {0}")]
    InvalidReference(FieldRef),

    #[error("{reference} is an {found} value, operation requires {expected}")]
    StrategyMismatch {
        reference: FieldRef,
        expected: Strategy,
        found: Strategy,
    },

    #[error("double release of {0}")]
    DoubleRelease(FieldRef),

    #[error("out of memory while allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("tag bits of {bits:#018x} are not valid at a {site:?} site")]
    InvalidTag { bits: u64, site: TagSite },

    #[error("pattern expects {expected} entries, record has {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("pattern entry {index} expects a {expected}")]
    PatternMismatch { index: usize, expected: ItemKind },

    #[error("input record was already bound")]
    AlreadyBound,
}

pub type Result<T> = std::result::Result<T, LangifError>;
