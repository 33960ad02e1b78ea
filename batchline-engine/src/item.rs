//! Item source/sink adapter boundary
//!
//! The engine consumes items through these traits and produces no I/O of its
//! own. Readers and writers are external collaborators; the engine only
//! requires that a reader can be positioned for restart and that a writer
//! reports whether it can isolate a failure to a single item.

use std::fmt;

use async_trait::async_trait;

/// Classification of an item-level error, consumed by the skip policy
///
/// Classes not listed in a policy's allowed set are never skippable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A record failed domain validation
    Validation,
    /// A record could not be parsed
    Format,
    /// An I/O failure while reading or writing
    Io,
    /// Anything else
    Other,
}

/// An error raised for a single item during read, process, or write
#[derive(Debug, Clone)]
pub struct ItemError {
    pub class: ErrorClass,
    pub message: String,
}

impl ItemError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Format, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Io, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Other, message)
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} error: {}", self.class, self.message)
    }
}

impl std::error::Error for ItemError {}

/// Item source
///
/// `read` returns `Ok(None)` at end of input. `open` positions the cursor:
/// `position` is the number of read attempts already committed by previous
/// executions, and the reader must not yield those items again.
#[async_trait]
pub trait ItemReader<T>: Send {
    async fn open(&mut self, position: u64) -> std::result::Result<(), ItemError>;

    /// Reads the next item
    ///
    /// An `Err` must leave the reader positioned past the failing record, so
    /// the next call attempts the record after it; a skipped read advances
    /// the committed cursor by one on that assumption. A reader that
    /// re-yields the same failure would exhaust the skip ceiling on a single
    /// record.
    async fn read(&mut self) -> std::result::Result<Option<T>, ItemError>;
}

/// Per-item processing function applied between read and write
#[async_trait]
pub trait ItemProcessor<I, O>: Send {
    async fn process(&mut self, item: I) -> std::result::Result<O, ItemError>;
}

/// Identity processor for steps that move items through unchanged
pub struct PassthroughProcessor;

#[async_trait]
impl<T: Send + 'static> ItemProcessor<T, T> for PassthroughProcessor {
    async fn process(&mut self, item: T) -> std::result::Result<T, ItemError> {
        Ok(item)
    }
}

/// Failure reported by a sink
#[derive(Debug)]
pub enum WriteError {
    /// The sink isolated the failure to one item and rolled the call back
    Item { index: usize, error: ItemError },
    /// The whole call failed; the engine retries items individually
    Chunk(ItemError),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Item { index, error } => {
                write!(f, "write failed at item {}: {}", index, error)
            }
            WriteError::Chunk(error) => write!(f, "chunk write failed: {}", error),
        }
    }
}

impl std::error::Error for WriteError {}

/// Item sink
///
/// A successful `write` call must make all passed items durable; a failed
/// call must leave none of them visible (the engine relies on this when it
/// removes a skipped item and rewrites the remainder).
#[async_trait]
pub trait ItemWriter<T>: Send {
    async fn write(&mut self, items: &[T]) -> std::result::Result<(), WriteError>;
}
