//! Chunk processor
//!
//! Reads items into a bounded buffer, applies the processing function per
//! item, and writes the survivors in one call. Skip detection happens here
//! for all three phases; persistence of the outcome is owned by the step.

use tracing::{debug, warn};

use crate::item::{ItemError, ItemProcessor, ItemReader, ItemWriter, WriteError};
use crate::skip::SkipPolicy;

/// Result of processing one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Items successfully read
    pub read: u32,
    /// Items successfully written
    pub written: u32,
    /// Items skipped in any phase
    pub skipped: u32,
    /// Read attempts consumed, including skipped reads; this is how far the
    /// committed cursor advances
    pub cursor_advance: u64,
    /// Whether the source reported end of input
    pub end_of_input: bool,
}

impl ChunkOutcome {
    /// Whether the chunk consumed any input at all
    pub fn is_empty(&self) -> bool {
        self.read == 0 && self.skipped == 0
    }
}

/// Drives read/process/write for one step execution
///
/// A skippable read failure uses up one chunk slot and advances the cursor
/// past the offending record without aborting the chunk; a non-skippable
/// failure in any phase aborts the chunk and propagates as fatal.
pub struct ChunkProcessor<I, O> {
    reader: Box<dyn ItemReader<I>>,
    processor: Box<dyn ItemProcessor<I, O>>,
    writer: Box<dyn ItemWriter<O>>,
    chunk_size: usize,
}

impl<I: Send, O: Send> ChunkProcessor<I, O> {
    pub fn new(
        reader: Box<dyn ItemReader<I>>,
        processor: Box<dyn ItemProcessor<I, O>>,
        writer: Box<dyn ItemWriter<O>>,
        chunk_size: usize,
    ) -> Self {
        Self {
            reader,
            processor,
            writer,
            chunk_size,
        }
    }

    /// Positions the reader for (re)start
    pub async fn open(&mut self, position: u64) -> std::result::Result<(), ItemError> {
        self.reader.open(position).await
    }

    /// Processes one chunk
    ///
    /// `prior_skips` is the skip count already accumulated by the current
    /// step execution; the policy sees the cumulative total. On `Err` the
    /// chunk is aborted and nothing from it may be committed.
    pub async fn process_chunk(
        &mut self,
        policy: &dyn SkipPolicy,
        prior_skips: u32,
    ) -> std::result::Result<ChunkOutcome, ItemError> {
        let mut outcome = ChunkOutcome::default();

        let items = self.read_phase(policy, prior_skips, &mut outcome).await?;
        let survivors = self
            .process_phase(policy, prior_skips, items, &mut outcome)
            .await?;
        self.write_phase(policy, prior_skips, survivors, &mut outcome)
            .await?;

        Ok(outcome)
    }

    async fn read_phase(
        &mut self,
        policy: &dyn SkipPolicy,
        prior_skips: u32,
        outcome: &mut ChunkOutcome,
    ) -> std::result::Result<Vec<I>, ItemError> {
        let mut items = Vec::with_capacity(self.chunk_size);

        for _ in 0..self.chunk_size {
            match self.reader.read().await {
                Ok(Some(item)) => {
                    outcome.read += 1;
                    outcome.cursor_advance += 1;
                    items.push(item);
                }
                Ok(None) => {
                    outcome.end_of_input = true;
                    break;
                }
                Err(error) => {
                    if policy.should_skip(&error, prior_skips + outcome.skipped) {
                        debug!("Skipping item on read: {}", error);
                        outcome.skipped += 1;
                        outcome.cursor_advance += 1;
                    } else {
                        return Err(error);
                    }
                }
            }
        }

        Ok(items)
    }

    async fn process_phase(
        &mut self,
        policy: &dyn SkipPolicy,
        prior_skips: u32,
        items: Vec<I>,
        outcome: &mut ChunkOutcome,
    ) -> std::result::Result<Vec<O>, ItemError> {
        let mut survivors = Vec::with_capacity(items.len());

        for item in items {
            match self.processor.process(item).await {
                Ok(output) => survivors.push(output),
                Err(error) => {
                    if policy.should_skip(&error, prior_skips + outcome.skipped) {
                        debug!("Skipping item on process: {}", error);
                        outcome.skipped += 1;
                    } else {
                        return Err(error);
                    }
                }
            }
        }

        Ok(survivors)
    }

    async fn write_phase(
        &mut self,
        policy: &dyn SkipPolicy,
        prior_skips: u32,
        mut items: Vec<O>,
        outcome: &mut ChunkOutcome,
    ) -> std::result::Result<(), ItemError> {
        while !items.is_empty() {
            match self.writer.write(&items).await {
                Ok(()) => {
                    outcome.written += items.len() as u32;
                    return Ok(());
                }
                Err(WriteError::Item { index, error }) => {
                    // Sink isolated the fault; drop the offender and rewrite
                    if index >= items.len() {
                        return Err(ItemError::other(format!(
                            "sink reported failure at index {} for a chunk of {} items",
                            index,
                            items.len()
                        )));
                    }
                    if policy.should_skip(&error, prior_skips + outcome.skipped) {
                        warn!("Skipping item on write: {}", error);
                        outcome.skipped += 1;
                        items.remove(index);
                    } else {
                        return Err(error);
                    }
                }
                Err(WriteError::Chunk(error)) => {
                    debug!(
                        "Chunk write failed ({}); retrying items individually",
                        error
                    );
                    return self
                        .write_items_individually(policy, prior_skips, items, outcome)
                        .await;
                }
            }
        }

        Ok(())
    }

    /// Fallback for sinks without item-level fault isolation: the chunk is
    /// retried once with items written individually, each candidate
    /// independently skippable
    async fn write_items_individually(
        &mut self,
        policy: &dyn SkipPolicy,
        prior_skips: u32,
        items: Vec<O>,
        outcome: &mut ChunkOutcome,
    ) -> std::result::Result<(), ItemError> {
        for item in items {
            match self.writer.write(std::slice::from_ref(&item)).await {
                Ok(()) => outcome.written += 1,
                Err(WriteError::Item { error, .. }) | Err(WriteError::Chunk(error)) => {
                    if policy.should_skip(&error, prior_skips + outcome.skipped) {
                        warn!("Skipping item on single-item write: {}", error);
                        outcome.skipped += 1;
                    } else {
                        return Err(error);
                    }
                }
            }
        }

        Ok(())
    }
}
