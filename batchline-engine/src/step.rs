//! Step execution
//!
//! A step is one unit of the job flow. The chunk-oriented step drives the
//! chunk processor through the STARTING -> STARTED -> COMPLETED/FAILED
//! lifecycle, persisting counters and the committed read position after
//! every chunk. Embedders can plug custom steps (e.g. an error-logging
//! step) through the [`Step`] trait.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use batchline_core::domain::context::{ACTIVE_STEP_KEY, ContextValue, read_position_key};
use batchline_core::domain::job::{JobExecution, JobInstance};
use batchline_core::domain::status::BatchStatus;
use batchline_core::domain::step::ExitStatus;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::chunk::ChunkProcessor;
use crate::error::{BatchError, Result};
use crate::item::{ItemProcessor, ItemReader, ItemWriter};
use crate::repository::{context_repository, step_repository};
use crate::skip::{NeverSkipPolicy, SkipPolicy};

/// Everything a step needs to execute within one job execution
pub struct StepContext<'a> {
    pub pool: &'a SqlitePool,
    pub instance: &'a JobInstance,
    pub execution: &'a JobExecution,
    /// Cooperative stop flag, observed at chunk boundaries only
    pub stop: Arc<AtomicBool>,
}

impl StepContext<'_> {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// One executable unit of a job flow
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the step to completion and returns its exit status
    ///
    /// Item-level failures are handled inside the step (skip or FAILED exit
    /// status); an `Err` from this method means the engine itself failed,
    /// e.g. a repository write.
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<ExitStatus>;
}

type ReaderFactory<I> = Box<dyn Fn() -> Box<dyn ItemReader<I>> + Send + Sync>;
type ProcessorFactory<I, O> = Box<dyn Fn() -> Box<dyn ItemProcessor<I, O>> + Send + Sync>;
type WriterFactory<O> = Box<dyn Fn() -> Box<dyn ItemWriter<O>> + Send + Sync>;

/// Chunk-oriented step
///
/// Reader, processor, and writer are created fresh for every execution of
/// the step, so a restarted job never sees stale adapter state.
pub struct ChunkStep<I, O> {
    name: String,
    chunk_size: usize,
    policy: Box<dyn SkipPolicy>,
    reader_factory: ReaderFactory<I>,
    processor_factory: ProcessorFactory<I, O>,
    writer_factory: WriterFactory<O>,
}

impl<I: Send + 'static, O: Send + 'static> ChunkStep<I, O> {
    pub fn builder(name: impl Into<String>) -> ChunkStepBuilder<I, O> {
        ChunkStepBuilder {
            name: name.into(),
            chunk_size: ChunkStepBuilder::<I, O>::DEFAULT_CHUNK_SIZE,
            policy: None,
            reader_factory: None,
            processor_factory: None,
            writer_factory: None,
        }
    }

    async fn run_chunks(
        &self,
        ctx: &StepContext<'_>,
        mut chunk: ChunkProcessor<I, O>,
        mut position: u64,
    ) -> Result<ExitStatus> {
        let mut step = step_repository::create(ctx.pool, ctx.execution.id, &self.name).await?;
        let position_key = read_position_key(&self.name);

        if let Err(error) = chunk.open(position).await {
            warn!("Step '{}' failed to open its reader: {}", self.name, error);
            step_repository::complete(ctx.pool, step.id, BatchStatus::Failed, ExitStatus::Failed)
                .await?;
            return Ok(ExitStatus::Failed);
        }

        step_repository::mark_started(ctx.pool, step.id).await?;
        info!(
            "Step '{}' started (execution {}, position {})",
            self.name, ctx.execution.id, position
        );

        loop {
            if ctx.stop_requested() {
                info!("Step '{}' observed stop request at chunk boundary", self.name);
                step_repository::complete(
                    ctx.pool,
                    step.id,
                    BatchStatus::Stopped,
                    ExitStatus::Stopped,
                )
                .await?;
                return Ok(ExitStatus::Stopped);
            }

            match chunk.process_chunk(self.policy.as_ref(), step.skip_count).await {
                Ok(outcome) => {
                    if outcome.is_empty() {
                        break;
                    }

                    step.read_count += outcome.read;
                    step.write_count += outcome.written;
                    step.skip_count += outcome.skipped;
                    step.commit_count += 1;
                    position += outcome.cursor_advance;

                    // The chunk is only committed once this write succeeds
                    step_repository::commit_chunk(ctx.pool, &step, &position_key, position)
                        .await?;
                    debug!(
                        "Step '{}' committed chunk {} (position {}, {} skips so far)",
                        self.name, step.commit_count, position, step.skip_count
                    );

                    if outcome.end_of_input {
                        break;
                    }
                }
                Err(error) => {
                    warn!("Step '{}' aborted by fatal error: {}", self.name, error);
                    step_repository::complete(
                        ctx.pool,
                        step.id,
                        BatchStatus::Failed,
                        ExitStatus::Failed,
                    )
                    .await?;
                    return Ok(ExitStatus::Failed);
                }
            }
        }

        let exit_status = if step.skip_count > 0 {
            ExitStatus::CompletedWithSkips
        } else {
            ExitStatus::Completed
        };
        step_repository::complete(ctx.pool, step.id, BatchStatus::Completed, exit_status).await?;
        info!(
            "Step '{}' completed: {} read, {} written, {} skipped, {} commits",
            self.name, step.read_count, step.write_count, step.skip_count, step.commit_count
        );

        Ok(exit_status)
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Step for ChunkStep<I, O> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<ExitStatus> {
        // Publish the active step name for downstream steps
        context_repository::put(
            ctx.pool,
            ctx.execution.id,
            ACTIVE_STEP_KEY,
            &ContextValue::String(self.name.clone()),
        )
        .await?;

        // Resume at the last committed position; fresh executions start at 0
        let position = context_repository::get(
            ctx.pool,
            ctx.execution.id,
            &read_position_key(&self.name),
        )
        .await?
        .and_then(|v| v.as_integer())
        .unwrap_or(0) as u64;

        let chunk = ChunkProcessor::new(
            (self.reader_factory)(),
            (self.processor_factory)(),
            (self.writer_factory)(),
            self.chunk_size,
        );

        self.run_chunks(ctx, chunk, position).await
    }
}

/// Builder for [`ChunkStep`]
///
/// Chunk size and skip policy are configuration, not hard-coded engine
/// behavior; the policy defaults to never skipping.
pub struct ChunkStepBuilder<I, O> {
    name: String,
    chunk_size: usize,
    policy: Option<Box<dyn SkipPolicy>>,
    reader_factory: Option<ReaderFactory<I>>,
    processor_factory: Option<ProcessorFactory<I, O>>,
    writer_factory: Option<WriterFactory<O>>,
}

impl<I: Send + 'static, O: Send + 'static> ChunkStepBuilder<I, O> {
    pub const DEFAULT_CHUNK_SIZE: usize = 10;

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn skip_policy(mut self, policy: impl SkipPolicy + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    pub fn reader<R, F>(mut self, factory: F) -> Self
    where
        R: ItemReader<I> + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.reader_factory = Some(Box::new(move || Box::new(factory())));
        self
    }

    pub fn processor<P, F>(mut self, factory: F) -> Self
    where
        P: ItemProcessor<I, O> + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.processor_factory = Some(Box::new(move || Box::new(factory())));
        self
    }

    pub fn writer<W, F>(mut self, factory: F) -> Self
    where
        W: ItemWriter<O> + 'static,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.writer_factory = Some(Box::new(move || Box::new(factory())));
        self
    }

    pub fn build(self) -> Result<ChunkStep<I, O>> {
        if self.chunk_size == 0 {
            return Err(BatchError::Config(format!(
                "step '{}': chunk size must be greater than zero",
                self.name
            )));
        }
        let reader_factory = self.reader_factory.ok_or_else(|| {
            BatchError::Config(format!("step '{}': reader is required", self.name))
        })?;
        let processor_factory = self.processor_factory.ok_or_else(|| {
            BatchError::Config(format!("step '{}': processor is required", self.name))
        })?;
        let writer_factory = self.writer_factory.ok_or_else(|| {
            BatchError::Config(format!("step '{}': writer is required", self.name))
        })?;

        Ok(ChunkStep {
            name: self.name,
            chunk_size: self.chunk_size,
            policy: self.policy.unwrap_or_else(|| Box::new(NeverSkipPolicy)),
            reader_factory,
            processor_factory,
            writer_factory,
        })
    }
}
