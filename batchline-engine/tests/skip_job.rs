//! End-to-end skip handling
//!
//! A two-step job reads trade records from a flat file into a table, then
//! from the table into a tracking writer. Each step contains one faulty
//! record; the skip routes the flow through an error-logging step that tags
//! its rows with the active step name from the execution context. A second
//! launch with clean input goes straight through with no error rows, on a
//! new instance.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use batchline_core::domain::context::{ACTIVE_STEP_KEY, ContextValue};
use batchline_core::domain::status::BatchStatus;
use batchline_core::domain::step::ExitStatus;
use batchline_engine::db;
use batchline_engine::error::Result;
use batchline_engine::flow::{Flow, Target};
use batchline_engine::item::{ErrorClass, ItemError, ItemReader, ItemWriter, PassthroughProcessor, WriteError};
use batchline_engine::operator::JobOperator;
use batchline_engine::registry::{JobDefinition, JobRegistry, RunIdIncrementer};
use batchline_engine::repository::{context_repository, execution_repository, step_repository};
use batchline_engine::skip::LimitCheckingSkipPolicy;
use batchline_engine::step::{ChunkStep, Step, StepContext};
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq)]
struct TradeRecord {
    isin: String,
    quantity: i64,
    customer: String,
}

/// Reads `isin,quantity,customer` lines; a malformed quantity is a
/// format error for that record only
struct FlatFileTradeReader {
    path: PathBuf,
    lines: Vec<String>,
    position: usize,
}

impl FlatFileTradeReader {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lines: Vec::new(),
            position: 0,
        }
    }
}

#[async_trait]
impl ItemReader<TradeRecord> for FlatFileTradeReader {
    async fn open(&mut self, position: u64) -> std::result::Result<(), ItemError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ItemError::io(format!("cannot read {}: {}", self.path.display(), e)))?;
        self.lines = content.lines().map(str::to_string).collect();
        self.position = position as usize;
        Ok(())
    }

    async fn read(&mut self) -> std::result::Result<Option<TradeRecord>, ItemError> {
        let Some(line) = self.lines.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 3 {
            return Err(ItemError::format(format!("expected 3 fields: '{}'", line)));
        }
        let quantity: i64 = fields[1]
            .parse()
            .map_err(|_| ItemError::format(format!("bad quantity in '{}'", line)))?;

        Ok(Some(TradeRecord {
            isin: fields[0].to_string(),
            quantity,
            customer: fields[2].to_string(),
        }))
    }
}

/// Inserts trades into the `trades` table; the whole call is one
/// transaction, so a failed call leaves nothing visible
struct TradeTableWriter {
    pool: SqlitePool,
}

#[async_trait]
impl ItemWriter<TradeRecord> for TradeTableWriter {
    async fn write(&mut self, items: &[TradeRecord]) -> std::result::Result<(), WriteError> {
        let io_err = |e: sqlx::Error| WriteError::Chunk(ItemError::io(e.to_string()));

        let mut tx = self.pool.begin().await.map_err(io_err)?;
        for item in items {
            sqlx::query("INSERT INTO trades (isin, quantity, customer) VALUES (?1, ?2, ?3)")
                .bind(&item.isin)
                .bind(item.quantity)
                .bind(&item.customer)
                .execute(&mut *tx)
                .await
                .map_err(io_err)?;
        }
        tx.commit().await.map_err(io_err)?;
        Ok(())
    }
}

/// Reads back the `trades` table in insertion order
struct TradeTableReader {
    pool: SqlitePool,
    rows: Vec<TradeRecord>,
    position: usize,
}

#[async_trait]
impl ItemReader<TradeRecord> for TradeTableReader {
    async fn open(&mut self, position: u64) -> std::result::Result<(), ItemError> {
        let rows: Vec<(String, i64, String)> =
            sqlx::query_as("SELECT isin, quantity, customer FROM trades ORDER BY rowid")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ItemError::io(e.to_string()))?;

        self.rows = rows
            .into_iter()
            .map(|(isin, quantity, customer)| TradeRecord {
                isin,
                quantity,
                customer,
            })
            .collect();
        self.position = position as usize;
        Ok(())
    }

    async fn read(&mut self) -> std::result::Result<Option<TradeRecord>, ItemError> {
        let record = self.rows.get(self.position).cloned();
        if record.is_some() {
            self.position += 1;
        }
        Ok(record)
    }
}

/// Tracking writer with a configurable failing record, reporting the fault
/// with item-level isolation
#[derive(Clone)]
struct TrackingWriter {
    items: Arc<Mutex<Vec<TradeRecord>>>,
    fail_isin: Arc<Mutex<Option<String>>>,
}

impl TrackingWriter {
    fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
            fail_isin: Arc::new(Mutex::new(None)),
        }
    }

    fn set_fail_isin(&self, isin: Option<&str>) {
        *self.fail_isin.lock().unwrap() = isin.map(str::to_string);
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn clear(&self) {
        self.items.lock().unwrap().clear();
    }
}

#[async_trait]
impl ItemWriter<TradeRecord> for TrackingWriter {
    async fn write(&mut self, items: &[TradeRecord]) -> std::result::Result<(), WriteError> {
        let fail_isin = self.fail_isin.lock().unwrap().clone();
        if let Some(bad) = fail_isin {
            if let Some(index) = items.iter().position(|i| i.isin == bad) {
                return Err(WriteError::Item {
                    index,
                    error: ItemError::validation(format!("rejected trade {}", bad)),
                });
            }
        }
        self.items.lock().unwrap().extend_from_slice(items);
        Ok(())
    }
}

/// Logs one error row per skip of the step that routed here, tagged with
/// the active step name published in the execution context
struct ErrorLogStep {
    name: String,
}

#[async_trait]
impl Step for ErrorLogStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<ExitStatus> {
        let source_step = context_repository::get(ctx.pool, ctx.execution.id, ACTIVE_STEP_KEY)
            .await?
            .as_ref()
            .and_then(ContextValue::as_str)
            .map(str::to_string)
            .unwrap_or_default();

        let skips = step_repository::find_by_execution_and_name(ctx.pool, ctx.execution.id, &source_step)
            .await?
            .map(|step| step.skip_count)
            .unwrap_or(0);

        for _ in 0..skips {
            sqlx::query("INSERT INTO error_log (job_name, step_name) VALUES (?1, ?2)")
                .bind(&ctx.instance.job_name)
                .bind(&source_step)
                .execute(ctx.pool)
                .await?;
        }

        Ok(ExitStatus::Completed)
    }
}

async fn create_sample_tables(pool: &SqlitePool) {
    sqlx::query("CREATE TABLE trades (isin TEXT NOT NULL, quantity INTEGER NOT NULL, customer TEXT NOT NULL)")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE error_log (job_name TEXT NOT NULL, step_name TEXT NOT NULL)")
        .execute(pool)
        .await
        .unwrap();
}

fn write_input(path: &PathBuf, with_invalid_record: bool) {
    let mut file = std::fs::File::create(path).unwrap();
    writeln!(file, "UK21341EAH41,211,customer1").unwrap();
    writeln!(file, "UK21341EAH43,425,customer2").unwrap();
    if with_invalid_record {
        writeln!(file, "UK21341EAH45,not-a-number,customer3").unwrap();
    } else {
        writeln!(file, "UK21341EAH45,642,customer3").unwrap();
    }
    writeln!(file, "UK21341EAH47,978,customer4").unwrap();
    writeln!(file, "UK21341EAH49,130,customer5").unwrap();
}

fn build_skip_job(pool: SqlitePool, input: PathBuf, tracking: TrackingWriter) -> JobDefinition {
    let step1_pool = pool.clone();
    let step1 = ChunkStep::builder("step1")
        .chunk_size(3)
        .skip_policy(LimitCheckingSkipPolicy::new(1).skipping(ErrorClass::Format))
        .reader(move || FlatFileTradeReader::new(input.clone()))
        .processor(|| PassthroughProcessor)
        .writer(move || TradeTableWriter {
            pool: step1_pool.clone(),
        })
        .build()
        .unwrap();

    let step2_pool = pool;
    let step2 = ChunkStep::builder("step2")
        .chunk_size(3)
        .skip_policy(LimitCheckingSkipPolicy::new(1).skipping(ErrorClass::Validation))
        .reader(move || TradeTableReader {
            pool: step2_pool.clone(),
            rows: Vec::new(),
            position: 0,
        })
        .processor(|| PassthroughProcessor)
        .writer(move || tracking.clone())
        .build()
        .unwrap();

    let flow = Flow::builder()
        .step(step1)
        .step(ErrorLogStep {
            name: "errorPrint1".to_string(),
        })
        .step(step2)
        .step(ErrorLogStep {
            name: "errorPrint2".to_string(),
        })
        .on(
            "step1",
            ExitStatus::CompletedWithSkips,
            Target::Step("errorPrint1".to_string()),
        )
        .on(
            "step1",
            ExitStatus::Completed,
            Target::Step("step2".to_string()),
        )
        .on_any("errorPrint1", Target::Step("step2".to_string()))
        .on(
            "step2",
            ExitStatus::CompletedWithSkips,
            Target::Step("errorPrint2".to_string()),
        )
        .on("step2", ExitStatus::Completed, Target::End)
        .on_any("errorPrint2", Target::End)
        .build()
        .unwrap();

    JobDefinition::new("skip_job", flow).with_incrementer(RunIdIncrementer::new())
}

async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

async fn error_rows_for_step(pool: &SqlitePool, step_name: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM error_log WHERE job_name = ?1 AND step_name = ?2")
        .bind("skip_job")
        .bind(step_name)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_job_incrementing_with_and_without_skips() {
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    create_sample_tables(&pool).await;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("trades.csv");

    let tracking = TrackingWriter::new();
    let registry = JobRegistry::new().register(build_skip_job(
        pool.clone(),
        input.clone(),
        tracking.clone(),
    ));
    let operator = JobOperator::new(pool.clone(), registry);

    //
    // Launch 1: one bad record per step
    //
    write_input(&input, true);
    tracking.set_fail_isin(Some("UK21341EAH47"));

    let id1 = operator.start_next_instance("skip_job").await.unwrap();
    let execution1 = execution_repository::find_by_id(&pool, id1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution1.status, BatchStatus::Completed);

    // Step1: 5 input records, 1 skipped => 4 written to the trades table
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM trades").await, 4);

    // Step2: 4 input records, 1 skipped => 3 retained by the tracking writer
    assert_eq!(tracking.len(), 3);

    // Both steps contained skips
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM error_log").await, 2);
    assert_eq!(error_rows_for_step(&pool, "step1").await, 1);
    assert_eq!(error_rows_for_step(&pool, "step2").await, 1);

    //
    // Clear the data
    //
    sqlx::query("DELETE FROM trades").execute(&pool).await.unwrap();
    sqlx::query("DELETE FROM error_log").execute(&pool).await.unwrap();
    tracking.clear();

    //
    // Launch 2: clean input, no skips
    //
    write_input(&input, false);
    tracking.set_fail_isin(None);

    let id2 = operator.start_next_instance("skip_job").await.unwrap();
    let execution2 = execution_repository::find_by_id(&pool, id2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution2.status, BatchStatus::Completed);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM trades").await, 5);
    assert_eq!(tracking.len(), 5);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM error_log").await, 0);

    // The launches were separate executions of separate instances
    assert_ne!(id1, id2);
    assert_ne!(execution1.instance_id, execution2.instance_id);
}

#[tokio::test]
async fn test_skip_counters_recorded_per_step() {
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    create_sample_tables(&pool).await;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("trades.csv");
    write_input(&input, true);

    let tracking = TrackingWriter::new();
    tracking.set_fail_isin(Some("UK21341EAH47"));

    let registry = JobRegistry::new().register(build_skip_job(
        pool.clone(),
        input.clone(),
        tracking.clone(),
    ));
    let operator = JobOperator::new(pool.clone(), registry);

    let id = operator.start_next_instance("skip_job").await.unwrap();

    let step1 = step_repository::find_by_execution_and_name(&pool, id, "step1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step1.status, BatchStatus::Completed);
    assert_eq!(step1.exit_status, Some(ExitStatus::CompletedWithSkips));
    assert_eq!(step1.read_count, 4);
    assert_eq!(step1.write_count, 4);
    assert_eq!(step1.skip_count, 1);
    assert_eq!(step1.commit_count, 2);

    let step2 = step_repository::find_by_execution_and_name(&pool, id, "step2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step2.read_count, 4);
    assert_eq!(step2.write_count, 3);
    assert_eq!(step2.skip_count, 1);
    assert_eq!(step2.exit_status, Some(ExitStatus::CompletedWithSkips));
}
