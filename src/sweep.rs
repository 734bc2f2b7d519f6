// Experiment runner: the full {domain x stage1 x stage2} cross-product.
//
// One orchestrator run per combination, one `RunRecord` appended per run.
// The run log is CSV, written incrementally and flushed per row under a
// lock, so a crash mid-sweep keeps every completed record and concurrent
// workers never interleave partial rows. A failed combination is recorded
// and the sweep moves on; only `require_success` turns failures into a
// failing sweep, and only configuration errors (no resolvable stage-2
// adapter at all) abort it.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::adapter::external::PipeSpec;
use crate::adapter::{
    AdapterConfig, CompressionResult, Compressor, Limits, RunStatus, create_adapter,
};
use crate::pipeline;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Immutable sweep configuration; passed in explicitly, never ambient.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Data domains (e.g. "gps", "sensors", "logistics").
    pub domains: Vec<String>,
    /// First-stage (node-side) algorithm labels; select message directories.
    pub stage1_algos: Vec<String>,
    /// Second-stage adapter names (built-in or external).
    pub stage2_algos: Vec<String>,
    /// Root of the collected message tree: `<data_dir>/<domain>/<stage1>/`.
    pub data_dir: PathBuf,
    /// Execution bounds applied to every adapter invocation.
    pub limits: Limits,
    /// Run the decompress-decode-compare validation stage.
    pub validate: bool,
    /// Treat any failed combination as a failed sweep.
    pub require_success: bool,
    /// Concurrent combinations; 1 = sequential (the default — heavyweight
    /// compressors usually saturate the machine alone).
    pub workers: usize,
    /// Per-adapter tuning options, keyed by stage-2 name.
    pub adapter_options: BTreeMap<String, AdapterConfig>,
    /// External command specs, keyed by stage-2 name.
    pub externals: BTreeMap<String, PipeSpec>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            stage1_algos: Vec::new(),
            stage2_algos: Vec::new(),
            data_dir: PathBuf::from("."),
            limits: Limits::NONE,
            validate: true,
            require_success: false,
            workers: 1,
            adapter_options: BTreeMap::new(),
            externals: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal sweep errors. Per-combination failures are *not* errors here —
/// they land in the run log as failed records.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("sweep configuration: {0}")]
    Config(String),

    #[error("run log: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// RunRecord
// ---------------------------------------------------------------------------

/// One row of the run log. Append-only; never mutated after creation.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub domain: String,
    pub stage1: String,
    pub stage2: String,
    pub result: CompressionResult,
    /// Unix epoch milliseconds at record creation.
    pub timestamp_ms: u64,
}

impl RunRecord {
    fn new(domain: &str, stage1: &str, stage2: &str, result: CompressionResult) -> Self {
        Self {
            domain: domain.to_string(),
            stage1: stage1.to_string(),
            stage2: stage2.to_string(),
            result,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// RunLog — durable CSV, atomic row appends
// ---------------------------------------------------------------------------

pub const RUN_LOG_HEADER: &str = "domain,stage1_algo,stage2_algo,input_size,output_size,ratio,elapsed_ms,cpu_pct,peak_mem_bytes,status,error_detail,timestamp";

/// Append-only CSV log. Each `append` writes and flushes one full row under
/// the lock, so concurrent workers cannot interleave partial records.
pub struct RunLog {
    file: Mutex<File>,
}

impl RunLog {
    /// Create (truncate) the log file and write the header row.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = File::create(path)?;
        writeln!(file, "{RUN_LOG_HEADER}")?;
        file.flush()?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, record: &RunRecord) -> std::io::Result<()> {
        let row = format_row(record);
        let mut file = self.file.lock().expect("run log lock poisoned");
        writeln!(file, "{row}")?;
        file.flush()
    }
}

fn format_row(record: &RunRecord) -> String {
    let r = &record.result;
    let output_size = r
        .output_size
        .map(|n| n.to_string())
        .unwrap_or_default();
    let ratio = r
        .ratio()
        .map(|x| format!("{x:.6}"))
        .unwrap_or_default();
    format!(
        "{},{},{},{},{},{},{},{:.1},{},{},{},{}",
        csv_field(&record.domain),
        csv_field(&record.stage1),
        csv_field(&record.stage2),
        r.input_size,
        output_size,
        ratio,
        r.elapsed.as_millis(),
        r.cpu_pct,
        r.peak_mem,
        r.status,
        csv_field(r.error_detail.as_deref().unwrap_or("")),
        record.timestamp_ms,
    )
}

/// Quote a CSV field if it contains a delimiter, quote, or newline.
fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SweepSummary {
    /// All records, in completion order.
    pub records: Vec<RunRecord>,
    pub failed: usize,
    pub require_success: bool,
}

impl SweepSummary {
    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn succeeded(&self) -> usize {
        self.records.len() - self.failed
    }

    /// Whether the sweep as a whole failed (partial failures only count
    /// when `require_success` was configured).
    pub fn sweep_failed(&self) -> bool {
        self.require_success && self.failed > 0
    }
}

// ---------------------------------------------------------------------------
// run_sweep
// ---------------------------------------------------------------------------

type Combination = (String, String, String);

/// Run the full cross-product and append one record per combination to
/// `log`. Adapter resolution happens up front: a sweep where *no* stage-2
/// algorithm resolves is a configuration error; individually unresolvable
/// algorithms produce `unavailable` records for their combinations.
pub fn run_sweep(config: &SweepConfig, log: &RunLog) -> Result<SweepSummary, SweepError> {
    let combinations = cross_product(config)?;

    let mut adapters: BTreeMap<String, Result<Box<dyn Compressor>, String>> = BTreeMap::new();
    for stage2 in &config.stage2_algos {
        let options = config
            .adapter_options
            .get(stage2)
            .cloned()
            .unwrap_or_default();
        let resolved = create_adapter(stage2, &options, &config.externals)
            .map_err(|e| e.to_string());
        adapters.insert(stage2.clone(), resolved);
    }
    if adapters.values().all(|r| r.is_err()) {
        return Err(SweepError::Config(format!(
            "none of the configured stage-2 algorithms resolved: {}",
            config.stage2_algos.join(", ")
        )));
    }

    log::info!(
        "sweep: {} combinations ({} domains x {} stage1 x {} stage2), workers={}",
        combinations.len(),
        config.domains.len(),
        config.stage1_algos.len(),
        config.stage2_algos.len(),
        config.workers.max(1),
    );

    let records = Mutex::new(Vec::with_capacity(combinations.len()));
    let run_one = |combo: &Combination| -> Result<(), SweepError> {
        let record = run_combination_record(config, &adapters, combo);
        log::info!(
            "{}/{}/{}: {}{}",
            record.domain,
            record.stage1,
            record.stage2,
            record.result.status,
            record
                .result
                .ratio()
                .map(|r| format!(" (ratio {r:.4})"))
                .unwrap_or_default(),
        );
        log.append(&record)?;
        records.lock().expect("records lock poisoned").push(record);
        Ok(())
    };

    run_all(config, &combinations, run_one)?;

    let records = records.into_inner().expect("records lock poisoned");
    let failed = records.iter().filter(|r| !r.result.status.is_ok()).count();
    Ok(SweepSummary {
        records,
        failed,
        require_success: config.require_success,
    })
}

fn cross_product(config: &SweepConfig) -> Result<Vec<Combination>, SweepError> {
    if config.domains.is_empty() || config.stage1_algos.is_empty() || config.stage2_algos.is_empty()
    {
        return Err(SweepError::Config(
            "domains, stage1, and stage2 must each name at least one entry".to_string(),
        ));
    }
    let mut combos = Vec::new();
    for domain in &config.domains {
        for stage1 in &config.stage1_algos {
            for stage2 in &config.stage2_algos {
                combos.push((domain.clone(), stage1.clone(), stage2.clone()));
            }
        }
    }
    Ok(combos)
}

fn run_combination_record(
    config: &SweepConfig,
    adapters: &BTreeMap<String, Result<Box<dyn Compressor>, String>>,
    (domain, stage1, stage2): &Combination,
) -> RunRecord {
    let adapter = match adapters.get(stage2) {
        Some(Ok(adapter)) => adapter.as_ref(),
        Some(Err(reason)) => {
            let result = CompressionResult {
                algorithm: stage2.clone(),
                input_size: 0,
                output_size: None,
                elapsed: Duration::ZERO,
                cpu_pct: 0.0,
                peak_mem: 0,
                status: RunStatus::Unavailable,
                error_detail: Some(reason.clone()),
            };
            return RunRecord::new(domain, stage1, stage2, result);
        }
        None => unreachable!("adapters map is built from stage2_algos"),
    };

    let messages = match pipeline::collect_messages(&config.data_dir, domain, stage1) {
        Ok(messages) => messages,
        Err(err) => {
            let result = CompressionResult {
                algorithm: stage2.clone(),
                input_size: 0,
                output_size: None,
                elapsed: Duration::ZERO,
                cpu_pct: 0.0,
                peak_mem: 0,
                status: RunStatus::Error,
                error_detail: Some(err.to_string()),
            };
            return RunRecord::new(domain, stage1, stage2, result);
        }
    };

    let outcome = pipeline::run_combination(&messages, adapter, &config.limits, config.validate);
    debug_assert!(outcome.state.is_terminal());
    RunRecord::new(domain, stage1, stage2, outcome.result)
}

#[cfg(not(feature = "parallel"))]
fn run_all(
    config: &SweepConfig,
    combinations: &[Combination],
    run_one: impl Fn(&Combination) -> Result<(), SweepError> + Sync,
) -> Result<(), SweepError> {
    if config.workers > 1 {
        log::warn!(
            "workers={} requested but the 'parallel' feature is disabled; running sequentially",
            config.workers
        );
    }
    for combo in combinations {
        run_one(combo)?;
    }
    Ok(())
}

#[cfg(feature = "parallel")]
fn run_all(
    config: &SweepConfig,
    combinations: &[Combination],
    run_one: impl Fn(&Combination) -> Result<(), SweepError> + Sync,
) -> Result<(), SweepError> {
    use rayon::prelude::*;

    let workers = config.workers.max(1);
    if workers == 1 {
        for combo in combinations {
            run_one(combo)?;
        }
        return Ok(());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("pb-sweep-{i}"))
        .build()
        .map_err(|e| SweepError::Config(format!("worker pool: {e}")))?;

    pool.install(|| {
        combinations
            .par_iter()
            .map(|combo| run_one(combo))
            .collect::<Result<(), SweepError>>()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
