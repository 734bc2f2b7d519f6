// Second-stage compressor adapters.
//
// Every candidate re-compressor — in-process codec or external heavyweight
// binary — sits behind the `Compressor` trait. The adapter owns its tuning
// options (validated at construction), performs one measured invocation per
// call, and reports a `ResourceSample` specific to that invocation.
//
// `run_adapter` is the single entry point the orchestrator uses: it runs
// compress, applies the mandatory round-trip self-check, and folds any
// failure into an immutable `CompressionResult` instead of propagating it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::metrics::{DEFAULT_SAMPLE_INTERVAL, ResourceSample, measure_inline};

pub mod builtin;
pub mod external;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Caller-supplied execution bounds for one adapter invocation.
///
/// Heavyweight compressors can run arbitrarily long and eat arbitrary RAM,
/// so sweeps should always set both bounds for external adapters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    /// Wall-clock deadline. Breach kills an external child process.
    pub time_limit: Option<Duration>,
    /// Peak-RSS ceiling in bytes. Breach kills an external child process.
    pub memory_ceiling: Option<u64>,
}

impl Limits {
    pub const NONE: Limits = Limits {
        time_limit: None,
        memory_ceiling: None,
    };
}

// ---------------------------------------------------------------------------
// AdapterConfig
// ---------------------------------------------------------------------------

/// Named tuning options for one adapter (e.g. `level` for zlib, a block
/// size for an external bsc binary). Option sets are declared per adapter:
/// each constructor validates what it understands and rejects the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterConfig {
    options: BTreeMap<String, String>,
}

impl AdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Parse an option value, distinguishing "absent" from "unparseable".
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, AdapterError>
    where
        T::Err: fmt::Display,
    {
        match self.options.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| AdapterError::Config {
                option: key.to_string(),
                reason: format!("cannot parse '{raw}': {e}"),
            }),
        }
    }

    /// Reject options outside the adapter's declared set.
    pub fn ensure_known(&self, known: &[&str]) -> Result<(), AdapterError> {
        for key in self.options.keys() {
            if !known.contains(&key.as_str()) {
                return Err(AdapterError::Config {
                    option: key.clone(),
                    reason: format!("unknown option (supported: {})", known.join(", ")),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure modes of one adapter invocation.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// External tool or library missing / not executable.
    #[error("compressor '{name}' unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    /// Execution exceeded the caller-supplied deadline.
    #[error("time limit {limit_ms}ms exceeded (ran {elapsed_ms}ms)")]
    Timeout { limit_ms: u64, elapsed_ms: u64 },

    /// Peak RSS exceeded the caller-supplied ceiling.
    #[error("memory ceiling {ceiling} bytes exceeded (peak {peak} bytes)")]
    ResourceExhausted { ceiling: u64, peak: u64 },

    /// Round-trip self-check produced different bytes than the input.
    #[error("self-check failed: {detail}")]
    Corruption { detail: String },

    /// External process exited non-zero or wrote to stderr.
    #[error("compressor '{name}' failed: {detail}")]
    ProcessFailed { name: String, detail: String },

    /// Bad adapter option.
    #[error("adapter option '{option}': {reason}")]
    Config { option: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Compressor trait
// ---------------------------------------------------------------------------

/// One compressed invocation: output bytes plus the resource readings taken
/// while it ran.
#[derive(Debug)]
pub struct CompressOutcome {
    pub output: Vec<u8>,
    pub sample: ResourceSample,
}

/// Uniform contract over every second-stage algorithm.
///
/// Adapters must accept empty input and must not assume a minimum size; a
/// model-heavy algorithm legitimately *expands* tiny inputs, and that gets
/// measured rather than hidden.
pub trait Compressor: Send + Sync {
    /// Stable algorithm identifier used in run logs.
    fn name(&self) -> &str;

    /// Compress `input` within `limits`, measuring the invocation.
    fn compress(&self, input: &[u8], limits: &Limits) -> Result<CompressOutcome, AdapterError>;

    /// Invert `compress`. Used by the self-check and by restore flows.
    fn decompress(&self, input: &[u8], limits: &Limits) -> Result<Vec<u8>, AdapterError>;
}

// ---------------------------------------------------------------------------
// In-process measurement helper
// ---------------------------------------------------------------------------

/// Wrap an in-process codec call in a self-process monitor.
///
/// A closure cannot be killed mid-flight, so the time limit is checked after
/// the fact: a breach still fails the invocation as `Timeout`, it just
/// cannot shorten it. Memory ceilings are not enforced here — the sampled
/// RSS is the whole process, not the codec allocation alone.
pub fn measured_in_process(
    limits: &Limits,
    f: impl FnOnce() -> Result<Vec<u8>, AdapterError>,
) -> Result<CompressOutcome, AdapterError> {
    let (result, sample) = measure_inline(DEFAULT_SAMPLE_INTERVAL, f);
    let output = result?;

    if let Some(limit) = limits.time_limit
        && sample.elapsed > limit
    {
        return Err(AdapterError::Timeout {
            limit_ms: limit.as_millis() as u64,
            elapsed_ms: sample.elapsed.as_millis() as u64,
        });
    }

    Ok(CompressOutcome { output, sample })
}

// ---------------------------------------------------------------------------
// CompressionResult
// ---------------------------------------------------------------------------

/// Terminal status of one measured invocation, as written to the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Unavailable,
    Timeout,
    ResourceExhausted,
    Corruption,
    Integrity,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Unavailable => "unavailable",
            RunStatus::Timeout => "timeout",
            RunStatus::ResourceExhausted => "resource-exhausted",
            RunStatus::Corruption => "corruption",
            RunStatus::Integrity => "integrity",
            RunStatus::Error => "error",
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, RunStatus::Ok)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&AdapterError> for RunStatus {
    fn from(err: &AdapterError) -> Self {
        match err {
            AdapterError::Unavailable { .. } => RunStatus::Unavailable,
            AdapterError::Timeout { .. } => RunStatus::Timeout,
            AdapterError::ResourceExhausted { .. } => RunStatus::ResourceExhausted,
            AdapterError::Corruption { .. } => RunStatus::Corruption,
            AdapterError::ProcessFailed { .. }
            | AdapterError::Config { .. }
            | AdapterError::Io(_) => RunStatus::Error,
        }
    }
}

/// Immutable record of one adapter invocation. Appended to the run log and
/// never mutated afterwards; `output_size`, `ratio`, and `elapsed` are only
/// meaningful when `status.is_ok()`.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub algorithm: String,
    pub input_size: u64,
    pub output_size: Option<u64>,
    pub elapsed: Duration,
    pub cpu_pct: f32,
    pub peak_mem: u64,
    pub status: RunStatus,
    pub error_detail: Option<String>,
}

impl CompressionResult {
    /// Output bytes per input byte; < 1.0 means the re-compression gained.
    pub fn ratio(&self) -> Option<f64> {
        match (self.status.is_ok(), self.output_size, self.input_size) {
            (true, Some(out), inp) if inp > 0 => Some(out as f64 / inp as f64),
            _ => None,
        }
    }

    pub fn failed(algorithm: &str, input_size: u64, err: &AdapterError) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            input_size,
            output_size: None,
            elapsed: Duration::ZERO,
            cpu_pct: 0.0,
            peak_mem: 0,
            status: RunStatus::from(err),
            error_detail: Some(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// run_adapter — one measured, self-checked invocation
// ---------------------------------------------------------------------------

/// Drive one invocation end to end and fold the outcome into a
/// `CompressionResult`. On success the compressed bytes are also returned so
/// the orchestrator can validate the full container round-trip.
///
/// With `self_check` set, the output is immediately decompressed and
/// byte-compared against `input`; a mismatch reports `Corruption`, never a
/// silent pass.
pub fn run_adapter(
    adapter: &dyn Compressor,
    input: &[u8],
    limits: &Limits,
    self_check: bool,
) -> (CompressionResult, Option<Vec<u8>>) {
    let input_size = input.len() as u64;

    let outcome = match adapter.compress(input, limits) {
        Ok(outcome) => outcome,
        Err(err) => {
            log::warn!("adapter '{}' failed: {err}", adapter.name());
            return (CompressionResult::failed(adapter.name(), input_size, &err), None);
        }
    };

    if self_check {
        let restored = match adapter.decompress(&outcome.output, limits) {
            Ok(bytes) => bytes,
            Err(err) => {
                let err = AdapterError::Corruption {
                    detail: format!("decompress during self-check failed: {err}"),
                };
                return (CompressionResult::failed(adapter.name(), input_size, &err), None);
            }
        };
        if restored != input {
            let err = AdapterError::Corruption {
                detail: format!(
                    "round-trip produced {} bytes, expected {}{}",
                    restored.len(),
                    input.len(),
                    if restored.len() == input.len() {
                        " (same length, different content)"
                    } else {
                        ""
                    }
                ),
            };
            return (CompressionResult::failed(adapter.name(), input_size, &err), None);
        }
    }

    log::debug!(
        "adapter '{}': {} -> {} bytes in {:?}",
        adapter.name(),
        input_size,
        outcome.output.len(),
        outcome.sample.elapsed
    );

    let result = CompressionResult {
        algorithm: adapter.name().to_string(),
        input_size,
        output_size: Some(outcome.output.len() as u64),
        elapsed: outcome.sample.elapsed,
        cpu_pct: outcome.sample.cpu_pct,
        peak_mem: outcome.sample.peak_mem,
        status: RunStatus::Ok,
        error_detail: None,
    };
    (result, Some(outcome.output))
}

// ---------------------------------------------------------------------------
// Adapter registry
// ---------------------------------------------------------------------------

/// Construct an adapter by algorithm name.
///
/// Built-in names resolve to in-process codecs; anything else is looked up
/// in `externals` (command specs for heavyweight binaries).
pub fn create_adapter(
    name: &str,
    config: &AdapterConfig,
    externals: &BTreeMap<String, external::PipeSpec>,
) -> Result<Box<dyn Compressor>, AdapterError> {
    match name {
        "store" => Ok(Box::new(builtin::StoreCompressor::new(config)?)),

        #[cfg(feature = "zlib-stage2")]
        "zlib" => Ok(Box::new(builtin::ZlibCompressor::new(config)?)),

        #[cfg(feature = "lzma-stage2")]
        "lzma" => Ok(Box::new(builtin::LzmaCompressor::new(config)?)),

        other => match externals.get(other) {
            Some(spec) => Ok(Box::new(external::PipeCompressor::new(spec.clone())?)),
            None => Err(AdapterError::Unavailable {
                name: other.to_string(),
                reason: "not a built-in codec and no external command configured".to_string(),
            }),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
