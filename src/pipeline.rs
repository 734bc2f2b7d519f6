// Per-combination orchestration.
//
// One run walks a fixed state machine:
//
//   Collecting -> Packing -> Recompressing -> Validating -> Done
//
// with Failed terminal from any non-terminal state. Every failure — codec,
// adapter, or integrity — is folded into the run's `CompressionResult`
// instead of propagating, so a sweep can record it and move on. Transitions
// are deterministic for identical inputs; only the timing and resource
// readings vary run to run.

use std::path::Path;

use thiserror::Error;

use crate::adapter::{
    AdapterError, CompressionResult, Compressor, Limits, RunStatus, run_adapter,
};
use crate::container::{self, Message};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Collecting,
    Packing,
    Recompressing,
    Validating,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures local to one combination. Callers receive these inside a
/// `RunOutcome`, already attached to a failed `CompressionResult`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("collecting messages: {0}")]
    Collect(#[from] std::io::Error),

    #[error(transparent)]
    Encoding(#[from] container::EncodingError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("validation: recompressed container does not decode to the original messages: {detail}")]
    Integrity { detail: String },
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal result of one orchestrated run.
#[derive(Debug)]
pub struct RunOutcome {
    /// `Done` or `Failed`.
    pub state: RunState,
    /// The measured (or failure-describing) invocation record.
    pub result: CompressionResult,
    /// Every state entered, in order, ending in the terminal state.
    pub trace: Vec<RunState>,
}

impl RunOutcome {
    fn failed(trace: Vec<RunState>, result: CompressionResult) -> Self {
        debug_assert_eq!(trace.last(), Some(&RunState::Failed));
        Self {
            state: RunState::Failed,
            result,
            trace,
        }
    }
}

// ---------------------------------------------------------------------------
// Collecting
// ---------------------------------------------------------------------------

/// Gather the pre-compressed message files for one (domain, stage1) pair.
///
/// Layout: `<data_dir>/<domain>/<stage1>/`, one file per message, ordered by
/// file name so runs are reproducible. An empty (or missing) directory is a
/// valid edge case — it packs into a zero-count container, not an error.
pub fn collect_messages(
    data_dir: &Path,
    domain: &str,
    stage1: &str,
) -> Result<Vec<Message>, PipelineError> {
    let dir = data_dir.join(domain).join(stage1);
    if !dir.is_dir() {
        log::debug!("no message directory at {}, collecting empty set", dir.display());
        return Ok(Vec::new());
    }

    let mut paths: Vec<_> = std::fs::read_dir(&dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut messages = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data = std::fs::read(&path)?;
        let message = Message::new(name, data).map_err(PipelineError::Encoding)?;
        messages.push(message);
    }

    log::debug!(
        "collected {} messages for {domain}/{stage1}",
        messages.len()
    );
    Ok(messages)
}

// ---------------------------------------------------------------------------
// run_combination
// ---------------------------------------------------------------------------

/// Pack `messages`, re-compress the container with `adapter`, and (when
/// `validate` is set) prove the round-trip by decompressing, decoding, and
/// comparing against the original message set.
///
/// With validation enabled, the adapter's own raw self-check is subsumed by
/// the container-level check and skipped so the decompression runs once: a
/// byte mismatch against the container reports `Corruption`, a container
/// that matches bytewise but fails decode/compare reports `Integrity`.
pub fn run_combination(
    messages: &[Message],
    adapter: &dyn Compressor,
    limits: &Limits,
    validate: bool,
) -> RunOutcome {
    let mut trace = vec![RunState::Collecting, RunState::Packing];

    let container_bytes = match container::encode(messages) {
        Ok(bytes) => bytes,
        Err(err) => {
            trace.push(RunState::Failed);
            let result = CompressionResult {
                algorithm: adapter.name().to_string(),
                input_size: 0,
                output_size: None,
                elapsed: std::time::Duration::ZERO,
                cpu_pct: 0.0,
                peak_mem: 0,
                status: RunStatus::Error,
                error_detail: Some(PipelineError::from(err).to_string()),
            };
            return RunOutcome::failed(trace, result);
        }
    };

    trace.push(RunState::Recompressing);
    let (mut result, compressed) = run_adapter(adapter, &container_bytes, limits, !validate);
    let Some(compressed) = compressed else {
        trace.push(RunState::Failed);
        return RunOutcome::failed(trace, result);
    };

    if validate {
        trace.push(RunState::Validating);
        if let Err(err) = validate_roundtrip(adapter, limits, &container_bytes, &compressed, messages)
        {
            trace.push(RunState::Failed);
            result.status = match &err {
                PipelineError::Adapter(adapter_err) => RunStatus::from(adapter_err),
                PipelineError::Integrity { .. } => RunStatus::Integrity,
                _ => RunStatus::Error,
            };
            result.output_size = None;
            result.error_detail = Some(err.to_string());
            return RunOutcome::failed(trace, result);
        }
    }

    trace.push(RunState::Done);
    RunOutcome {
        state: RunState::Done,
        result,
        trace,
    }
}

fn validate_roundtrip(
    adapter: &dyn Compressor,
    limits: &Limits,
    container_bytes: &[u8],
    compressed: &[u8],
    original: &[Message],
) -> Result<(), PipelineError> {
    let restored = adapter.decompress(compressed, limits)?;

    if restored != container_bytes {
        return Err(AdapterError::Corruption {
            detail: format!(
                "decompressed container is {} bytes, packed container was {}",
                restored.len(),
                container_bytes.len()
            ),
        }
        .into());
    }

    let decoded = container::decode(&restored).map_err(|e| PipelineError::Integrity {
        detail: e.to_string(),
    })?;
    if decoded != original {
        return Err(PipelineError::Integrity {
            detail: format!(
                "decoded {} messages, expected {}",
                decoded.len(),
                original.len()
            ),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::builtin::StoreCompressor;
    use crate::adapter::{AdapterConfig, CompressOutcome, measured_in_process};

    fn msg(name: &str, data: &[u8]) -> Message {
        Message::new(name, data.to_vec()).unwrap()
    }

    fn store() -> StoreCompressor {
        StoreCompressor::new(&AdapterConfig::new()).unwrap()
    }

    #[test]
    fn happy_path_walks_all_states() {
        let messages = vec![msg("a.bin", b"alpha"), msg("b.bin", b"beta")];
        let outcome = run_combination(&messages, &store(), &Limits::NONE, true);
        assert_eq!(outcome.state, RunState::Done);
        assert!(outcome.result.status.is_ok());
        assert_eq!(
            outcome.trace,
            vec![
                RunState::Collecting,
                RunState::Packing,
                RunState::Recompressing,
                RunState::Validating,
                RunState::Done,
            ]
        );
    }

    #[test]
    fn empty_message_set_still_succeeds() {
        let outcome = run_combination(&[], &store(), &Limits::NONE, true);
        assert_eq!(outcome.state, RunState::Done);
        // Zero-count container is the 4-byte header.
        assert_eq!(outcome.result.input_size, 4);
    }

    #[test]
    fn corrupting_adapter_fails_validation_as_corruption() {
        struct Corrupting;
        impl Compressor for Corrupting {
            fn name(&self) -> &str {
                "corrupting"
            }
            fn compress(
                &self,
                input: &[u8],
                limits: &Limits,
            ) -> Result<CompressOutcome, AdapterError> {
                measured_in_process(limits, || Ok(input.to_vec()))
            }
            fn decompress(&self, input: &[u8], _limits: &Limits) -> Result<Vec<u8>, AdapterError> {
                let mut out = input.to_vec();
                out[0] ^= 0xFF;
                Ok(out)
            }
        }

        let messages = vec![msg("a.bin", b"payload")];
        let outcome = run_combination(&messages, &Corrupting, &Limits::NONE, true);
        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.result.status, RunStatus::Corruption);
        assert_eq!(outcome.trace.last(), Some(&RunState::Failed));
    }

    #[test]
    fn shuffling_adapter_fails_as_integrity() {
        // Decompression yields a *valid but different* container.
        struct Shuffling;
        impl Compressor for Shuffling {
            fn name(&self) -> &str {
                "shuffling"
            }
            fn compress(
                &self,
                input: &[u8],
                limits: &Limits,
            ) -> Result<CompressOutcome, AdapterError> {
                measured_in_process(limits, || Ok(input.to_vec()))
            }
            fn decompress(&self, _input: &[u8], _limits: &Limits) -> Result<Vec<u8>, AdapterError> {
                let other = vec![Message::new("other.bin", b"different".to_vec()).unwrap()];
                Ok(container::encode(&other).unwrap())
            }
        }

        let messages = vec![msg("a.bin", b"payload")];
        let outcome = run_combination(&messages, &Shuffling, &Limits::NONE, true);
        assert_eq!(outcome.state, RunState::Failed);
        // Bytes differ before decode, so this surfaces as corruption of the
        // compressed stream rather than a decode-level integrity failure.
        assert_eq!(outcome.result.status, RunStatus::Corruption);
    }

    #[test]
    fn validation_can_be_skipped() {
        let messages = vec![msg("a.bin", b"payload")];
        let outcome = run_combination(&messages, &store(), &Limits::NONE, false);
        assert_eq!(outcome.state, RunState::Done);
        assert!(!outcome.trace.contains(&RunState::Validating));
    }

    #[test]
    fn collect_missing_directory_is_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let messages = collect_messages(dir.path(), "gps", "huff").unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn collect_reads_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("gps").join("huff");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("b.bin"), b"second").unwrap();
        std::fs::write(sub.join("a.bin"), b"first").unwrap();

        let messages = collect_messages(dir.path(), "gps", "huff").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].name(), "a.bin");
        assert_eq!(messages[0].data(), b"first");
        assert_eq!(messages[1].name(), "b.bin");
    }
}
