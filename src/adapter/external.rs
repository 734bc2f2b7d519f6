// External heavyweight compressors as stdin→stdout subprocesses.
//
// One uniform command contract for every binary (bsc, lstm-compress, gmix,
// paq8px, cmix, ...): the child reads all input from stdin, writes all
// output to stdout, and exits zero with an empty stderr on success. A
// `ProcessMonitor` samples the child specifically, and the wait loop
// enforces the caller's deadline and memory ceiling by killing the child —
// a breached heavyweight process must not keep burning CPU and RAM after
// the measurement window ends.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::metrics::{DEFAULT_SAMPLE_INTERVAL, ProcessMonitor, ResourceSample};

use super::{AdapterError, CompressOutcome, Compressor, Limits};

/// Granularity of the child wait loop (limit checks and exit polling).
const WAIT_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// PipeSpec
// ---------------------------------------------------------------------------

/// Command lines for one external algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeSpec {
    /// Algorithm identifier for run logs (e.g. "paq8px").
    pub name: String,
    /// argv for the compress direction.
    pub compress_argv: Vec<String>,
    /// argv for the decompress direction.
    pub decompress_argv: Vec<String>,
}

impl PipeSpec {
    /// Parse the CLI form `name=compress cmd|decompress cmd`, whitespace-split.
    ///
    /// Example: `--external 'bsc=bsc-m03 e|bsc-m03 d'`.
    pub fn parse(raw: &str) -> Result<Self, AdapterError> {
        let bad = |reason: &str| AdapterError::Config {
            option: "external".to_string(),
            reason: format!("'{raw}': {reason}"),
        };

        let (name, commands) = raw
            .split_once('=')
            .ok_or_else(|| bad("expected name=compress cmd|decompress cmd"))?;
        let (compress, decompress) = commands
            .split_once('|')
            .ok_or_else(|| bad("expected '|' between compress and decompress commands"))?;

        let split = |s: &str| -> Vec<String> {
            s.split_whitespace().map(str::to_owned).collect()
        };
        let spec = Self {
            name: name.trim().to_string(),
            compress_argv: split(compress),
            decompress_argv: split(decompress),
        };
        if spec.name.is_empty() {
            return Err(bad("empty algorithm name"));
        }
        if spec.compress_argv.is_empty() || spec.decompress_argv.is_empty() {
            return Err(bad("empty command line"));
        }
        Ok(spec)
    }
}

// ---------------------------------------------------------------------------
// PipeCompressor
// ---------------------------------------------------------------------------

/// Adapter that shells out to an external compressor through a byte pipe.
#[derive(Debug, Clone)]
pub struct PipeCompressor {
    spec: PipeSpec,
    sample_interval: Duration,
}

impl PipeCompressor {
    /// Build the adapter, probing both command binaries up front so a
    /// missing compressor surfaces as `Unavailable` at resolution time, not
    /// per combination mid-sweep.
    pub fn new(spec: PipeSpec) -> Result<Self, AdapterError> {
        if spec.compress_argv.is_empty() || spec.decompress_argv.is_empty() {
            return Err(AdapterError::Config {
                option: "external".to_string(),
                reason: format!("'{}': empty command line", spec.name),
            });
        }
        for argv in [&spec.compress_argv, &spec.decompress_argv] {
            if locate_binary(&argv[0]).is_none() {
                return Err(AdapterError::Unavailable {
                    name: spec.name.clone(),
                    reason: format!("{}: no such executable on PATH", argv[0]),
                });
            }
        }
        Ok(Self {
            spec,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        })
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    fn run(
        &self,
        argv: &[String],
        input: &[u8],
        limits: &Limits,
    ) -> Result<(Vec<u8>, ResourceSample), AdapterError> {
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    AdapterError::Unavailable {
                        name: self.spec.name.clone(),
                        reason: format!("{}: {e}", argv[0]),
                    }
                }
                _ => AdapterError::Io(e),
            })?;

        let monitor = ProcessMonitor::spawn(child.id(), self.sample_interval);

        // Feed stdin from its own thread so a child that writes before it
        // finishes reading cannot deadlock the pipe.
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let input_owned = input.to_vec();
        let writer = std::thread::spawn(move || {
            // A child that exits early (or gets killed) breaks the pipe;
            // the exit status decides the outcome, not this write.
            let _ = stdin.write_all(&input_owned);
        });

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let out_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        });
        let mut stderr = child.stderr.take().expect("stderr was piped");
        let err_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        });

        let verdict = wait_with_limits(&mut child, limits, &monitor);
        let sample = monitor.stop();
        let _ = writer.join();
        let output = out_reader.join().unwrap_or_default();
        let stderr_bytes = err_reader.join().unwrap_or_default();

        let status = match verdict {
            Ok(status) => status,
            Err(LimitBreach::Time { limit }) => {
                log::warn!(
                    "'{}' killed after {:?} (limit {:?})",
                    self.spec.name,
                    sample.elapsed,
                    limit
                );
                return Err(AdapterError::Timeout {
                    limit_ms: limit.as_millis() as u64,
                    elapsed_ms: sample.elapsed.as_millis() as u64,
                });
            }
            Err(LimitBreach::Memory { ceiling, peak }) => {
                log::warn!(
                    "'{}' killed at {} bytes RSS (ceiling {})",
                    self.spec.name,
                    peak,
                    ceiling
                );
                return Err(AdapterError::ResourceExhausted { ceiling, peak });
            }
            Err(LimitBreach::Wait(e)) => return Err(AdapterError::Io(e)),
        };

        if !status.success() || !stderr_bytes.is_empty() {
            return Err(AdapterError::ProcessFailed {
                name: self.spec.name.clone(),
                detail: format!(
                    "exit {:?}, stderr: {}",
                    status.code(),
                    String::from_utf8_lossy(&stderr_bytes).trim()
                ),
            });
        }

        Ok((output, sample))
    }
}

/// Resolve a command name the way `Command::new` will: explicit paths are
/// taken as-is, bare names are searched on PATH.
fn locate_binary(cmd: &str) -> Option<PathBuf> {
    let path = Path::new(cmd);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let dirs = std::env::var_os("PATH")?;
    std::env::split_paths(&dirs)
        .map(|dir| dir.join(cmd))
        .find(|candidate| candidate.is_file())
}

impl Compressor for PipeCompressor {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn compress(&self, input: &[u8], limits: &Limits) -> Result<CompressOutcome, AdapterError> {
        let (output, sample) = self.run(&self.spec.compress_argv, input, limits)?;
        Ok(CompressOutcome { output, sample })
    }

    fn decompress(&self, input: &[u8], limits: &Limits) -> Result<Vec<u8>, AdapterError> {
        // The self-check decompression of a heavyweight compressor can run
        // as long as the compression did, so the same limits apply.
        let (output, _sample) = self.run(&self.spec.decompress_argv, input, limits)?;
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Wait loop with limit enforcement
// ---------------------------------------------------------------------------

enum LimitBreach {
    Time { limit: Duration },
    Memory { ceiling: u64, peak: u64 },
    Wait(std::io::Error),
}

fn wait_with_limits(
    child: &mut Child,
    limits: &Limits,
    monitor: &ProcessMonitor,
) -> Result<std::process::ExitStatus, LimitBreach> {
    // checked_add: a limit near u64::MAX seconds overflows Instant; treat
    // that as no deadline rather than panicking.
    let deadline = limits
        .time_limit
        .and_then(|limit| Instant::now().checked_add(limit).map(|at| (at, limit)));

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => return Err(LimitBreach::Wait(e)),
        }

        if let Some((at, limit)) = deadline
            && Instant::now() >= at
        {
            kill_and_reap(child);
            return Err(LimitBreach::Time { limit });
        }

        if let Some(ceiling) = limits.memory_ceiling {
            let peak = monitor.peak_mem();
            if peak > ceiling {
                kill_and_reap(child);
                return Err(LimitBreach::Memory { ceiling, peak });
            }
        }

        std::thread::sleep(WAIT_POLL);
    }
}

/// Forcibly terminate the child and reap it so no zombie (or still-running
/// heavyweight compressor) outlives the measurement.
fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{RunStatus, run_adapter};

    fn have(cmd: &str) -> bool {
        Command::new(cmd)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    fn identity_adapter() -> PipeCompressor {
        PipeCompressor::new(PipeSpec {
            name: "ident".to_string(),
            compress_argv: vec!["cat".to_string()],
            decompress_argv: vec!["cat".to_string()],
        })
        .unwrap()
    }

    #[test]
    fn spec_parse_roundtrip() {
        let spec = PipeSpec::parse("bsc=bsc-m03 e|bsc-m03 d").unwrap();
        assert_eq!(spec.name, "bsc");
        assert_eq!(spec.compress_argv, vec!["bsc-m03", "e"]);
        assert_eq!(spec.decompress_argv, vec!["bsc-m03", "d"]);
    }

    #[test]
    fn spec_parse_rejects_malformed() {
        assert!(PipeSpec::parse("no-equals-here").is_err());
        assert!(PipeSpec::parse("name=only-one-command").is_err());
        assert!(PipeSpec::parse("=cat|cat").is_err());
        assert!(PipeSpec::parse("x=|cat").is_err());
    }

    #[test]
    fn missing_binary_is_unavailable_at_construction() {
        let err = PipeCompressor::new(PipeSpec {
            name: "ghost".to_string(),
            compress_argv: vec!["definitely-not-a-real-compressor-binary".to_string()],
            decompress_argv: vec!["definitely-not-a-real-compressor-binary".to_string()],
        })
        .unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable { .. }), "{err}");
    }

    #[test]
    fn missing_decompress_binary_is_also_probed() {
        if !have("cat") {
            return;
        }
        let err = PipeCompressor::new(PipeSpec {
            name: "halfghost".to_string(),
            compress_argv: vec!["cat".to_string()],
            decompress_argv: vec!["definitely-not-a-real-compressor-binary".to_string()],
        })
        .unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable { .. }));
    }

    #[test]
    fn identity_pipe_roundtrip() {
        if !have("cat") {
            eprintln!("cat not found, skipping pipe test");
            return;
        }
        let adapter = identity_adapter();
        let data: Vec<u8> = (0..=255).cycle().take(70_000).collect();
        let (result, compressed) = run_adapter(&adapter, &data, &Limits::NONE, true);
        assert!(result.status.is_ok(), "{:?}", result.error_detail);
        assert_eq!(compressed.unwrap(), data);
    }

    #[test]
    fn identity_pipe_empty_input() {
        if !have("cat") {
            return;
        }
        let adapter = identity_adapter();
        let outcome = adapter.compress(b"", &Limits::NONE).unwrap();
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn huge_time_limit_is_treated_as_no_deadline() {
        if !have("cat") {
            return;
        }
        let adapter = identity_adapter();
        let limits = Limits {
            time_limit: Some(Duration::from_secs(u64::MAX)),
            memory_ceiling: None,
        };
        let outcome = adapter.compress(b"data", &limits).unwrap();
        assert_eq!(outcome.output, b"data");
    }

    #[test]
    fn timeout_kills_child_within_bounded_overshoot() {
        if !have("sh") {
            eprintln!("sh not found, skipping timeout test");
            return;
        }
        let adapter = PipeCompressor::new(PipeSpec {
            name: "sleeper".to_string(),
            compress_argv: vec!["sh".into(), "-c".into(), "sleep 5".into()],
            decompress_argv: vec!["cat".into()],
        })
        .unwrap();

        let limit = Duration::from_millis(400);
        let started = Instant::now();
        let err = adapter
            .compress(
                b"x",
                &Limits {
                    time_limit: Some(limit),
                    memory_ceiling: None,
                },
            )
            .unwrap_err();
        let took = started.elapsed();

        assert!(matches!(err, AdapterError::Timeout { .. }), "{err}");
        assert!(took < limit * 2, "overshoot too large: {took:?}");
    }

    #[test]
    fn timeout_surfaces_in_run_record() {
        if !have("sh") {
            return;
        }
        let adapter = PipeCompressor::new(PipeSpec {
            name: "sleeper".to_string(),
            compress_argv: vec!["sh".into(), "-c".into(), "sleep 5".into()],
            decompress_argv: vec!["cat".into()],
        })
        .unwrap();
        let (result, bytes) = run_adapter(
            &adapter,
            b"x",
            &Limits {
                time_limit: Some(Duration::from_millis(300)),
                memory_ceiling: None,
            },
            true,
        );
        assert_eq!(result.status, RunStatus::Timeout);
        assert!(bytes.is_none());
    }

    #[test]
    fn nonzero_exit_is_process_failure() {
        if !have("sh") {
            return;
        }
        let adapter = PipeCompressor::new(PipeSpec {
            name: "broken".to_string(),
            compress_argv: vec!["sh".into(), "-c".into(), "exit 3".into()],
            decompress_argv: vec!["cat".into()],
        })
        .unwrap();
        let err = adapter.compress(b"data", &Limits::NONE).unwrap_err();
        match err {
            AdapterError::ProcessFailed { detail, .. } => assert!(detail.contains("3")),
            other => panic!("expected ProcessFailed, got {other}"),
        }
    }

    #[test]
    fn stderr_output_is_process_failure() {
        if !have("sh") {
            return;
        }
        let adapter = PipeCompressor::new(PipeSpec {
            name: "chatty".to_string(),
            compress_argv: vec!["sh".into(), "-c".into(), "echo oops >&2".into()],
            decompress_argv: vec!["cat".into()],
        })
        .unwrap();
        let err = adapter.compress(b"data", &Limits::NONE).unwrap_err();
        match err {
            AdapterError::ProcessFailed { detail, .. } => assert!(detail.contains("oops")),
            other => panic!("expected ProcessFailed, got {other}"),
        }
    }
}
