// In-process second-stage codecs.
//
// These are the lightweight end of the candidate set: useful as baselines
// against the heavyweight external binaries, and as always-available
// adapters for tests and smoke runs. Each constructor declares and
// validates its own option set.

use std::io;

use super::{
    AdapterConfig, AdapterError, CompressOutcome, Compressor, Limits, measured_in_process,
};

// ---------------------------------------------------------------------------
// Store (passthrough)
// ---------------------------------------------------------------------------

/// Identity "codec". Measures the pipeline floor: container bytes in,
/// container bytes out, ratio 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCompressor;

impl StoreCompressor {
    pub fn new(config: &AdapterConfig) -> Result<Self, AdapterError> {
        config.ensure_known(&[])?;
        Ok(Self)
    }
}

impl Compressor for StoreCompressor {
    fn name(&self) -> &str {
        "store"
    }

    fn compress(&self, input: &[u8], limits: &Limits) -> Result<CompressOutcome, AdapterError> {
        measured_in_process(limits, || Ok(input.to_vec()))
    }

    fn decompress(&self, input: &[u8], _limits: &Limits) -> Result<Vec<u8>, AdapterError> {
        Ok(input.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Zlib
// ---------------------------------------------------------------------------

/// Zlib/Deflate codec via flate2. Options: `level` (0-9, default 6).
#[cfg(feature = "zlib-stage2")]
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: flate2::Compression,
}

#[cfg(feature = "zlib-stage2")]
impl ZlibCompressor {
    pub fn new(config: &AdapterConfig) -> Result<Self, AdapterError> {
        config.ensure_known(&["level"])?;
        let level = config.get_parsed::<u32>("level")?.unwrap_or(6);
        if level > 9 {
            return Err(AdapterError::Config {
                option: "level".to_string(),
                reason: format!("{level} out of range 0-9"),
            });
        }
        Ok(Self {
            level: flate2::Compression::new(level),
        })
    }
}

#[cfg(feature = "zlib-stage2")]
impl Compressor for ZlibCompressor {
    fn name(&self) -> &str {
        "zlib"
    }

    fn compress(&self, input: &[u8], limits: &Limits) -> Result<CompressOutcome, AdapterError> {
        let level = self.level;
        measured_in_process(limits, move || {
            use flate2::write::ZlibEncoder;
            use io::Write;

            let mut encoder = ZlibEncoder::new(Vec::new(), level);
            encoder.write_all(input)?;
            Ok(encoder.finish()?)
        })
    }

    fn decompress(&self, input: &[u8], _limits: &Limits) -> Result<Vec<u8>, AdapterError> {
        use flate2::read::ZlibDecoder;
        use io::Read;

        let mut decoder = ZlibDecoder::new(input);
        let mut output = Vec::new();
        decoder
            .read_to_end(&mut output)
            .map_err(|e| AdapterError::Corruption {
                detail: format!("zlib stream rejected: {e}"),
            })?;
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// LZMA
// ---------------------------------------------------------------------------

/// LZMA codec via lzma-rs. No tuning options (the lzma-rs encoder exposes
/// none worth sweeping).
#[cfg(feature = "lzma-stage2")]
#[derive(Debug, Clone, Copy, Default)]
pub struct LzmaCompressor;

#[cfg(feature = "lzma-stage2")]
impl LzmaCompressor {
    pub fn new(config: &AdapterConfig) -> Result<Self, AdapterError> {
        config.ensure_known(&[])?;
        Ok(Self)
    }
}

#[cfg(feature = "lzma-stage2")]
impl Compressor for LzmaCompressor {
    fn name(&self) -> &str {
        "lzma"
    }

    fn compress(&self, input: &[u8], limits: &Limits) -> Result<CompressOutcome, AdapterError> {
        measured_in_process(limits, || {
            let mut reader = io::Cursor::new(input);
            let mut output = Vec::new();
            lzma_rs::lzma_compress(&mut reader, &mut output)?;
            Ok(output)
        })
    }

    fn decompress(&self, input: &[u8], _limits: &Limits) -> Result<Vec<u8>, AdapterError> {
        let mut reader = io::BufReader::new(io::Cursor::new(input));
        let mut output = Vec::new();
        lzma_rs::lzma_decompress(&mut reader, &mut output).map_err(|e| {
            AdapterError::Corruption {
                detail: format!("LZMA stream rejected: {e}"),
            }
        })?;
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
