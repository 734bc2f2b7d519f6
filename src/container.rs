// Self-describing message container (the stable on-disk/aggregation format).
//
// Layout, all integers little-endian:
//
//   [u32 count] { [u16 name_len][name bytes][u64 data_len][data bytes] }*count
//
// The codec is a pure byte transform: callers supply and consume buffers,
// file persistence lives in `write_container_file` / `read_container_file`.
// Trailing bytes after the declared record count are rejected, so a decoded
// container is fully accounted for by its header.

use std::path::Path;

use thiserror::Error;

/// Maximum encoded name length (fits the u16 length prefix).
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

/// Fixed per-message framing overhead: name length (2) + data length (8).
const ENTRY_OVERHEAD: usize = 2 + 8;

/// Container count header size.
const HEADER_LEN: usize = 4;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One named, opaque payload — typically a single node transmission that was
/// already compressed on-device. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    name: String,
    data: Vec<u8>,
}

impl Message {
    /// Create a message. Fails if the name does not fit the u16 length prefix.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Result<Self, EncodingError> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            return Err(EncodingError::NameTooLong { len: name.len() });
        }
        Ok(Self { name, data })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.name, self.data)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Encode-side failures.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("message name is {len} bytes, exceeds the {MAX_NAME_LEN}-byte limit")]
    NameTooLong { len: usize },

    #[error("container holds {count} messages, exceeds the u32 count field")]
    TooManyMessages { count: usize },
}

/// Decode-side failures. Any of these means the buffer is not a container
/// produced by `encode` (or it was truncated / had bytes appended in transit).
#[derive(Debug, Error)]
pub enum MalformedContainerError {
    #[error("container shorter than the {HEADER_LEN}-byte count header ({len} bytes)")]
    MissingHeader { len: usize },

    #[error("message {index}: record header overruns the buffer at offset {offset}")]
    TruncatedRecord { index: u32, offset: usize },

    #[error("message {index}: declared length {declared} overruns the {remaining} bytes left")]
    LengthOverrun {
        index: u32,
        declared: u64,
        remaining: usize,
    },

    #[error("message {index}: name is not valid UTF-8")]
    InvalidName { index: u32 },

    #[error("{trailing} trailing bytes after the declared {count} records")]
    TrailingBytes { count: u32, trailing: usize },
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Serialize an ordered message sequence into container bytes.
pub fn encode(messages: &[Message]) -> Result<Vec<u8>, EncodingError> {
    let count = u32::try_from(messages.len()).map_err(|_| EncodingError::TooManyMessages {
        count: messages.len(),
    })?;

    let total: usize = HEADER_LEN
        + messages
            .iter()
            .map(|m| ENTRY_OVERHEAD + m.name.len() + m.data.len())
            .sum::<usize>();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&count.to_le_bytes());

    for msg in messages {
        let name = msg.name.as_bytes();
        // Message::new enforces this; re-check so a hand-rolled Message via
        // deserialization paths can never produce an undecodable container.
        if name.len() > MAX_NAME_LEN {
            return Err(EncodingError::NameTooLong { len: name.len() });
        }
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&(msg.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&msg.data);
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Parse container bytes back into the original message sequence.
///
/// The inverse of [`encode`]: `decode(&encode(&m)?)? == m` for every valid
/// sequence. Trailing bytes beyond the declared count are an error.
pub fn decode(bytes: &[u8]) -> Result<Vec<Message>, MalformedContainerError> {
    if bytes.len() < HEADER_LEN {
        return Err(MalformedContainerError::MissingHeader { len: bytes.len() });
    }

    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let mut pos = HEADER_LEN;
    let mut messages = Vec::with_capacity(count.min(1 << 16) as usize);

    for index in 0..count {
        let name_len = read_u16(bytes, &mut pos)
            .ok_or(MalformedContainerError::TruncatedRecord { index, offset: pos })?
            as usize;
        let name_bytes = read_slice(bytes, &mut pos, name_len).ok_or({
            MalformedContainerError::LengthOverrun {
                index,
                declared: name_len as u64,
                remaining: bytes.len() - pos,
            }
        })?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| MalformedContainerError::InvalidName { index })?
            .to_owned();

        let data_len = read_u64(bytes, &mut pos)
            .ok_or(MalformedContainerError::TruncatedRecord { index, offset: pos })?;
        let data_len_usize = usize::try_from(data_len).map_err(|_| {
            MalformedContainerError::LengthOverrun {
                index,
                declared: data_len,
                remaining: bytes.len() - pos,
            }
        })?;
        let data = read_slice(bytes, &mut pos, data_len_usize)
            .ok_or(MalformedContainerError::LengthOverrun {
                index,
                declared: data_len,
                remaining: bytes.len() - pos,
            })?
            .to_vec();

        messages.push(Message { name, data });
    }

    if pos != bytes.len() {
        return Err(MalformedContainerError::TrailingBytes {
            count,
            trailing: bytes.len() - pos,
        });
    }

    Ok(messages)
}

fn read_u16(bytes: &[u8], pos: &mut usize) -> Option<u16> {
    let end = pos.checked_add(2)?;
    let slice = bytes.get(*pos..end)?;
    *pos = end;
    Some(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let end = pos.checked_add(8)?;
    let slice = bytes.get(*pos..end)?;
    *pos = end;
    Some(u64::from_le_bytes(slice.try_into().ok()?))
}

fn read_slice<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Option<&'a [u8]> {
    let end = pos.checked_add(len)?;
    let slice = bytes.get(*pos..end)?;
    *pos = end;
    Some(slice)
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Failures from the container file helpers.
#[derive(Debug, Error)]
pub enum ContainerFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Malformed(#[from] MalformedContainerError),
}

/// Encode `messages` and write the container to `path`.
pub fn write_container_file(
    path: &Path,
    messages: &[Message],
) -> Result<u64, ContainerFileError> {
    let bytes = encode(messages)?;
    std::fs::write(path, &bytes)?;
    Ok(bytes.len() as u64)
}

/// Read and decode a container file.
pub fn read_container_file(path: &Path) -> Result<Vec<Message>, ContainerFileError> {
    let bytes = std::fs::read(path)?;
    Ok(decode(&bytes)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(name: &str, data: &[u8]) -> Message {
        Message::new(name, data.to_vec()).unwrap()
    }

    fn roundtrip(messages: &[Message]) {
        let bytes = encode(messages).expect("encode failed");
        let decoded = decode(&bytes).expect("decode failed");
        assert_eq!(decoded, messages);
    }

    #[test]
    fn roundtrip_empty_set() {
        roundtrip(&[]);
        // A zero-count container is exactly the 4-byte header.
        assert_eq!(encode(&[]).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn roundtrip_single_empty_payload() {
        roundtrip(&[msg("empty.bin", b"")]);
    }

    #[test]
    fn roundtrip_known_vector() {
        let messages = [msg("a.bin", b""), msg("b.bin", b"\x01\x02\x03")];
        let bytes = encode(&messages).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].name(), "a.bin");
        assert_eq!(decoded[0].data(), b"");
        assert_eq!(decoded[1].name(), "b.bin");
        assert_eq!(decoded[1].data(), b"\x01\x02\x03");
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let bytes = encode(&[msg("ab", b"\xAA")]).unwrap();
        let expected: Vec<u8> = [
            &[1, 0, 0, 0][..],             // count = 1
            &[2, 0][..],                   // name_len = 2
            b"ab",                         // name
            &[1, 0, 0, 0, 0, 0, 0, 0][..], // data_len = 1
            &[0xAA][..],                   // data
        ]
        .concat();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn roundtrip_many_messages_varied_sizes() {
        let messages: Vec<Message> = (0..500)
            .map(|i| {
                let len = (i * 37) % 10_001;
                let data: Vec<u8> = (0..len).map(|j| ((i + j) % 256) as u8).collect();
                msg(&format!("msg_{i:04}.bin"), &data)
            })
            .collect();
        roundtrip(&messages);
    }

    #[test]
    fn name_too_long_rejected() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            Message::new(long, Vec::new()),
            Err(EncodingError::NameTooLong { .. })
        ));
    }

    #[test]
    fn max_len_name_accepted() {
        let name = "n".repeat(MAX_NAME_LEN);
        roundtrip(&[msg(&name, b"payload")]);
    }

    #[test]
    fn truncated_container_rejected() {
        let bytes = encode(&[msg("a.bin", b"payload")]).unwrap();
        for cut in 0..bytes.len() {
            let err = decode(&bytes[..cut]).unwrap_err();
            match err {
                MalformedContainerError::MissingHeader { .. }
                | MalformedContainerError::TruncatedRecord { .. }
                | MalformedContainerError::LengthOverrun { .. } => {}
                other => panic!("unexpected error for cut at {cut}: {other}"),
            }
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode(&[msg("a.bin", b"data")]).unwrap();
        bytes.push(0x00);
        assert!(matches!(
            decode(&bytes),
            Err(MalformedContainerError::TrailingBytes { trailing: 1, .. })
        ));
    }

    #[test]
    fn overstated_count_rejected() {
        // Header claims 2 records but only 1 follows.
        let mut bytes = encode(&[msg("a.bin", b"data")]).unwrap();
        bytes[0] = 2;
        assert!(matches!(
            decode(&bytes),
            Err(MalformedContainerError::TruncatedRecord { index: 1, .. })
        ));
    }

    #[test]
    fn overstated_data_len_rejected() {
        let mut bytes = encode(&[msg("a", b"xy")]).unwrap();
        // data_len sits after count(4) + name_len(2) + name(1).
        bytes[7] = 0xFF;
        assert!(matches!(
            decode(&bytes),
            Err(MalformedContainerError::LengthOverrun { index: 0, .. })
        ));
    }

    #[test]
    fn non_utf8_name_rejected() {
        let mut bytes = encode(&[msg("ab", b"")]).unwrap();
        bytes[6] = 0xFF; // corrupt a name byte
        assert!(matches!(
            decode(&bytes),
            Err(MalformedContainerError::InvalidName { index: 0 })
        ));
    }

    #[test]
    fn container_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.cont");
        let messages = vec![msg("a.bin", b"one"), msg("b.bin", b"two")];

        let written = write_container_file(&path, &messages).unwrap();
        assert_eq!(written, std::fs::metadata(&path).unwrap().len());

        let decoded = read_container_file(&path).unwrap();
        assert_eq!(decoded, messages);
    }
}
