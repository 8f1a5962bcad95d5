//! Manifest codec.
//!
//! The coordinator answers `GET /openbmclapi/files` with a zstd frame
//! wrapping the Avro binary encoding of
//!
//! ```text
//! record FileList { array<record FileInfo { string path; string hash; long size; long mtime; }> files; }
//! ```
//!
//! A record is the concatenation of its fields, so the payload is a single
//! block-encoded array. JSON bodies of the same shape are accepted too.

use crate::model::{FileInfo, FileList};

/// Upper bound on the decompressed manifest.
pub const MAX_MANIFEST_SIZE: usize = 20 * 1024 * 1024;

/// Smallest encoded record: two empty strings and two one-byte longs.
const MIN_RECORD_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to decompress manifest: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("failed to parse json manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("truncated avro payload at byte {0}")]
    UnexpectedEof(usize),
    #[error("malformed varint at byte {0}")]
    Varint(usize),
    #[error("invalid length {0} at byte {1}")]
    Length(i64, usize),
    #[error("invalid utf-8 string at byte {0}")]
    Utf8(usize),
    #[error("{0} trailing bytes after manifest")]
    Trailing(usize),
}

/// Decode a manifest response body. `content_type` selects the JSON path
/// when it names `application/json`; anything else is treated as zstd + Avro.
pub fn decode_file_list(body: &[u8], content_type: Option<&str>) -> Result<FileList, ManifestError> {
    if content_type.is_some_and(|ct| ct.contains("application/json")) {
        return Ok(serde_json::from_slice(body)?);
    }

    let raw = zstd::bulk::decompress(body, MAX_MANIFEST_SIZE)?;
    tracing::debug!(compressed = body.len(), raw = raw.len(), "decompressed manifest");
    decode_avro(&raw)
}

/// Decode an uncompressed Avro `FileList`.
pub fn decode_avro(raw: &[u8]) -> Result<FileList, ManifestError> {
    let mut reader = AvroReader::new(raw);
    let mut files = Vec::new();

    loop {
        let mut count = reader.read_long()?;
        if count == 0 {
            break;
        }
        if count < 0 {
            // negative block count is followed by the block size in bytes
            count = count.checked_neg().ok_or(ManifestError::Length(count, reader.pos))?;
            let _block_size = reader.read_long()?;
        }
        if count as u64 > (reader.remaining() / MIN_RECORD_BYTES) as u64 {
            return Err(ManifestError::Length(count, reader.pos));
        }
        files.reserve(count as usize);
        for _ in 0..count {
            files.push(FileInfo {
                path: reader.read_string()?,
                hash: reader.read_string()?,
                size: reader.read_non_negative()?,
                mtime: reader.read_long()?,
            });
        }
    }

    if reader.remaining() > 0 {
        return Err(ManifestError::Trailing(reader.remaining()));
    }

    Ok(FileList::new(files))
}

/// Encode a `FileList` the way the coordinator does. Used by tooling and
/// tests that stand in for the coordinator.
pub fn encode_file_list(list: &FileList) -> Result<Vec<u8>, ManifestError> {
    let mut raw = Vec::new();
    if !list.files.is_empty() {
        write_long(&mut raw, list.files.len() as i64);
        for file in &list.files {
            write_string(&mut raw, &file.path);
            write_string(&mut raw, &file.hash);
            write_long(&mut raw, file.size as i64);
            write_long(&mut raw, file.mtime);
        }
    }
    write_long(&mut raw, 0);

    Ok(zstd::bulk::compress(&raw, 0)?)
}

struct AvroReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> AvroReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_long(&mut self) -> Result<i64, ManifestError> {
        let start = self.pos;
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(ManifestError::UnexpectedEof(self.pos))?;
            self.pos += 1;
            if shift > 63 {
                return Err(ManifestError::Varint(start));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        // zig-zag
        Ok((value >> 1) as i64 ^ -((value & 1) as i64))
    }

    fn read_non_negative(&mut self) -> Result<u64, ManifestError> {
        let pos = self.pos;
        let value = self.read_long()?;
        u64::try_from(value).map_err(|_| ManifestError::Length(value, pos))
    }

    fn read_string(&mut self) -> Result<String, ManifestError> {
        let start = self.pos;
        let len = self.read_non_negative()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ManifestError::UnexpectedEof(self.buf.len()))?;
        let value = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| ManifestError::Utf8(start))?
            .to_string();
        self.pos = end;
        Ok(value)
    }
}

fn write_long(out: &mut Vec<u8>, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    while n >= 0x80 {
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    write_long(out, value.len() as i64);
    out.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileList {
        FileList::new(vec![
            FileInfo {
                path: "/assets/indexes/1.20.json".to_string(),
                hash: "deadbeefdeadbeefdeadbeefdeadbeef".to_string(),
                size: 4,
                mtime: 1_700_000_000_123,
            },
            FileInfo {
                path: "/maven/net/minecraft/client.jar".to_string(),
                hash: "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed".to_string(),
                size: 25_000_000,
                mtime: -1,
            },
        ])
    }

    #[test]
    fn test_decode_compressed_avro() {
        let body = encode_file_list(&sample()).unwrap();
        let decoded = decode_file_list(&body, Some("application/octet-stream")).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.files[0].path, "/assets/indexes/1.20.json");
        assert_eq!(decoded.files[1].size, 25_000_000);
        assert_eq!(decoded.files[1].mtime, -1);
    }

    #[test]
    fn test_decode_negative_block_count() {
        // one block of one record announced with a negative count and byte size
        let mut raw = Vec::new();
        let mut record = Vec::new();
        write_string(&mut record, "/a");
        write_string(&mut record, "00ff");
        write_long(&mut record, 1);
        write_long(&mut record, 2);
        write_long(&mut raw, -1);
        write_long(&mut raw, record.len() as i64);
        raw.extend_from_slice(&record);
        write_long(&mut raw, 0);

        let decoded = decode_avro(&raw).unwrap();
        assert_eq!(decoded.files[0].hash, "00ff");
        assert_eq!(decoded.files[0].mtime, 2);
    }

    #[test]
    fn test_decode_json() {
        let body = br#"{"files":[{"path":"/a","hash":"00ff","size":3,"mtime":10}]}"#;
        let decoded = decode_file_list(body, Some("application/json; charset=utf-8")).unwrap();
        assert_eq!(decoded.files[0].size, 3);
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut raw = Vec::new();
        write_long(&mut raw, 1);
        write_string(&mut raw, "/a");
        assert!(matches!(
            decode_avro(&raw),
            Err(ManifestError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn test_block_count_larger_than_payload() {
        let mut raw = Vec::new();
        write_long(&mut raw, 1 << 40);
        write_long(&mut raw, 0);
        assert!(matches!(
            decode_avro(&raw),
            Err(ManifestError::Length(count, _)) if count == 1 << 40
        ));

        // negative form with a bogus byte size
        let mut raw = Vec::new();
        write_long(&mut raw, -(1 << 40));
        write_long(&mut raw, 8);
        write_long(&mut raw, 0);
        assert!(matches!(decode_avro(&raw), Err(ManifestError::Length(_, _))));

        // exactly one minimal record still decodes
        let mut raw = Vec::new();
        write_long(&mut raw, 1);
        write_string(&mut raw, "");
        write_string(&mut raw, "");
        write_long(&mut raw, 0);
        write_long(&mut raw, 0);
        write_long(&mut raw, 0);
        assert_eq!(decode_avro(&raw).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_manifest() {
        let body = encode_file_list(&FileList::default()).unwrap();
        assert!(decode_file_list(&body, None).unwrap().is_empty());
    }
}
