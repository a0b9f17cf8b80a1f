//! Backup file layout
//!
//! `"TCBK" | version | kind | count (u64 BE) | records | crc32 (u32 BE)`
//! where each record is `key len (u32) | key | flag (0 value, 1 tombstone) |
//! value len (u32) | value`. The whole buffer is zstd-compressed.

use super::types::{BackupError, BackupKind, BackupRecord, Result};

const MAGIC: &[u8; 4] = b"TCBK";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 1 + 8;
const FLAG_VALUE: u8 = 0;
const FLAG_TOMBSTONE: u8 = 1;

/// Serialize and compress a backup
pub fn encode(kind: BackupKind, records: &[BackupRecord], zstd_level: i32) -> Result<Vec<u8>> {
    let body_len: usize = records
        .iter()
        .map(|r| 4 + r.key.len() + 1 + 4 + r.value.as_ref().map_or(0, Vec::len))
        .sum();
    let mut raw = Vec::with_capacity(HEADER_LEN + body_len + 4);

    raw.extend_from_slice(MAGIC);
    raw.push(VERSION);
    raw.push(kind.tag());
    raw.extend_from_slice(&(records.len() as u64).to_be_bytes());

    for record in records {
        let key = record.key.as_bytes();
        raw.extend_from_slice(&len_u32(key.len())?.to_be_bytes());
        raw.extend_from_slice(key);
        match &record.value {
            Some(value) => {
                raw.push(FLAG_VALUE);
                raw.extend_from_slice(&len_u32(value.len())?.to_be_bytes());
                raw.extend_from_slice(value);
            }
            None => {
                raw.push(FLAG_TOMBSTONE);
                raw.extend_from_slice(&0u32.to_be_bytes());
            }
        }
    }

    let crc = crc32fast::hash(&raw);
    raw.extend_from_slice(&crc.to_be_bytes());

    Ok(zstd::encode_all(raw.as_slice(), zstd_level)?)
}

/// Decompress and parse a backup, verifying the embedded checksum
pub fn decode(data: &[u8]) -> Result<(BackupKind, Vec<BackupRecord>)> {
    let raw = zstd::decode_all(data)
        .map_err(|e| BackupError::Corrupted(format!("decompression failed: {}", e)))?;
    if raw.len() < HEADER_LEN + 4 {
        return Err(BackupError::Corrupted(format!(
            "file too short: {} bytes",
            raw.len()
        )));
    }

    let (body, trailer) = raw.split_at(raw.len() - 4);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(BackupError::Corrupted(format!(
            "embedded crc {:08x} != computed {:08x}",
            expected, actual
        )));
    }

    if &body[0..4] != MAGIC {
        return Err(BackupError::Corrupted("bad magic".to_string()));
    }
    if body[4] != VERSION {
        return Err(BackupError::Corrupted(format!(
            "unsupported version {}",
            body[4]
        )));
    }
    let kind = BackupKind::from_tag(body[5])
        .ok_or_else(|| BackupError::Corrupted(format!("unknown kind tag {}", body[5])))?;

    let mut reader = Reader {
        buf: body,
        pos: 6,
    };
    let count = reader.u64()?;
    let mut records = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        let key_len = reader.u32()? as usize;
        let key = String::from_utf8(reader.bytes(key_len)?.to_vec())
            .map_err(|_| BackupError::Corrupted("key is not utf-8".to_string()))?;
        let flag = reader.u8()?;
        let value_len = reader.u32()? as usize;
        let value = reader.bytes(value_len)?.to_vec();
        records.push(match flag {
            FLAG_VALUE => BackupRecord::value(key, value),
            FLAG_TOMBSTONE => BackupRecord::tombstone(key),
            other => {
                return Err(BackupError::Corrupted(format!("unknown record flag {}", other)));
            }
        });
    }

    if reader.pos != body.len() {
        return Err(BackupError::Corrupted(format!(
            "{} trailing bytes",
            body.len() - reader.pos
        )));
    }
    Ok((kind, records))
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| BackupError::Serialization(format!("field of {} bytes too large", len)))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| BackupError::Corrupted("truncated record".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_be_bytes(buf))
    }
}
