//! Record capabilities: ordering and byte encoding.
//!
//! The operators never inspect records themselves. They order them through a
//! [`RecordComparator`] and move them through memory segments and spill files
//! through a [`RecordSerializer`]. Containers frame each record with its
//! length, so encodings need not be self-delimiting.

use std::cmp::Ordering;

use crate::error::{OperatorError, Result};

/// Total order over records. Two records are in the same group exactly when
/// they compare `Equal`.
pub trait RecordComparator<R>: Send + Sync {
    fn compare(&self, a: &R, b: &R) -> Ordering;

    /// Order two records straight from their encodings.
    ///
    /// Comparators tied to one encoding override this to skip decoding.
    /// `None` tells the caller to decode both records and use [`compare`].
    ///
    /// [`compare`]: RecordComparator::compare
    fn compare_encoded(&self, _a: &[u8], _b: &[u8]) -> Option<Ordering> {
        None
    }
}

impl<R, F> RecordComparator<R> for F
where
    F: Fn(&R, &R) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &R, b: &R) -> Ordering {
        self(a, b)
    }
}

pub trait RecordSerializer<R>: Send + Sync {
    /// Append the encoding of `record` to `out`.
    fn serialize(&self, record: &R, out: &mut Vec<u8>);

    fn deserialize(&self, bytes: &[u8]) -> Result<R>;
}

/// Key/value pair of raw bytes.
pub type KvRecord = (Vec<u8>, Vec<u8>);

/// Encodes a [`KvRecord`] as `key_len: u32 | value_len: u32 | key | value`.
#[derive(Clone, Copy, Debug, Default)]
pub struct KvSerializer;

impl RecordSerializer<KvRecord> for KvSerializer {
    fn serialize(&self, (key, value): &KvRecord, out: &mut Vec<u8>) {
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(value);
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<KvRecord> {
        if bytes.len() < 8 {
            return Err(OperatorError::Serialization(format!(
                "key/value entry of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let key_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let value_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if 8 + key_len + value_len != bytes.len() {
            return Err(OperatorError::Serialization(format!(
                "key/value entry header announces {} + {} bytes, entry holds {}",
                key_len,
                value_len,
                bytes.len() - 8
            )));
        }
        let key = bytes[8..8 + key_len].to_vec();
        let value = bytes[8 + key_len..].to_vec();
        Ok((key, value))
    }
}

fn encoded_key(bytes: &[u8]) -> Option<&[u8]> {
    let header = bytes.get(..4)?;
    let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    bytes.get(8..8usize.checked_add(key_len)?)
}

/// Orders [`KvRecord`]s lexicographically by key, ignoring the value.
///
/// Encodings produced by [`KvSerializer`] are compared without decoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyComparator;

impl RecordComparator<KvRecord> for KeyComparator {
    fn compare(&self, a: &KvRecord, b: &KvRecord) -> Ordering {
        a.0.cmp(&b.0)
    }

    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Option<Ordering> {
        Some(encoded_key(a)?.cmp(encoded_key(b)?))
    }
}

/// Fixed-width little-endian encoding of `u32` tuples.
#[derive(Clone, Copy, Debug, Default)]
pub struct U32TupleSerializer;

fn read_u32s<const N: usize>(bytes: &[u8]) -> Result<[u32; N]> {
    if bytes.len() != 4 * N {
        return Err(OperatorError::Serialization(format!(
            "expected {} bytes for {} u32 fields, got {}",
            4 * N,
            N,
            bytes.len()
        )));
    }
    let mut fields = [0u32; N];
    for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(4)) {
        *field = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(fields)
}

impl RecordSerializer<(u32, u32)> for U32TupleSerializer {
    fn serialize(&self, record: &(u32, u32), out: &mut Vec<u8>) {
        out.extend_from_slice(&record.0.to_le_bytes());
        out.extend_from_slice(&record.1.to_le_bytes());
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<(u32, u32)> {
        let [a, b] = read_u32s::<2>(bytes)?;
        Ok((a, b))
    }
}

impl RecordSerializer<(u32, u32, u32, u32)> for U32TupleSerializer {
    fn serialize(&self, record: &(u32, u32, u32, u32), out: &mut Vec<u8>) {
        for field in [record.0, record.1, record.2, record.3] {
            out.extend_from_slice(&field.to_le_bytes());
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<(u32, u32, u32, u32)> {
        let [a, b, c, d] = read_u32s::<4>(bytes)?;
        Ok((a, b, c, d))
    }
}
