//! Atomic groups of writes.
//!
//! A batch is logged as one WAL record and applied under one contiguous
//! range of sequence numbers, so it is either fully visible or not at all.

use crate::{Entry, Key, OpType, Result, SequenceNumber, StorageError, Value};
use bytes::{Buf, BufMut, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Key, value: Value },
    Delete { key: Key },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }

    pub(crate) fn to_entry(&self, sequence: SequenceNumber) -> Entry {
        match self {
            BatchOp::Put { key, value } => Entry::put(key.clone(), value.clone(), sequence),
            BatchOp::Delete { key } => Entry::tombstone(key.clone(), sequence),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Key>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Entries of the batch, numbered from `first_sequence`.
    pub fn entries(&self, first_sequence: SequenceNumber) -> impl Iterator<Item = Entry> + '_ {
        self.ops
            .iter()
            .enumerate()
            .map(move |(i, op)| op.to_entry(first_sequence + i as u64))
    }

    /// Payload bytes, used for write metrics.
    pub fn payload_bytes(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value } => key.len() + value.len(),
                BatchOp::Delete { key } => key.len(),
            })
            .sum()
    }

    /// Body format: `[count:4]` then per op `[op:1][key_len:4][key][value_len:4][value]`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.ops.len() as u32);
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    buf.put_u8(OpType::Put as u8);
                    buf.put_u32_le(key.len() as u32);
                    buf.put_slice(key);
                    buf.put_u32_le(value.len() as u32);
                    buf.put_slice(value);
                }
                BatchOp::Delete { key } => {
                    buf.put_u8(OpType::Delete as u8);
                    buf.put_u32_le(key.len() as u32);
                    buf.put_slice(key);
                    buf.put_u32_le(0);
                }
            }
        }
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let truncated = || StorageError::Corruption("Truncated batch body".into());

        if data.remaining() < 4 {
            return Err(truncated());
        }
        let count = data.get_u32_le() as usize;
        let mut ops = Vec::with_capacity(count.min(1024));

        for _ in 0..count {
            if data.remaining() < 5 {
                return Err(truncated());
            }
            let op = data.get_u8();
            let key_len = data.get_u32_le() as usize;
            if data.remaining() < key_len + 4 {
                return Err(truncated());
            }
            let key = data[..key_len].to_vec();
            data.advance(key_len);
            let value_len = data.get_u32_le() as usize;
            if data.remaining() < value_len {
                return Err(truncated());
            }
            let value = data[..value_len].to_vec();
            data.advance(value_len);

            match OpType::from_u8(op) {
                Some(OpType::Put) => ops.push(BatchOp::Put { key, value }),
                Some(OpType::Delete) => ops.push(BatchOp::Delete { key }),
                _ => {
                    return Err(StorageError::Corruption(format!(
                        "Invalid op type in batch: {}",
                        op
                    )))
                }
            }
        }

        if data.has_remaining() {
            return Err(StorageError::Corruption(
                "Trailing bytes after batch body".into(),
            ));
        }

        Ok(WriteBatch { ops })
    }
}
