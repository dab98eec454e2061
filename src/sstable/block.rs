//! Data blocks: a run of entries in internal-key order.
//!
//! Entry layout: `[key_len:4][key][seq:8][op:1][value_len:4][value]`, with
//! an empty value for tombstones.

use crate::{Entry, InternalKey, OpType, Result, StorageError};
use bytes::{Buf, BufMut, BytesMut};

pub struct BlockBuilder {
    buf: BytesMut,
    first_key: Option<InternalKey>,
    count: usize,
}

impl BlockBuilder {
    pub fn new(block_size: usize) -> Self {
        BlockBuilder {
            buf: BytesMut::with_capacity(block_size + block_size / 4),
            first_key: None,
            count: 0,
        }
    }

    pub fn add(&mut self, entry: &Entry) {
        if self.first_key.is_none() {
            self.first_key = Some(entry.internal_key());
        }

        self.buf.put_u32_le(entry.key.len() as u32);
        self.buf.put_slice(&entry.key);
        self.buf.put_u64_le(entry.sequence);
        self.buf.put_u8(entry.op_type() as u8);
        match &entry.value {
            Some(value) => {
                self.buf.put_u32_le(value.len() as u32);
                self.buf.put_slice(value);
            }
            None => self.buf.put_u32_le(0),
        }
        self.count += 1;
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first_key(&self) -> Option<&InternalKey> {
        self.first_key.as_ref()
    }

    /// Hand back the encoded block and reset the builder for the next one.
    pub fn finish(&mut self) -> (Option<InternalKey>, Vec<u8>) {
        let data = self.buf.split().to_vec();
        self.count = 0;
        (self.first_key.take(), data)
    }
}

pub fn decode_block(mut data: &[u8]) -> Result<Vec<Entry>> {
    let truncated = || StorageError::Corruption("truncated block entry".into());
    let mut entries = Vec::new();

    while data.has_remaining() {
        if data.remaining() < 4 {
            return Err(truncated());
        }
        let key_len = data.get_u32_le() as usize;
        if data.remaining() < key_len + 13 {
            return Err(truncated());
        }
        let key = data[..key_len].to_vec();
        data.advance(key_len);
        let sequence = data.get_u64_le();
        let op = data.get_u8();
        let value_len = data.get_u32_le() as usize;
        if data.remaining() < value_len {
            return Err(truncated());
        }
        let value = data[..value_len].to_vec();
        data.advance(value_len);

        let value = match OpType::from_u8(op) {
            Some(OpType::Put) => Some(value),
            Some(OpType::Delete) => None,
            _ => {
                return Err(StorageError::Corruption(format!(
                    "invalid entry type {} in block",
                    op
                )))
            }
        };
        entries.push(Entry {
            key,
            value,
            sequence,
        });
    }

    Ok(entries)
}
