//! On-disk layout shared by the table writer and reader.
//!
//! ```text
//! [data block 0] ... [data block n]
//! [filter block]      bloom filter over user keys
//! [properties block]  TableMeta
//! [index block]       first internal key of each data block -> handle
//! [footer]            fixed 56 bytes
//! ```
//!
//! Every block is followed by a 5-byte trailer `[compression:1][crc32:4]`,
//! the CRC covering the stored block bytes and the compression byte.

use crate::options::CompressionType;
use crate::{InternalKey, Key, Result, SequenceNumber, StorageError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;
pub const SSTABLE_MAGIC: u64 = 0x4C45_564B_5653_5354; // "LEVKVSST"
pub const FOOTER_SIZE: usize = 8 * 7;
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Location of a sealed block; `size` includes the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

/// Sparse index entry: the first internal key stored in a data block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub first_key: InternalKey,
    pub handle: BlockHandle,
}

/// Table metadata. Written into the properties block and recorded in the
/// manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: u64,
    pub file_size: u64,
    pub entry_count: u64,
    pub tombstone_count: u64,
    pub smallest_key: Key,
    pub largest_key: Key,
    pub min_sequence: SequenceNumber,
    pub max_sequence: SequenceNumber,
}

impl TableMeta {
    pub fn overlaps(&self, smallest: &[u8], largest: &[u8]) -> bool {
        self.smallest_key.as_slice() <= largest && self.largest_key.as_slice() >= smallest
    }

    pub fn covers(&self, key: &[u8]) -> bool {
        self.smallest_key.as_slice() <= key && key <= self.largest_key.as_slice()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub filter: BlockHandle,
    pub properties: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        for handle in [&self.filter, &self.properties, &self.index] {
            buf.put_u64_le(handle.offset);
            buf.put_u64_le(handle.size);
        }
        buf.put_u64_le(SSTABLE_MAGIC);
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(StorageError::Corruption("footer too short".into()));
        }
        let handle = |data: &mut &[u8]| BlockHandle {
            offset: data.get_u64_le(),
            size: data.get_u64_le(),
        };
        let filter = handle(&mut data);
        let properties = handle(&mut data);
        let index = handle(&mut data);
        let magic = data.get_u64_le();

        if magic != SSTABLE_MAGIC {
            return Err(StorageError::Corruption(format!(
                "bad magic: expected {:#x}, got {:#x}",
                SSTABLE_MAGIC, magic
            )));
        }

        Ok(Footer {
            filter,
            properties,
            index,
        })
    }
}

/// Compress `raw` if that pays off and append the block trailer.
pub fn seal_block(raw: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    let (mut stored, used) = match compression {
        CompressionType::None => (raw.to_vec(), CompressionType::None),
        CompressionType::Snappy => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(raw)
                .map_err(|e| StorageError::InvalidArgument(format!("snappy: {}", e)))?;
            // Keep the raw bytes unless compression saves at least 1/8th.
            if compressed.len() < raw.len() - raw.len() / 8 {
                (compressed, CompressionType::Snappy)
            } else {
                (raw.to_vec(), CompressionType::None)
            }
        }
    };

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&stored);
    hasher.update(&[used as u8]);
    let crc = hasher.finalize();

    stored.push(used as u8);
    stored.extend_from_slice(&crc.to_le_bytes());
    Ok(stored)
}

/// Verify the trailer of a stored block and return its decompressed bytes.
pub fn open_block(sealed: &[u8], what: &str) -> Result<Vec<u8>> {
    if sealed.len() < BLOCK_TRAILER_SIZE {
        return Err(StorageError::Corruption(format!("{} block too short", what)));
    }
    let (stored, trailer) = sealed.split_at(sealed.len() - BLOCK_TRAILER_SIZE);
    let type_byte = trailer[0];
    let expected = u32::from_le_bytes([trailer[1], trailer[2], trailer[3], trailer[4]]);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(stored);
    hasher.update(&[type_byte]);
    let computed = hasher.finalize();
    if computed != expected {
        return Err(StorageError::Corruption(format!(
            "{} block checksum mismatch: expected {}, got {}",
            what, expected, computed
        )));
    }

    match CompressionType::from_u8(type_byte) {
        Some(CompressionType::None) => Ok(stored.to_vec()),
        Some(CompressionType::Snappy) => snap::raw::Decoder::new()
            .decompress_vec(stored)
            .map_err(|e| StorageError::Corruption(format!("{} block: snappy: {}", what, e))),
        None => Err(StorageError::Corruption(format!(
            "{} block has unknown compression {}",
            what, type_byte
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_roundtrip_and_bad_magic() {
        let footer = Footer {
            filter: BlockHandle { offset: 4096, size: 100 },
            properties: BlockHandle { offset: 4201, size: 80 },
            index: BlockHandle { offset: 4286, size: 64 },
        };
        let mut encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&encoded).unwrap(), footer);

        encoded[FOOTER_SIZE - 1] ^= 0xFF;
        assert!(Footer::decode(&encoded).unwrap_err().is_corruption());
        assert!(Footer::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn sealed_block_detects_bit_flips() {
        let raw = vec![7u8; 1000];
        let mut sealed = seal_block(&raw, CompressionType::Snappy).unwrap();
        assert!(sealed.len() < raw.len());
        assert_eq!(open_block(&sealed, "data").unwrap(), raw);

        sealed[3] ^= 0x01;
        assert!(open_block(&sealed, "data").unwrap_err().is_corruption());
    }

    #[test]
    fn incompressible_block_is_stored_raw() {
        let raw: Vec<u8> = (0..64u8).collect();
        let sealed = seal_block(&raw, CompressionType::Snappy).unwrap();
        assert_eq!(sealed[raw.len()], CompressionType::None as u8);
        assert_eq!(open_block(&sealed, "data").unwrap(), raw);
    }
}
