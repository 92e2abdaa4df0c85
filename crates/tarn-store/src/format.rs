//! On-disk layout.
//!
//! ```text
//! [0..8)     magic "TARNSTOR"
//! [8..12)    format version (u32 LE)
//! [12..28)   file id (UUID v7)
//! [28]       active slot selector (0 or 1)
//! [32..64)   top slot 0
//! [64..96)   top slot 1
//! [96..128)  reserved
//! [128..)    framed blocks
//! ```
//!
//! A top slot names the committed version and the catalog block describing
//! it. Commits write the inactive slot and then flip the selector byte, so a
//! torn write can only ever damage the slot nobody is using.
//!
//! Blocks are framed as `[payload len u32 LE][crc32 u32 LE][payload]`, where
//! the payload starts with a one-byte codec tag followed by a bincode body,
//! zstd-compressed when the codec says so.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tarn_types::Version;
use uuid::Uuid;

use crate::config::{Compression, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::file::StoreFile;

pub const MAGIC: [u8; 8] = *b"TARNSTOR";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: u64 = 128;

const SELECTOR_OFFSET: u64 = 28;
const SLOT_OFFSETS: [u64; 2] = [32, 64];
const SLOT_SIZE: usize = 32;
/// Slot bytes covered by the slot CRC.
const SLOT_BODY: usize = 24;

/// Frame header size: payload length + CRC.
pub const FRAME_HEADER: u64 = 8;

const CODEC_RAW: u8 = 0;
const CODEC_ZSTD: u8 = 1;

/// Location and checksum of a framed block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub offset: u64,
    /// Payload length, excluding the frame header.
    pub len: u32,
    pub crc: u32,
}

impl BlockRef {
    /// Bytes the block occupies on disk.
    pub fn extent(&self) -> u64 {
        FRAME_HEADER + self.len as u64
    }
}

/// A serialized, framed block ready to be written at some offset.
pub struct EncodedBlock {
    pub bytes: Vec<u8>,
    pub crc: u32,
}

impl EncodedBlock {
    pub fn encode<T: Serialize>(value: &T, config: &StoreConfig) -> StoreResult<Self> {
        let body = bincode::serialize(value).map_err(StoreError::serialization)?;

        let (codec, body) = match config.compression {
            Compression::Zstd { level } if body.len() >= config.compression_threshold => {
                (CODEC_ZSTD, zstd::encode_all(body.as_slice(), level)?)
            }
            _ => (CODEC_RAW, body),
        };

        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(codec);
        payload.extend_from_slice(&body);
        let crc = crc32fast::hash(&payload);

        let mut bytes = Vec::with_capacity(FRAME_HEADER as usize + payload.len());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(Self { bytes, crc })
    }

    pub fn extent(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The reference this block gets once written at `offset`.
    pub fn at(&self, offset: u64) -> BlockRef {
        BlockRef {
            offset,
            len: (self.bytes.len() as u64 - FRAME_HEADER) as u32,
            crc: self.crc,
        }
    }
}

/// Read, verify and decode the block at `block`.
pub fn read_block<T: DeserializeOwned>(file: &StoreFile, block: BlockRef) -> StoreResult<T> {
    let mut buf = vec![0u8; block.extent() as usize];
    file.read_at(block.offset, &mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            StoreError::Corruption(format!("block at {} runs past end of file", block.offset))
        } else {
            StoreError::Io(e)
        }
    })?;

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let payload = &buf[FRAME_HEADER as usize..];
    if len != block.len || crc != block.crc || crc32fast::hash(payload) != crc {
        return Err(StoreError::Corruption(format!(
            "checksum mismatch for block at {}",
            block.offset
        )));
    }

    let body = match payload.first() {
        Some(&CODEC_RAW) => std::borrow::Cow::Borrowed(&payload[1..]),
        Some(&CODEC_ZSTD) => std::borrow::Cow::Owned(zstd::decode_all(&payload[1..])?),
        _ => {
            return Err(StoreError::Corruption(format!(
                "unknown codec in block at {}",
                block.offset
            )))
        }
    };
    bincode::deserialize(&body).map_err(|e| StoreError::Corruption(e.to_string()))
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The committed root of one version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopSlot {
    pub version: Version,
    pub catalog: BlockRef,
}

impl TopSlot {
    fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        buf[0..8].copy_from_slice(&self.version.value().to_le_bytes());
        buf[8..16].copy_from_slice(&self.catalog.offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.catalog.len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.catalog.crc.to_le_bytes());
        let crc = crc32fast::hash(&buf[..SLOT_BODY]);
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> StoreResult<Self> {
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            u64::from_le_bytes(b)
        };
        let u32_at = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[i..i + 4]);
            u32::from_le_bytes(b)
        };

        if crc32fast::hash(&buf[..SLOT_BODY]) != u32_at(24) {
            return Err(StoreError::Corruption("top slot checksum mismatch".into()));
        }
        Ok(Self {
            version: Version::new(u64_at(0)),
            catalog: BlockRef {
                offset: u64_at(8),
                len: u32_at(16),
                crc: u32_at(20),
            },
        })
    }
}

/// Decoded file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub file_id: Uuid,
    pub active: u8,
    pub top: TopSlot,
}

impl Header {
    /// Write a fresh header with both slots pointing at `top`.
    pub fn create(file: &StoreFile, file_id: Uuid, top: TopSlot) -> StoreResult<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[12..28].copy_from_slice(file_id.as_bytes());
        buf[SELECTOR_OFFSET as usize] = 0;
        let slot = top.encode();
        for offset in SLOT_OFFSETS {
            buf[offset as usize..offset as usize + SLOT_SIZE].copy_from_slice(&slot);
        }
        file.write_at(0, &buf)?;
        Ok(Self {
            file_id,
            active: 0,
            top,
        })
    }

    /// Read and validate the header.
    ///
    /// Files that are too short or carry the wrong magic are reported as
    /// [`StoreError::InvalidFile`]; a damaged active slot is corruption.
    pub fn read(file: &StoreFile, path: &std::path::Path) -> StoreResult<Self> {
        let invalid = |reason: &str| StoreError::InvalidFile {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if file.len()? < HEADER_SIZE {
            return Err(invalid("file too short for header"));
        }
        let mut buf = [0u8; HEADER_SIZE as usize];
        file.read_at(0, &mut buf)?;

        if buf[0..8] != MAGIC {
            return Err(invalid("bad magic"));
        }
        let format = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if format != FORMAT_VERSION {
            return Err(invalid(&format!("unsupported format version {format}")));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[12..28]);

        let active = buf[SELECTOR_OFFSET as usize];
        if active > 1 {
            return Err(StoreError::Corruption(format!("bad slot selector {active}")));
        }
        let offset = SLOT_OFFSETS[active as usize] as usize;
        let top = TopSlot::decode(&buf[offset..offset + SLOT_SIZE])?;

        Ok(Self {
            file_id: Uuid::from_bytes(id),
            active,
            top,
        })
    }

    /// Write `top` into the slot that is not active.
    pub fn write_inactive(&self, file: &StoreFile, top: TopSlot) -> StoreResult<()> {
        let inactive = 1 - self.active;
        file.write_at(SLOT_OFFSETS[inactive as usize], &top.encode())?;
        Ok(())
    }

    /// Flip the selector to the slot written by [`Header::write_inactive`].
    pub fn flip(&self, file: &StoreFile, top: TopSlot) -> StoreResult<Self> {
        let active = 1 - self.active;
        file.write_at(SELECTOR_OFFSET, &[active])?;
        Ok(Self {
            file_id: self.file_id,
            active,
            top,
        })
    }

    /// Put the selector back to this header's slot.
    pub fn restore(&self, file: &StoreFile) -> StoreResult<()> {
        file.write_at(SELECTOR_OFFSET, &[self.active])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(version: u64) -> TopSlot {
        TopSlot {
            version: Version::new(version),
            catalog: BlockRef {
                offset: 128,
                len: 40,
                crc: 0xdead_beef,
            },
        }
    }

    fn scratch() -> (tempfile::TempDir, StoreFile, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.tarn");
        let file = StoreFile::open(&path, false).unwrap();
        (dir, file, path)
    }

    #[test]
    fn header_create_and_read() {
        let (_dir, file, path) = scratch();
        let id = Uuid::now_v7();
        Header::create(&file, id, slot(0)).unwrap();
        let header = Header::read(&file, &path).unwrap();
        assert_eq!(header.file_id, id);
        assert_eq!(header.active, 0);
        assert_eq!(header.top, slot(0));
    }

    #[test]
    fn flip_switches_slot() {
        let (_dir, file, path) = scratch();
        let header = Header::create(&file, Uuid::now_v7(), slot(0)).unwrap();
        header.write_inactive(&file, slot(1)).unwrap();
        // Not visible until the selector flips.
        assert_eq!(Header::read(&file, &path).unwrap().top.version, Version::ZERO);

        let flipped = header.flip(&file, slot(1)).unwrap();
        let reread = Header::read(&file, &path).unwrap();
        assert_eq!(reread, flipped);
        assert_eq!(reread.active, 1);
    }

    #[test]
    fn short_file_is_invalid() {
        let (_dir, file, path) = scratch();
        file.write_at(0, b"TARN").unwrap();
        assert!(matches!(
            Header::read(&file, &path),
            Err(StoreError::InvalidFile { .. })
        ));
    }

    #[test]
    fn bad_magic_is_invalid() {
        let (_dir, file, path) = scratch();
        file.write_at(0, &[7u8; HEADER_SIZE as usize]).unwrap();
        assert!(matches!(
            Header::read(&file, &path),
            Err(StoreError::InvalidFile { .. })
        ));
    }

    #[test]
    fn damaged_slot_is_corruption() {
        let (_dir, file, path) = scratch();
        Header::create(&file, Uuid::now_v7(), slot(3)).unwrap();
        file.write_at(SLOT_OFFSETS[0] + 2, &[0xff]).unwrap();
        assert!(matches!(
            Header::read(&file, &path),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn block_roundtrip_with_compression() {
        let (_dir, file, _path) = scratch();
        let config = StoreConfig {
            compression: Compression::Zstd { level: 3 },
            compression_threshold: 16,
            ..StoreConfig::ephemeral()
        };
        let value: Vec<String> = (0..200).map(|i| format!("row-{}", i % 7)).collect();
        let block = EncodedBlock::encode(&value, &config).unwrap();
        file.write_at(HEADER_SIZE, &block.bytes).unwrap();

        let decoded: Vec<String> = read_block(&file, block.at(HEADER_SIZE)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn flipped_byte_in_block_is_corruption() {
        let (_dir, file, _path) = scratch();
        let block = EncodedBlock::encode(&vec![1u64, 2, 3], &StoreConfig::ephemeral()).unwrap();
        file.write_at(HEADER_SIZE, &block.bytes).unwrap();
        file.write_at(HEADER_SIZE + FRAME_HEADER + 2, &[0xaa]).unwrap();
        assert!(matches!(
            read_block::<Vec<u64>>(&file, block.at(HEADER_SIZE)),
            Err(StoreError::Corruption(_))
        ));
    }
}
