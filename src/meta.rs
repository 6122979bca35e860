//! The meta page: the root-of-roots stored at pgid 0 and 1.
//!
//! Checksum uses FNV-1a-64 over the meta body preceding the checksum field,
//! rather than odysa-roltdb's CRC32. The `fnv` dependency is already in
//! Cargo.toml (declared there, unused); this is where it earns its keep.

use fnv::FnvHasher;
use std::hash::Hasher;

use crate::error::{Error, Result};
use crate::page::{self, flags, BucketHeader, PageId, PAGE_HEADER_SIZE};

pub const MAGIC: u32 = 0xED0CDAED;
pub const VERSION: u32 = 2;

/// Size of the meta body the checksum covers (magic through txid).
const META_BODY_SIZE: usize = 56;
const META_SIZE: usize = META_BODY_SIZE + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    pub root: BucketHeader,
    pub freelist: PageId,
    pub pgid: PageId,
    pub txid: u64,
    pub checksum: u64,
}

impl Meta {
    pub fn new(page_size: u32) -> Self {
        Meta {
            magic: MAGIC,
            version: VERSION,
            page_size,
            flags: 0,
            root: BucketHeader { root: 0, sequence: 0 },
            freelist: 0,
            pgid: 0,
            txid: 0,
            checksum: 0,
        }
    }

    /// Reads a meta page at `id` (0 or 1) out of `buf`, which must contain at
    /// least a full page header plus meta body starting at offset 16.
    pub fn decode(id: PageId, buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE + META_SIZE {
            return Err(Error::Corruption("meta page truncated".into()));
        }
        let page_flags = page::read_u16(buf, 8);
        if page_flags & flags::META == 0 {
            return Err(Error::Corruption(format!(
                "page {id} has flags {page_flags:#x}, expected meta"
            )));
        }
        let body = &buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE];
        Ok(Meta {
            magic: page::read_u32(body, 0),
            version: page::read_u32(body, 4),
            page_size: page::read_u32(body, 8),
            flags: page::read_u32(body, 12),
            root: BucketHeader {
                root: page::read_u64(body, 16),
                sequence: page::read_u64(body, 24),
            },
            freelist: page::read_u64(body, 32),
            pgid: page::read_u64(body, 40),
            txid: page::read_u64(body, 48),
            checksum: page::read_u64(body, 56),
        })
    }

    /// Validates magic, then version, then checksum, in that order, so a
    /// malformed file reports the first inapplicable check.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Invalid);
        }
        if self.version != VERSION {
            return Err(Error::VersionMismatch);
        }
        if self.checksum != self.compute_checksum() {
            return Err(Error::Checksum);
        }
        Ok(())
    }

    pub fn compute_checksum(&self) -> u64 {
        let mut body = [0u8; META_BODY_SIZE];
        self.write_body(&mut body);
        let mut hasher = FnvHasher::default();
        hasher.write(&body);
        hasher.finish()
    }

    fn write_body(&self, body: &mut [u8; META_BODY_SIZE]) {
        page::write_u32(body, 0, self.magic);
        page::write_u32(body, 4, self.version);
        page::write_u32(body, 8, self.page_size);
        page::write_u32(body, 12, self.flags);
        page::write_u64(body, 16, self.root.root);
        page::write_u64(body, 24, self.root.sequence);
        page::write_u64(body, 32, self.freelist);
        page::write_u64(body, 40, self.pgid);
        page::write_u64(body, 48, self.txid);
    }

    /// Encodes this meta (with a freshly computed checksum) as a full page
    /// of `page_size` bytes at pgid `id`.
    pub fn encode(&self, id: PageId, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size.max(PAGE_HEADER_SIZE + META_SIZE)];
        page::write_header(&mut buf, id, flags::META, 0, 0);
        let body = &mut buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE];
        let mut fixed = [0u8; META_BODY_SIZE];
        self.write_body(&mut fixed);
        body[..META_BODY_SIZE].copy_from_slice(&fixed);
        page::write_u64(body, META_BODY_SIZE, self.compute_checksum());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut m = Meta::new(4096);
        m.root = BucketHeader { root: 3, sequence: 7 };
        m.freelist = 2;
        m.pgid = 4;
        m.txid = 1;
        m.checksum = m.compute_checksum();

        let buf = m.encode(0, 4096);
        let decoded = Meta::decode(0, &buf).unwrap();
        assert_eq!(decoded, m);
        decoded.validate().unwrap();
    }

    #[test]
    fn bad_magic_reported_first() {
        let mut m = Meta::new(4096);
        m.magic = 0xDEADBEEF;
        m.version = 999;
        m.checksum = 0;
        assert!(matches!(m.validate(), Err(Error::Invalid)));
    }

    #[test]
    fn bad_version_after_good_magic() {
        let mut m = Meta::new(4096);
        m.version = 999;
        assert!(matches!(m.validate(), Err(Error::VersionMismatch)));
    }

    #[test]
    fn bad_checksum_after_good_version() {
        let mut m = Meta::new(4096);
        m.checksum = 12345;
        assert!(matches!(m.validate(), Err(Error::Checksum)));
    }
}
