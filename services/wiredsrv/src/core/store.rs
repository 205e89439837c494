//! Block-addressed configuration memory of one peer
//!
//! The device's EEPROM is mirrored in 16-byte blocks fetched on first use.
//! Reads and writes take right-aligned raw values plus a bit address; the
//! store does the shifting and the read-modify-write of shared bytes, also
//! when a field crosses a block boundary. Writes only mark blocks dirty;
//! flushing is left to the caller so several parameters go out in one round.

use async_trait::async_trait;
use device_model::bits::{self, BitAddress, BitSize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use crate::error::{Result, WiredError};

pub const BLOCK_SIZE: u32 = 16;

/// Where blocks come from and go back to
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn fetch_block(&self, address: u32) -> Result<Vec<u8>>;

    async fn store_block(&self, address: u32, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationBlock {
    pub address: u32,
    pub data: Vec<u8>,
    pub dirty: bool,
    /// Row id once persisted
    pub storage_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ConfigBlockStore {
    eep_size: u32,
    blocks: BTreeMap<u32, ConfigurationBlock>,
}

pub fn block_of(byte: u32) -> u32 {
    byte / BLOCK_SIZE * BLOCK_SIZE
}

impl ConfigBlockStore {
    pub fn new(eep_size: u32) -> Self {
        Self {
            eep_size,
            blocks: BTreeMap::new(),
        }
    }

    pub fn eep_size(&self) -> u32 {
        self.eep_size
    }

    pub fn block(&self, address: u32) -> Option<&ConfigurationBlock> {
        self.blocks.get(&address)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &ConfigurationBlock> {
        self.blocks.values()
    }

    pub fn is_cached(&self, address: u32) -> bool {
        self.blocks.contains_key(&block_of(address))
    }

    /// Seed the cache, e.g. from persistence. A dirty block stays pending
    /// until the next flush.
    pub fn insert_block(&mut self, block: ConfigurationBlock) -> Result<()> {
        if block.address % BLOCK_SIZE != 0 || block.data.len() != BLOCK_SIZE as usize {
            return Err(WiredError::AddressOutOfRange {
                address: format!("0x{:04X}", block.address),
                size: format!("{} bytes", block.data.len()),
            });
        }
        self.check_range(block.address, BLOCK_SIZE)?;
        self.blocks.insert(block.address, block);
        Ok(())
    }

    /// Forget cached contents so they are fetched again
    pub fn invalidate(&mut self) {
        self.blocks.clear();
    }

    fn check_range(&self, start: u32, len: u32) -> Result<()> {
        if start.saturating_add(len) > self.eep_size {
            return Err(WiredError::AddressOutOfRange {
                address: format!("0x{:04X}", start),
                size: format!("{} bytes", len),
            });
        }
        Ok(())
    }

    /// First and last block a field touches
    fn block_range(&self, address: BitAddress, size: BitSize) -> Result<(u32, u32, usize)> {
        let span = bits::field_span(address, size)?;
        if address.byte.saturating_add(span as u32) > self.eep_size {
            debug!("Field {} size {} beyond {} bytes of EEPROM", address, size, self.eep_size);
            return Err(WiredError::AddressOutOfRange {
                address: address.to_string(),
                size: size.to_string(),
            });
        }
        let first = block_of(address.byte);
        let last = block_of(address.byte + span as u32 - 1);
        Ok((first, last, span))
    }

    async fn ensure_blocks(&mut self, first: u32, last: u32, source: &dyn BlockSource) -> Result<()> {
        let mut block = first;
        while block <= last {
            if !self.blocks.contains_key(&block) {
                let data = source.fetch_block(block).await?;
                if data.len() != BLOCK_SIZE as usize {
                    return Err(WiredError::MalformedResponse {
                        address: block,
                        reason: format!("block of {} bytes", data.len()),
                    });
                }
                debug!("Fetched configuration block 0x{:04X}", block);
                self.blocks.insert(
                    block,
                    ConfigurationBlock {
                        address: block,
                        data,
                        dirty: false,
                        storage_id: None,
                    },
                );
            }
            block += BLOCK_SIZE;
        }
        Ok(())
    }

    fn assemble(&self, first: u32, last: u32) -> Vec<u8> {
        self.blocks
            .range(first..=last)
            .flat_map(|(_, b)| b.data.iter().copied())
            .collect()
    }

    /// Read a field as right-aligned big-endian bytes, fetching blocks as needed
    pub async fn read(
        &mut self,
        address: BitAddress,
        size: BitSize,
        mask: Option<u32>,
        source: &dyn BlockSource,
    ) -> Result<Vec<u8>> {
        let (first, last, _) = self.block_range(address, size)?;
        self.ensure_blocks(first, last, source).await?;
        let span = self.assemble(first, last);
        let relative = BitAddress::new(address.byte - first, address.bit);
        let value = bits::read_field(&span, relative, size, mask)?;
        trace!("Read {} size {} -> {:02X?}", address, size, value);
        Ok(value)
    }

    /// Write a right-aligned value into a field.
    ///
    /// Returns every block the field touches. Blocks whose bytes changed are
    /// marked dirty.
    pub async fn write(
        &mut self,
        address: BitAddress,
        size: BitSize,
        value: &[u8],
        source: &dyn BlockSource,
    ) -> Result<BTreeSet<u32>> {
        let (first, last, _) = self.block_range(address, size)?;
        self.ensure_blocks(first, last, source).await?;

        let mut span = self.assemble(first, last);
        let relative = BitAddress::new(address.byte - first, address.bit);
        bits::write_field(&mut span, relative, size, value)?;

        let mut touched = BTreeSet::new();
        for (chunk, block) in span
            .chunks(BLOCK_SIZE as usize)
            .zip(self.blocks.range_mut(first..=last).map(|(_, b)| b))
        {
            if block.data != chunk {
                block.data.copy_from_slice(chunk);
                block.dirty = true;
            }
            touched.insert(block.address);
        }
        trace!("Wrote {} size {} <- {:02X?}", address, size, value);
        Ok(touched)
    }

    pub fn dirty_blocks(&self) -> BTreeSet<u32> {
        self.blocks
            .values()
            .filter(|b| b.dirty)
            .map(|b| b.address)
            .collect()
    }

    /// Clear and return the dirty set
    pub fn take_dirty(&mut self) -> BTreeSet<u32> {
        let dirty = self.dirty_blocks();
        for address in &dirty {
            if let Some(block) = self.blocks.get_mut(address) {
                block.dirty = false;
            }
        }
        dirty
    }

    /// Write the given dirty blocks back. Stops at the first failure; blocks
    /// not written stay dirty.
    pub async fn flush_blocks(&mut self, blocks: &BTreeSet<u32>, sink: &dyn BlockSource) -> Result<usize> {
        let mut written = 0;
        for address in blocks {
            let Some(block) = self.blocks.get_mut(address) else {
                continue;
            };
            if !block.dirty {
                continue;
            }
            sink.store_block(block.address, &block.data).await?;
            block.dirty = false;
            written += 1;
        }
        if written > 0 {
            debug!("Flushed {} configuration blocks", written);
        }
        Ok(written)
    }

    /// Write every dirty block back
    pub async fn flush(&mut self, sink: &dyn BlockSource) -> Result<usize> {
        let dirty = self.dirty_blocks();
        self.flush_blocks(&dirty, sink).await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// EEPROM image standing in for a device
    struct MemorySource {
        eeprom: Mutex<Vec<u8>>,
        fetches: AtomicUsize,
        stores: AtomicUsize,
        fail: bool,
    }

    impl MemorySource {
        fn new(size: usize) -> Self {
            Self {
                eeprom: Mutex::new((0..size).map(|i| i as u8).collect()),
                fetches: AtomicUsize::new(0),
                stores: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl BlockSource for MemorySource {
        async fn fetch_block(&self, address: u32) -> Result<Vec<u8>> {
            if self.fail {
                return Err(WiredError::Unreachable { address: 0x42 });
            }
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let start = address as usize;
            Ok(self.eeprom.lock()[start..start + 16].to_vec())
        }

        async fn store_block(&self, address: u32, data: &[u8]) -> Result<()> {
            if self.fail {
                return Err(WiredError::Unreachable { address: 0x42 });
            }
            self.stores.fetch_add(1, Ordering::SeqCst);
            let start = address as usize;
            self.eeprom.lock()[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    fn cached(address: u32, data: Vec<u8>, dirty: bool) -> ConfigurationBlock {
        ConfigurationBlock {
            address,
            data,
            dirty,
            storage_id: Some(3),
        }
    }

    #[tokio::test]
    async fn test_blocks_are_fetched_once() {
        let source = MemorySource::new(256);
        let mut store = ConfigBlockStore::new(256);

        let a = store
            .read(BitAddress::new(0x21, 0), BitSize::ONE_BYTE, None, &source)
            .await
            .unwrap();
        let b = store
            .read(BitAddress::new(0x2F, 0), BitSize::ONE_BYTE, None, &source)
            .await
            .unwrap();
        assert_eq!(a, vec![0x21]);
        assert_eq!(b, vec![0x2F]);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert!(store.is_cached(0x20));
        assert!(!store.is_cached(0x30));
    }

    #[tokio::test]
    async fn test_write_across_block_boundary() {
        let source = MemorySource::new(256);
        let mut store = ConfigBlockStore::new(256);

        let touched = store
            .write(BitAddress::new(0x0F, 0), BitSize::new(2, 0), &[0x12, 0x34], &source)
            .await
            .unwrap();
        assert_eq!(touched, BTreeSet::from([0x00, 0x10]));
        assert_eq!(store.dirty_blocks(), BTreeSet::from([0x00, 0x10]));

        let back = store
            .read(BitAddress::new(0x0F, 0), BitSize::new(2, 0), None, &source)
            .await
            .unwrap();
        assert_eq!(back, vec![0x12, 0x34]);
        assert_eq!(store.block(0x00).unwrap().data[14], 0x0E);
        assert_eq!(store.block(0x10).unwrap().data[1], 0x11);

        assert_eq!(store.flush(&source).await.unwrap(), 2);
        assert!(store.dirty_blocks().is_empty());
        let eeprom = source.eeprom.lock().clone();
        assert_eq!(&eeprom[0x0E..0x12], &[0x0E, 0x12, 0x34, 0x11]);
    }

    #[tokio::test]
    async fn test_sub_byte_write_spills_into_next_block() {
        let source = MemorySource::new(64);
        let mut store = ConfigBlockStore::new(64);
        // six bits at 0x1F bit 4: four low bits in 0x1F, two high bits in 0x20
        let touched = store
            .write(BitAddress::new(0x1F, 4), BitSize::new(0, 6), &[0b11_0101], &source)
            .await
            .unwrap();
        assert_eq!(touched, BTreeSet::from([0x10, 0x20]));
        assert_eq!(store.block(0x10).unwrap().data[15], (0x1F & 0x0F) | 0b0101_0000);
        assert_eq!(store.block(0x20).unwrap().data[0], (0x20 & !0x03) | 0b11);

        let back = store
            .read(BitAddress::new(0x1F, 4), BitSize::new(0, 6), None, &source)
            .await
            .unwrap();
        assert_eq!(back, vec![0b11_0101]);
    }

    #[tokio::test]
    async fn test_unchanged_write_is_not_dirty() {
        let source = MemorySource::new(64);
        let mut store = ConfigBlockStore::new(64);
        let touched = store
            .write(BitAddress::new(0x05, 0), BitSize::ONE_BYTE, &[0x05], &source)
            .await
            .unwrap();
        assert_eq!(touched, BTreeSet::from([0x00]));
        assert!(store.dirty_blocks().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_is_an_error() {
        let source = MemorySource::new(64);
        let mut store = ConfigBlockStore::new(64);
        let err = store
            .read(BitAddress::new(0x3F, 0), BitSize::new(2, 0), None, &source)
            .await
            .unwrap_err();
        assert!(matches!(err, WiredError::AddressOutOfRange { .. }));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);

        assert!(store.insert_block(cached(0x40, vec![0; 16], false)).is_err());
        assert!(store.insert_block(cached(0x08, vec![0; 16], false)).is_err());
    }

    #[tokio::test]
    async fn test_masked_read() {
        let source = MemorySource::new(64);
        let mut store = ConfigBlockStore::new(64);
        store.insert_block(cached(0x00, vec![0xAB; 16], false)).unwrap();
        let value = store
            .read(BitAddress::new(0x02, 0), BitSize::new(2, 0), Some(0x0FF0), &source)
            .await
            .unwrap();
        assert_eq!(value, vec![0x0B, 0xA0]);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_blocks_dirty() {
        let mut source = MemorySource::new(64);
        let mut store = ConfigBlockStore::new(64);
        store
            .write(BitAddress::new(0x01, 0), BitSize::ONE_BYTE, &[0xEE], &source)
            .await
            .unwrap();
        source.fail = true;
        assert!(store.flush(&source).await.is_err());
        assert_eq!(store.dirty_blocks(), BTreeSet::from([0x00]));

        assert_eq!(store.take_dirty(), BTreeSet::from([0x00]));
        assert!(store.dirty_blocks().is_empty());
    }

    #[tokio::test]
    async fn test_seeded_dirty_block_is_flushed() {
        let source = MemorySource::new(64);
        let mut store = ConfigBlockStore::new(64);
        store.insert_block(cached(0x10, vec![0x5A; 16], true)).unwrap();
        store.insert_block(cached(0x20, vec![0x11; 16], false)).unwrap();
        assert_eq!(store.dirty_blocks(), BTreeSet::from([0x10]));

        assert_eq!(store.flush(&source).await.unwrap(), 1);
        assert_eq!(&source.eeprom.lock()[0x10..0x20], &[0x5A; 16]);
        assert_eq!(source.eeprom.lock()[0x20], 0x20);
        assert!(store.dirty_blocks().is_empty());
        assert_eq!(store.block(0x10).unwrap().storage_id, Some(3));
    }
}
