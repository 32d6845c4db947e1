use std::sync::{Arc, Mutex, MutexGuard};

use crate::disk::Storage;
use crate::error::{Error, Result};

/// Storage kept in memory. Clones share the same bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStorage {
    /// Zeroed storage of `length` bytes.
    pub fn new(length: usize) -> Self {
        Self::from_bytes(vec![0; length])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// Copy of the current content.
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_range(total: usize, offset: u64, length: usize) -> Result<std::ops::Range<usize>> {
        let end = offset + length as u64;
        if end > total as u64 {
            return Err(Error::OutOfBounds {
                offset,
                length: length as u64,
                total: total as u64,
            });
        }
        Ok(offset as usize..end as usize)
    }
}

impl Storage for MemoryStorage {
    fn total_length(&self) -> u64 {
        self.lock().len() as u64
    }

    fn read_block(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let data = self.lock();
        let range = Self::check_range(data.len(), offset, length)?;
        Ok(data[range].to_vec())
    }

    fn write_block(&mut self, offset: u64, block: &[u8]) -> Result<()> {
        let mut data = self.lock();
        let range = Self::check_range(data.len(), offset, block.len())?;
        data[range].copy_from_slice(block);
        Ok(())
    }
}
