// Shared-memory chunk pool

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use memmap2::MmapMut;

use crate::common::error::{Error, Result};

/// One slot of the shared arena, identified by its byte range. Slot
/// descriptors (not pointers) are what crosses the worker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedMemorySegment {
    pub offset: u64,
    pub end: u64,
}

impl SharedMemorySegment {
    pub fn size(&self) -> u64 {
        self.end - self.offset
    }
}

/// Fixed arena carved into equal slots sized to the biggest chunk.
///
/// The arena is a plain file under the cache directory mapped into this
/// process; out-of-process workers open the same file by path and address
/// slots via their offsets. A slot is free, assigned to a download,
/// resident, then freed again when the writer reports the release flag.
pub struct ChunkPool {
    path: PathBuf,
    _map: MmapMut,
    slot_size: u64,
    slot_count: usize,
    free: Mutex<VecDeque<SharedMemorySegment>>,
    available: Condvar,
}

impl ChunkPool {
    /// Create the arena file and partition it.
    pub fn create(cache_dir: &Path, arena_size: u64, slot_size: u64) -> Result<Self> {
        if slot_size == 0 || arena_size < slot_size {
            return Err(Error::InsufficientSharedMemory {
                required: slot_size,
                available: arena_size,
                suggested_mib: (slot_size / 1024 / 1024).max(1) + 32,
            });
        }

        fs::create_dir_all(cache_dir)?;
        let path = cache_dir.join("chunks.arena");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(arena_size)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let slot_count = (arena_size / slot_size) as usize;
        let free: VecDeque<SharedMemorySegment> = (0..slot_count as u64)
            .map(|i| SharedMemorySegment {
                offset: i * slot_size,
                end: (i + 1) * slot_size,
            })
            .collect();
        log::debug!(
            "Created {} shared memory segments of {} bytes in {}",
            slot_count,
            slot_size,
            path.display()
        );

        Ok(Self {
            path,
            _map: map,
            slot_size,
            slot_count,
            free: Mutex::new(free),
            available: Condvar::new(),
        })
    }

    /// Path of the backing file, for workers to open.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Pop a free slot without waiting.
    pub fn try_acquire(&self) -> Option<SharedMemorySegment> {
        self.free.lock().unwrap().pop_front()
    }

    /// Pop a free slot, waiting up to `timeout` for one to be released.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<SharedMemorySegment> {
        let mut free = self.free.lock().unwrap();
        if let Some(slot) = free.pop_front() {
            return Some(slot);
        }
        let (mut free, _) = self.available.wait_timeout(free, timeout).unwrap();
        free.pop_front()
    }

    /// Return a slot to the pool and wake one waiter.
    pub fn release(&self, slot: SharedMemorySegment) {
        self.free.lock().unwrap().push_front(slot);
        self.available.notify_one();
    }

    /// Wake all waiters, used on cancellation.
    pub fn notify_all(&self) {
        self.available.notify_all();
    }

    /// Remove the backing file; called once the run is over.
    pub fn destroy(self) -> Result<()> {
        drop(self._map);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pool_partitioning() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = ChunkPool::create(dir.path(), 4 * 1024 * 1024, 1024 * 1024).unwrap();
        assert_eq!(pool.slot_count(), 4);
        assert_eq!(pool.available(), 4);
        assert!(pool.path().exists());

        let slot = pool.try_acquire().unwrap();
        assert_eq!(slot.offset, 0);
        assert_eq!(slot.size(), 1024 * 1024);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_pool_rounds_down_to_whole_slots() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = ChunkPool::create(dir.path(), 2_500_000, 1_000_000).unwrap();
        assert_eq!(pool.slot_count(), 2);
    }

    #[test]
    fn test_pool_rejects_undersized_arena() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = ChunkPool::create(dir.path(), 1024, 4096);
        assert!(matches!(
            result,
            Err(Error::InsufficientSharedMemory { .. })
        ));
    }

    #[test]
    fn test_acquire_timeout_empty_pool() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = ChunkPool::create(dir.path(), 1024, 1024).unwrap();
        let slot = pool.try_acquire().unwrap();
        assert!(pool
            .acquire_timeout(Duration::from_millis(50))
            .is_none());
        pool.release(slot);
        assert!(pool.acquire_timeout(Duration::from_millis(50)).is_some());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = Arc::new(ChunkPool::create(dir.path(), 1024, 1024).unwrap());
        let slot = pool.try_acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(slot);
        assert!(waiter.join().unwrap().is_some());
    }

    #[test]
    fn test_destroy_removes_backing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = ChunkPool::create(dir.path(), 1024, 1024).unwrap();
        let path = pool.path().to_path_buf();
        pool.destroy().unwrap();
        assert!(!path.exists());
    }
}
