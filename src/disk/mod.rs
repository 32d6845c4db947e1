//! Persistent storage of the torrent's bytes.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task;

use crate::error::Result;

pub mod file;
pub mod memory;

pub use file::{FileEntry, FileStorage, FileWindow};
pub use memory::MemoryStorage;

/// Random access to the torrent's bytes addressed by their offset inside the
/// whole torrent.
///
/// Implementations are blocking and are driven from a dedicated task.
pub trait Storage: Send + 'static {
    /// Total number of bytes of the torrent.
    fn total_length(&self) -> u64;

    /// Reads `length` bytes starting at `offset`.
    fn read_block(&mut self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Writes `data` starting at `offset`.
    fn write_block(&mut self, offset: u64, data: &[u8]) -> Result<()>;
}

/// A verified piece waiting to be written.
#[derive(Debug)]
pub struct WriteRequest {
    pub index: u32,
    pub offset: u64,
    pub data: Bytes,
}

/// Outcome of a [`WriteRequest`].
#[derive(Debug)]
pub struct WriteResult {
    pub index: u32,
    pub result: Result<()>,
}

/// Writes every request to `storage` until the request queue is dropped,
/// reporting each outcome on `results`.
pub(crate) async fn write_loop<S: Storage>(
    mut storage: S,
    mut requests: mpsc::Receiver<WriteRequest>,
    results: mpsc::Sender<WriteResult>,
) {
    while let Some(WriteRequest {
        index,
        offset,
        data,
    }) = requests.recv().await
    {
        let joined = task::spawn_blocking(move || {
            let result = storage.write_block(offset, &data);
            (storage, result)
        })
        .await;
        let (returned, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                error!("Storage writer died while writing piece {}: {}", index, err);
                return;
            }
        };
        storage = returned;

        match &result {
            Ok(()) => trace!("Wrote piece {} at offset {}", index, offset),
            Err(err) => warn!("Failed to write piece {}: {}", index, err),
        }
        // nobody listens anymore once the swarm is torn down
        let _ = results.send(WriteResult { index, result }).await;
    }
}
