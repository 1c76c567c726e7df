//! Transfer bookkeeping for both directions.

use super::packets::{FileChunk, FileRequest, TransferId, MAX_CHUNK_PAYLOAD};
use super::TransferError;
use crate::runtime::{MemoryPoolManager, Session};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

/// Default payload size per chunk (4KB).
pub const DEFAULT_CHUNK_SIZE: u32 = 4 * 1024;

/// Pause between consecutive chunks of one transfer.
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(10);

/// Called once per transfer with its local id, outcome and file path.
pub type TransferCompleteCallback = Arc<dyn Fn(TransferId, bool, &Path) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// Whether a transfer needs more chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    More,
    Done,
}

/// Snapshot of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub direction: TransferDirection,
    pub path: PathBuf,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub chunk_size: u32,
    pub chunks_total: u32,
    pub chunks_completed: u32,
    pub completed: bool,
    /// Sender's id for a receiving transfer.
    pub peer_id: Option<TransferId>,
}

struct FileTransferContext {
    direction: TransferDirection,
    path: PathBuf,
    /// Open while the transfer is in progress.
    file: Option<File>,
    file_size: u64,
    bytes_transferred: u64,
    chunk_size: u32,
    chunks_total: u32,
    chunks_completed: u32,
    completed: bool,
    peer_id: Option<TransferId>,
}

impl FileTransferContext {
    fn progress(&self) -> TransferProgress {
        TransferProgress {
            direction: self.direction,
            path: self.path.clone(),
            file_size: self.file_size,
            bytes_transferred: self.bytes_transferred,
            chunk_size: self.chunk_size,
            chunks_total: self.chunks_total,
            chunks_completed: self.chunks_completed,
            completed: self.completed,
            peer_id: self.peer_id,
        }
    }

    fn finish(&mut self) {
        self.completed = true;
        self.file = None;
    }

    fn closed_file(&self) -> TransferError {
        TransferError::io(
            &self.path,
            io::Error::new(io::ErrorKind::NotFound, "transfer file is closed"),
        )
    }

    /// Read the next slice and send it as one chunk frame.
    fn send_chunk(
        &mut self,
        id: TransferId,
        session: &Arc<Session>,
        memory: &MemoryPoolManager,
    ) -> Result<ChunkProgress, TransferError> {
        let remaining = self.file_size - self.bytes_transferred;
        if remaining == 0 {
            return Ok(ChunkProgress::Done);
        }

        let len = remaining
            .min(self.chunk_size as u64)
            .min(MAX_CHUNK_PAYLOAD as u64) as usize;
        let is_last = remaining == len as u64;

        let offset = self.bytes_transferred;
        let Some(file) = self.file.as_mut() else {
            return Err(self.closed_file());
        };

        let mut block = memory.allocate(len);
        if let Err(e) = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(block.as_mut_slice()))
        {
            memory.release(block);
            return Err(TransferError::io(&self.path, e));
        }

        let chunk = FileChunk {
            transfer_id: id,
            chunk_id: self.chunks_completed,
            chunk_size: len as u32,
            is_last,
        };
        let frame = {
            let mut cx = session.send_buffers().context();
            chunk.encode(&mut cx, block.as_slice())
        };
        memory.release(block);

        session.send(frame.ok_or(TransferError::SendBufferUnavailable)?);
        self.bytes_transferred += len as u64;
        self.chunks_completed += 1;

        trace!(
            transfer = id,
            chunk = chunk.chunk_id,
            len,
            sent = self.bytes_transferred,
            total = self.file_size,
            "Chunk sent"
        );

        Ok(if is_last {
            ChunkProgress::Done
        } else {
            ChunkProgress::More
        })
    }

    /// Write one received chunk at its offset.
    fn write_chunk(
        &mut self,
        chunk: &FileChunk,
        payload: &[u8],
    ) -> Result<ChunkProgress, TransferError> {
        let len = payload.len() as u64;
        let offset = chunk.chunk_id as u64 * self.chunk_size as u64;
        if len != chunk.chunk_size as u64
            || chunk.chunk_id >= self.chunks_total
            || offset + len > self.file_size
        {
            return Err(TransferError::ChunkOutOfRange {
                transfer_id: chunk.transfer_id,
                chunk_id: chunk.chunk_id,
            });
        }

        let Some(file) = self.file.as_mut() else {
            return Err(self.closed_file());
        };
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(payload))
            .map_err(|e| TransferError::io(&self.path, e))?;

        self.bytes_transferred += len;
        self.chunks_completed += 1;

        let done = chunk.is_last
            || self.chunks_completed >= self.chunks_total
            || self.bytes_transferred >= self.file_size;
        Ok(if done {
            ChunkProgress::Done
        } else {
            ChunkProgress::More
        })
    }
}

/// Tracks every in-flight transfer of one connection.
pub struct FileTransferManager {
    transfers: Mutex<BTreeMap<TransferId, FileTransferContext>>,
    next_id: AtomicU32,
    on_complete: RwLock<Option<TransferCompleteCallback>>,
    memory: Arc<MemoryPoolManager>,
    chunk_delay: Duration,
}

impl FileTransferManager {
    pub fn new(memory: Arc<MemoryPoolManager>) -> Arc<Self> {
        Self::with_chunk_delay(memory, DEFAULT_CHUNK_DELAY)
    }

    pub fn with_chunk_delay(memory: Arc<MemoryPoolManager>, chunk_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            transfers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            on_complete: RwLock::new(None),
            memory,
            chunk_delay,
        })
    }

    /// Register the completion callback, replacing any previous one.
    pub fn set_transfer_complete_callback<F>(&self, callback: F)
    where
        F: Fn(TransferId, bool, &Path) + Send + Sync + 'static,
    {
        *self.on_complete.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TransferId, FileTransferContext>> {
        self.transfers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn callback(&self) -> Option<TransferCompleteCallback> {
        self.on_complete
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fire the callback. Never called with the transfer lock held.
    fn notify(&self, id: TransferId, success: bool, path: &Path) {
        if let Some(callback) = self.callback() {
            callback(id, success, path);
        }
    }

    /// Announce `path` to the peer and register a sending transfer.
    ///
    /// Chunks are not sent until [`send_next_chunk`](Self::send_next_chunk)
    /// is called.
    pub fn start_file_send(
        &self,
        session: &Arc<Session>,
        path: &Path,
        chunk_size: u32,
    ) -> Result<TransferId, TransferError> {
        let metadata = fs::metadata(path).map_err(|e| TransferError::io(path, e))?;
        if !metadata.is_file() {
            return Err(TransferError::NotAFile(path.to_path_buf()));
        }
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidFileName(path.display().to_string()))?;

        let file = File::open(path).map_err(|e| TransferError::io(path, e))?;
        let file_size = metadata.len();
        let chunk_size = effective_chunk_size(chunk_size);
        let chunks_total = chunk_count(file_size, chunk_size)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = FileRequest {
            filename,
            file_size,
            chunks_total,
            chunk_size,
            transfer_id: id,
        };
        let frame = {
            let mut cx = session.send_buffers().context();
            request.encode(&mut cx)
        }
        .ok_or(TransferError::SendBufferUnavailable)?;

        self.lock().insert(
            id,
            FileTransferContext {
                direction: TransferDirection::Sending,
                path: path.to_path_buf(),
                file: Some(file),
                file_size,
                bytes_transferred: 0,
                chunk_size,
                chunks_total,
                chunks_completed: 0,
                completed: false,
                peer_id: None,
            },
        );
        session.send(frame);

        info!(
            transfer = id,
            session = session.id(),
            path = %path.display(),
            size = file_size,
            chunks = chunks_total,
            "File send started"
        );
        Ok(id)
    }

    /// Prepare the destination file for an announced transfer.
    ///
    /// An existing file with the same name is renamed to `<name>.bak`
    /// first. An empty file completes immediately.
    pub fn start_file_receive(
        &self,
        target_dir: &Path,
        request: &FileRequest,
    ) -> Result<TransferId, TransferError> {
        let filename = sanitize_file_name(&request.filename)?;
        if request.chunk_size == 0 {
            return Err(TransferError::InvalidRequest("zero chunk size".into()));
        }
        let expected = chunk_count(request.file_size, request.chunk_size)?;
        if expected != request.chunks_total {
            return Err(TransferError::InvalidRequest(format!(
                "{} chunks announced, {expected} expected",
                request.chunks_total
            )));
        }

        fs::create_dir_all(target_dir).map_err(|e| TransferError::io(target_dir, e))?;
        let path = target_dir.join(&filename);
        if path.exists() {
            backup_existing(&path, &filename);
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| TransferError::io(&path, e))?;
        file.set_len(request.file_size)
            .map_err(|e| TransferError::io(&path, e))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let completed = request.file_size == 0;
        self.lock().insert(
            id,
            FileTransferContext {
                direction: TransferDirection::Receiving,
                path: path.clone(),
                file: (!completed).then_some(file),
                file_size: request.file_size,
                bytes_transferred: 0,
                chunk_size: request.chunk_size,
                chunks_total: request.chunks_total,
                chunks_completed: 0,
                completed,
                peer_id: Some(request.transfer_id),
            },
        );

        info!(
            transfer = id,
            peer_transfer = request.transfer_id,
            path = %path.display(),
            size = request.file_size,
            chunks = request.chunks_total,
            "File receive started"
        );

        if completed {
            self.notify(id, true, &path);
        }
        Ok(id)
    }

    /// Store one received chunk.
    ///
    /// The transfer is looked up by the sender's id carried on the chunk.
    pub fn process_file_chunk(
        &self,
        chunk: &FileChunk,
        payload: &[u8],
    ) -> Result<ChunkProgress, TransferError> {
        let mut transfers = self.lock();
        let Some((&id, context)) = transfers.iter_mut().rev().find(|(_, c)| {
            c.direction == TransferDirection::Receiving
                && c.peer_id == Some(chunk.transfer_id)
                && !c.completed
        }) else {
            return Err(TransferError::UnknownTransfer(chunk.transfer_id));
        };

        let outcome = context.write_chunk(chunk, payload);
        let path = context.path.clone();
        match outcome {
            Ok(ChunkProgress::More) => Ok(ChunkProgress::More),
            Ok(ChunkProgress::Done) => {
                let file = context.file.take();
                context.finish();
                let received = context.bytes_transferred;
                drop(transfers);

                self.finish_receive(id, file, path, received);
                Ok(ChunkProgress::Done)
            }
            Err(e) => {
                transfers.remove(&id);
                drop(transfers);

                warn!(transfer = id, error = %e, "File receive failed");
                self.notify(id, false, &path);
                Err(e)
            }
        }
    }

    /// Sync a completed file to disk, then report it.
    ///
    /// Runs on the blocking pool when called inside the runtime.
    fn finish_receive(&self, id: TransferId, file: Option<File>, path: PathBuf, bytes: u64) {
        let callback = self.callback();
        let finish = move || {
            let synced = match file.map(|file| file.sync_data()) {
                Some(Err(e)) => {
                    warn!(
                        transfer = id,
                        path = %path.display(),
                        error = %e,
                        "Failed to sync received file"
                    );
                    false
                }
                _ => true,
            };
            if synced {
                info!(transfer = id, path = %path.display(), bytes, "File received");
            }
            if let Some(callback) = callback {
                callback(id, synced, &path);
            }
        };

        match Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(finish)),
            Err(_) => finish(),
        }
    }

    /// Start streaming a sending transfer once the peer has accepted it.
    ///
    /// Chunks are read and sent on the blocking pool, one per chunk delay.
    pub fn start_sending(self: &Arc<Self>, session: &Arc<Session>, id: TransferId) {
        self.schedule_next_chunk(session, id, Duration::ZERO);
    }

    /// Send the next chunk of a sending transfer.
    ///
    /// Schedules the following chunk after the chunk delay, or completes
    /// the transfer after the last one.
    pub fn send_next_chunk(
        self: &Arc<Self>,
        session: &Arc<Session>,
        id: TransferId,
    ) -> Result<ChunkProgress, TransferError> {
        let mut transfers = self.lock();
        let Some(context) = transfers.get_mut(&id) else {
            return Err(TransferError::UnknownTransfer(id));
        };
        if context.direction != TransferDirection::Sending {
            return Err(TransferError::WrongDirection(id));
        }
        if context.completed {
            return Ok(ChunkProgress::Done);
        }

        let outcome = if session.is_connected() {
            context.send_chunk(id, session, &self.memory)
        } else {
            Err(TransferError::Disconnected(id))
        };
        let path = context.path.clone();

        match outcome {
            Ok(ChunkProgress::More) => {
                drop(transfers);
                self.schedule_next_chunk(session, id, self.chunk_delay);
                Ok(ChunkProgress::More)
            }
            Ok(ChunkProgress::Done) => {
                context.finish();
                let sent = context.bytes_transferred;
                drop(transfers);

                info!(transfer = id, path = %path.display(), bytes = sent, "File sent");
                self.notify(id, true, &path);
                Ok(ChunkProgress::Done)
            }
            Err(e) => {
                transfers.remove(&id);
                drop(transfers);

                warn!(transfer = id, error = %e, "File send failed");
                self.notify(id, false, &path);
                Err(e)
            }
        }
    }

    fn schedule_next_chunk(
        self: &Arc<Self>,
        session: &Arc<Session>,
        id: TransferId,
        delay: Duration,
    ) {
        let manager = Arc::clone(self);
        let task_session = Arc::clone(session);
        let runtime = session.runtime().clone();

        session.runtime().spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let send = runtime.spawn_blocking(move || manager.send_next_chunk(&task_session, id));
            match send.await {
                Ok(Ok(_)) => {}
                // Failures were already reported by send_next_chunk
                Ok(Err(e)) => debug!(transfer = id, error = %e, "Chunk pacing stopped"),
                Err(e) => warn!(transfer = id, error = %e, "Chunk task failed"),
            }
        });
    }

    /// Drop a transfer and close its file. Returns `false` if unknown.
    pub fn cancel_transfer(&self, id: TransferId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(context) => {
                info!(
                    transfer = id,
                    path = %context.path.display(),
                    transferred = context.bytes_transferred,
                    "Transfer cancelled"
                );
                true
            }
            None => false,
        }
    }

    /// Drop a transfer the peer gave up on and report it as failed.
    pub fn abort_transfer(&self, id: TransferId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(context) => {
                warn!(transfer = id, path = %context.path.display(), "Transfer aborted");
                self.notify(id, false, &context.path);
                true
            }
            None => false,
        }
    }

    /// Fail every transfer that has not completed, e.g. because the
    /// connection carrying them closed. Returns how many were failed.
    pub fn fail_active_transfers(&self, reason: &str) -> usize {
        let failed: Vec<(TransferId, PathBuf)> = {
            let mut transfers = self.lock();
            let ids: Vec<TransferId> = transfers
                .iter()
                .filter(|(_, c)| !c.completed)
                .map(|(&id, _)| id)
                .collect();
            ids.into_iter()
                .filter_map(|id| transfers.remove(&id).map(|c| (id, c.path)))
                .collect()
        };

        for (id, path) in &failed {
            warn!(transfer = id, path = %path.display(), reason, "Transfer failed");
            self.notify(*id, false, path);
        }
        failed.len()
    }

    /// Report a send of `path` that never got a transfer, such as when the
    /// connection could not be opened. Returns the id it was reported under.
    pub fn report_failed_send(&self, path: &Path) -> TransferId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        warn!(transfer = id, path = %path.display(), "File send could not start");
        self.notify(id, false, path);
        id
    }

    /// Local transfer a peer's notice refers to.
    ///
    /// Notices carry the sender's id: one of our sending transfers when the
    /// peer is receiving from us, otherwise a receiving transfer the peer
    /// announced.
    pub fn notice_target(&self, transfer_id: TransferId) -> Option<TransferId> {
        let transfers = self.lock();
        let sending = transfers
            .get(&transfer_id)
            .is_some_and(|c| c.direction == TransferDirection::Sending);
        if sending {
            return Some(transfer_id);
        }
        find_receiving(&transfers, transfer_id)
    }

    pub fn progress(&self, id: TransferId) -> Option<TransferProgress> {
        self.lock().get(&id).map(FileTransferContext::progress)
    }

    /// Local id of the receiving transfer announced by the peer as `peer_id`.
    pub fn receiving_id(&self, peer_id: TransferId) -> Option<TransferId> {
        find_receiving(&self.lock(), peer_id)
    }

    /// Transfers that have not completed yet.
    pub fn active_transfers(&self) -> usize {
        self.lock().values().filter(|c| !c.completed).count()
    }
}

fn find_receiving(
    transfers: &BTreeMap<TransferId, FileTransferContext>,
    peer_id: TransferId,
) -> Option<TransferId> {
    transfers
        .iter()
        .rev()
        .find(|(_, c)| c.direction == TransferDirection::Receiving && c.peer_id == Some(peer_id))
        .map(|(&id, _)| id)
}

/// Clamp a requested chunk size to what fits one send buffer chunk.
fn effective_chunk_size(requested: u32) -> u32 {
    if requested == 0 {
        return DEFAULT_CHUNK_SIZE;
    }
    requested.min(MAX_CHUNK_PAYLOAD as u32)
}

fn chunk_count(file_size: u64, chunk_size: u32) -> Result<u32, TransferError> {
    u32::try_from(file_size.div_ceil(chunk_size as u64))
        .map_err(|_| TransferError::FileTooLarge { size: file_size })
}

/// Reduce a peer-supplied name to a bare file name.
fn sanitize_file_name(name: &str) -> Result<String, TransferError> {
    let base = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim_matches('\0')
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        return Err(TransferError::InvalidFileName(name.to_string()));
    }
    Ok(base.to_string())
}

fn backup_existing(path: &Path, filename: &str) {
    let backup = path.with_file_name(format!("{filename}.bak"));
    match fs::rename(path, &backup) {
        Ok(()) => info!(
            path = %path.display(),
            backup = %backup.display(),
            "Existing file backed up"
        ),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to back up existing file"),
    }
}
