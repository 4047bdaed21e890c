//! Task model and pending-task queue.
//!
//! Every unit of work a peer performs off the network thread is a task:
//! layout scans, block hashing, file deletion, file writes and their
//! per-block sub-tasks, and the sync orchestration task that owns the
//! sub-task maps of one synchronization run.
//!
//! Workers pull from a [`TaskQueue`]; dispatch is not strict FIFO, a worker
//! takes the first task whose preconditions currently hold.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;

// =============================================================================
// Statuses
// =============================================================================

/// Lifecycle of a file-level task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Pending = 0,
    Preparing = 1,
    Processing = 2,
    Finishing = 3,
    Success = 4,
    Failure = 5,
    ValidationFailed = 6,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Preparing,
            2 => Self::Processing,
            3 => Self::Finishing,
            4 => Self::Success,
            6 => Self::ValidationFailed,
            _ => Self::Failure,
        }
    }
}

/// Lifecycle of one block inside a write task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockStatus {
    Pending = 0,
    ReadingData = 1,
    DataReady = 2,
    DataSent = 3,
    Success = 4,
    Failure = 5,
}

impl BlockStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::ReadingData,
            2 => Self::DataReady,
            3 => Self::DataSent,
            4 => Self::Success,
            _ => Self::Failure,
        }
    }
}

/// Atomic status slot shared between the connection and worker threads.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: TaskStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: TaskStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct BlockStatusCell(AtomicU8);

impl BlockStatusCell {
    pub fn new(status: BlockStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> BlockStatus {
        BlockStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: BlockStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

// =============================================================================
// File-level tasks
// =============================================================================

/// Delete one file under the data directory.
#[derive(Debug)]
pub struct DeleteFileTask {
    pub path: String,
    pub status: StatusCell,
}

impl DeleteFileTask {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: StatusCell::new(TaskStatus::Pending),
        }
    }
}

/// Compute block hashes of one file (client side).
#[derive(Debug)]
pub struct BlockHashesTask {
    pub path: String,
    pub block_size: u32,
    pub status: StatusCell,
}

impl BlockHashesTask {
    pub fn new(path: impl Into<String>, block_size: u32) -> Self {
        Self {
            path: path.into(),
            block_size,
            status: StatusCell::new(TaskStatus::Pending),
        }
    }
}

/// One block of a [`WriteFileTask`]. The data buffer is released as soon as
/// the block has been sent or written.
#[derive(Debug)]
pub struct WriteBlockTask {
    pub index: u32,
    pub size: u64,
    pub status: BlockStatusCell,
    pub data: Mutex<Bytes>,
}

impl WriteBlockTask {
    pub fn new(index: u32, size: u64) -> Self {
        Self {
            index,
            size,
            status: BlockStatusCell::new(BlockStatus::Pending),
            data: Mutex::new(Bytes::new()),
        }
    }

    pub fn with_data(index: u32, size: u64, data: Bytes) -> Self {
        Self {
            index,
            size,
            status: BlockStatusCell::new(BlockStatus::Pending),
            data: Mutex::new(data),
        }
    }

    pub fn set_data(&self, data: Bytes) {
        *self.data.lock().unwrap() = data;
    }

    pub fn take_data(&self) -> Bytes {
        std::mem::take(&mut *self.data.lock().unwrap())
    }
}

/// Replace one file: truncate, stream blocks, verify the final hash.
#[derive(Debug)]
pub struct WriteFileTask {
    pub path: String,
    pub file_size: u64,
    pub block_size: u64,
    pub block_count: u32,
    pub truncate: bool,
    pub status: StatusCell,
    /// Expected whole-file hash, used for the finish phase.
    pub hash: Mutex<Vec<u8>>,
    /// Remaining blocks, ascending index. Access with the lock held.
    pub blocks: Mutex<Vec<Arc<WriteBlockTask>>>,
}

impl WriteFileTask {
    pub fn new(
        path: impl Into<String>,
        file_size: u64,
        block_size: u64,
        block_count: u32,
        truncate: bool,
    ) -> Self {
        Self {
            path: path.into(),
            file_size,
            block_size,
            block_count,
            truncate,
            status: StatusCell::new(TaskStatus::Pending),
            hash: Mutex::new(Vec::new()),
            blocks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_hash(&self, hash: Vec<u8>) {
        *self.hash.lock().unwrap() = hash;
    }

    pub fn hash(&self) -> Vec<u8> {
        self.hash.lock().unwrap().clone()
    }
}

// =============================================================================
// Sync task
// =============================================================================

/// Phase of a synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncPhase {
    Pending = 0,
    PrepareHashing = 1,
    ProcessHashing = 2,
    PrepareWriting = 3,
    ProcessWriting = 4,
    Success = 5,
    Failure = 6,
}

impl SyncPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::PrepareHashing,
            2 => Self::ProcessHashing,
            3 => Self::PrepareWriting,
            4 => Self::ProcessWriting,
            5 => Self::Success,
            _ => Self::Failure,
        }
    }
}

/// Mutable state of one sync run, guarded by the task's one mutex.
#[derive(Debug)]
pub struct SyncState {
    pub error: Option<String>,
    /// True while the local layout scan has not completed.
    pub layout_server_pending: bool,
    /// True while the client's layout response has not arrived.
    pub layout_client_pending: bool,
    /// Outstanding block-hash requests, keyed by path.
    pub block_hashes: BTreeMap<String, TaskStatus>,
    pub delete_files: BTreeMap<String, Arc<DeleteFileTask>>,
    pub write_files: BTreeMap<String, Arc<WriteFileTask>>,
}

/// Orchestrating task of one synchronization run. At most one exists per
/// peer at any time.
///
/// The phase is stored atomically so scheduling predicates can read it
/// without locking; writers transition it with the state mutex held, so a
/// sync task is never in two phases simultaneously.
#[derive(Debug)]
pub struct SyncTask {
    phase: AtomicU8,
    pub state: Mutex<SyncState>,
}

impl SyncTask {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(SyncPhase::Pending as u8),
            state: Mutex::new(SyncState {
                error: None,
                layout_server_pending: true,
                layout_client_pending: true,
                block_hashes: BTreeMap::new(),
                delete_files: BTreeMap::new(),
                write_files: BTreeMap::new(),
            }),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Transition the phase. Callers hold the state mutex.
    pub fn set_phase(&self, phase: SyncPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

impl Default for SyncTask {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Pending-task queue
// =============================================================================

/// A pending unit of work.
#[derive(Debug, Clone)]
pub enum Task {
    /// Scan the peer's own data directory into a fresh layout.
    Layout,
    /// Compute block hashes of one file (client).
    BlockHashes(Arc<BlockHashesTask>),
    /// Delete one file (client).
    DeleteFile(Arc<DeleteFileTask>),
    /// Truncate (status Pending) or finish-verify (status Finishing) a write
    /// (client).
    WriteFile(Arc<WriteFileTask>),
    /// Read (server) or write (client) one block of a write task.
    WriteBlock {
        file: Arc<WriteFileTask>,
        block: Arc<WriteBlockTask>,
    },
    /// Drive the sync state machine (server).
    Sync(Arc<SyncTask>),
}

/// Thread-safe pending-task queue with precondition-based dispatch.
///
/// Workers block on the condition variable while nothing is runnable; the
/// exit flag short-circuits the wait.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    cond: Condvar,
    exit: AtomicBool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: Task) {
        self.tasks.lock().unwrap().push_back(task);
        self.cond.notify_all();
    }

    /// Wake all waiting workers so they re-evaluate preconditions. Takes
    /// the queue lock so a worker between its check and its wait cannot
    /// miss the wakeup.
    pub fn notify(&self) {
        let _tasks = self.tasks.lock().unwrap();
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Block until some task satisfies `runnable`, remove and return it.
    /// Returns `None` once the queue has been shut down.
    pub fn next_runnable<F>(&self, runnable: F) -> Option<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let mut tasks = self.tasks.lock().unwrap();
        loop {
            if self.exit.load(Ordering::Acquire) {
                return None;
            }
            if let Some(pos) = tasks.iter().position(&runnable) {
                return tasks.remove(pos);
            }
            tasks = self.cond.wait(tasks).unwrap();
        }
    }

    /// Drop all pending work and release every waiting worker.
    pub fn shutdown(&self) {
        self.exit.store(true, Ordering::Release);
        self.tasks.lock().unwrap().clear();
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }
}
