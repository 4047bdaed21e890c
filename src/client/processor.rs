//! Client-side task processing.
//!
//! Worker threads perform every filesystem operation the server requests:
//! layout scans, block hashing, deletes, truncates, block writes and the
//! finish-write hash verification. Each operation answers with its
//! response message when done.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::layout::{FileEntry, FileLayout};
use crate::protocol::OpResult;
use crate::task::{
    BlockHashesTask, BlockStatus, DeleteFileTask, Task, TaskStatus, WriteBlockTask, WriteFileTask,
};

use super::{connection, LauncherClient};

pub(crate) fn spawn_workers(client: &Arc<LauncherClient>) {
    for _ in 0..client.config.worker_count {
        let client = client.clone();
        thread::spawn(move || run_worker(client));
    }
}

fn run_worker(client: Arc<LauncherClient>) {
    loop {
        let next = client.queue.next_runnable(|task| runnable(&client, task));
        let Some(task) = next else {
            return;
        };
        match task {
            Task::Layout => process_layout(&client),
            Task::BlockHashes(task) => process_block_hashes(&client, &task),
            Task::DeleteFile(task) => process_delete_file(&client, &task),
            Task::WriteFile(task) => match task.status.get() {
                TaskStatus::Pending => process_write_file(&client, &task),
                _ => process_finish_write_file(&client, &task),
            },
            Task::WriteBlock { file, block } => process_write_block(&client, &file, &block),
            Task::Sync(_) => {}
        }
    }
}

/// Everything except a layout scan requires the layout to exist.
fn runnable(client: &LauncherClient, task: &Task) -> bool {
    match task {
        Task::Layout => true,
        Task::BlockHashes(_) | Task::DeleteFile(_) | Task::WriteBlock { .. } => {
            client.has_layout()
        }
        Task::WriteFile(task) => {
            client.has_layout()
                && matches!(
                    task.status.get(),
                    TaskStatus::Pending | TaskStatus::Finishing
                )
        }
        Task::Sync(_) => false,
    }
}

// =============================================================================
// Layout scan
// =============================================================================

fn process_layout(client: &Arc<LauncherClient>) {
    debug!("building file layout");
    let layout = match client.storage.scan_layout() {
        Ok(entries) => Arc::new(FileLayout::from_entries(entries)),
        Err(e) => {
            // Answer with an empty layout so the server can still drive the
            // sync; the writes it issues will surface the real failures.
            error!(error = %e, "building file layout failed");
            client.mark_layout_dirty();
            Arc::new(FileLayout::new())
        }
    };
    client.set_layout(layout.clone());
    match connection::send_response_file_layout(client, &layout) {
        Ok(()) => {}
        Err(e @ Error::Protocol(_)) => {
            // No failure form exists for the layout response; an answer
            // that cannot be encoded leaves the server waiting forever, so
            // drop the connection instead.
            error!(error = %e, "cannot send file layout, disconnecting");
            client.disconnect();
        }
        Err(e) => warn!(error = %e, "failed to send file layout"),
    }
}

// =============================================================================
// Block hashes
// =============================================================================

fn process_block_hashes(client: &Arc<LauncherClient>, task: &BlockHashesTask) {
    trace!(path = %task.path, block_size = task.block_size, "calculating block hashes");

    match client.storage.block_hashes(&task.path, task.block_size) {
        Ok(blocks) => {
            if let Some(layout) = client.layout() {
                if let Some(mut entry) = layout.file_at(&task.path) {
                    entry.block_size = task.block_size;
                    entry.blocks = Some(blocks.clone());
                    layout.set_file(entry);
                }
            }
            task.status.set(TaskStatus::Success);
            let hashes = blocks.into_iter().map(|b| b.hash).collect();
            let _ = connection::send_response_file_block_hashes(
                client,
                &task.path,
                task.block_size,
                hashes,
            );
        }
        Err(e) => {
            error!(path = %task.path, error = %e, "calculating block hashes failed");
            task.status.set(TaskStatus::Failure);
            let _ = connection::send_response_file_block_hashes(
                client,
                &task.path,
                task.block_size,
                Vec::new(),
            );
        }
    }
}

// =============================================================================
// Delete
// =============================================================================

fn process_delete_file(client: &Arc<LauncherClient>, task: &DeleteFileTask) {
    trace!(path = %task.path, "deleting file");

    let result = client.storage.delete_file(&task.path);
    if let Some(layout) = client.layout() {
        layout.remove_file(&task.path);
    }
    let result = match result {
        Ok(()) => {
            task.status.set(TaskStatus::Success);
            OpResult::Success
        }
        Err(e) => {
            error!(path = %task.path, error = %e, "deleting file failed");
            task.status.set(TaskStatus::Failure);
            client.mark_layout_dirty();
            OpResult::Failure
        }
    };
    let _ = connection::send_response_delete_file(client, &task.path, result);
}

// =============================================================================
// Write file
// =============================================================================

/// Truncate phase: prepare the file for block writes.
fn process_write_file(client: &Arc<LauncherClient>, task: &Arc<WriteFileTask>) {
    trace!(path = %task.path, truncate = task.truncate, "write file");

    let result = if task.truncate {
        client.storage.truncate_file(&task.path)
    } else {
        Ok(())
    };
    let result = match result {
        Ok(()) => {
            task.status.set(TaskStatus::Processing);
            OpResult::Success
        }
        Err(e) => {
            error!(path = %task.path, error = %e, "preparing file write failed");
            task.status.set(TaskStatus::Failure);
            client.mark_layout_dirty();
            client.remove_write_task(&task.path);
            OpResult::Failure
        }
    };
    let _ = connection::send_response_write_file(client, &task.path, result);
}

fn process_write_block(
    client: &Arc<LauncherClient>,
    file: &Arc<WriteFileTask>,
    block: &Arc<WriteBlockTask>,
) {
    trace!(path = %file.path, index = block.index, size = block.size, "write file block");

    let offset = file.block_size * block.index as u64;
    let data = block.take_data();
    let result = match client.storage.write_block(&file.path, offset, &data) {
        Ok(()) => {
            block.status.set(BlockStatus::Success);
            OpResult::Success
        }
        Err(e) => {
            error!(path = %file.path, index = block.index, error = %e, "writing block failed");
            block.status.set(BlockStatus::Failure);
            client.mark_layout_dirty();
            OpResult::Failure
        }
    };
    let _ = connection::send_file_data_received(client, &file.path, block.index, result);
}

/// Finish phase: re-hash the written file, compare against the expected
/// hash and publish the new layout entry on match.
fn process_finish_write_file(client: &Arc<LauncherClient>, task: &Arc<WriteFileTask>) {
    trace!(path = %task.path, "finish write file");

    let verified: Result<FileEntry> = (|| {
        let hash = client.storage.file_hash(&task.path)?;
        if hash != task.hash() {
            return Err(Error::HashMismatch {
                path: task.path.clone(),
            });
        }
        let mut entry = FileEntry::new(task.path.clone(), task.file_size, hash);
        entry.block_size = task.block_size as u32;
        Ok(entry)
    })();

    client.remove_write_task(&task.path);
    let result = match verified {
        Ok(entry) => match client.layout() {
            Some(layout) => {
                layout.set_file(entry);
                task.status.set(TaskStatus::Success);
                OpResult::Success
            }
            None => {
                error!(path = %task.path, "finish write failed: layout missing");
                task.status.set(TaskStatus::Failure);
                client.mark_layout_dirty();
                OpResult::Failure
            }
        },
        Err(Error::HashMismatch { .. }) => {
            error!(
                path = %task.path,
                expected = %hex::encode(task.hash()),
                "finish write failed: hash mismatch"
            );
            task.status.set(TaskStatus::ValidationFailed);
            client.mark_layout_dirty();
            OpResult::Failure
        }
        Err(e) => {
            error!(path = %task.path, error = %e, "finish write failed");
            task.status.set(TaskStatus::Failure);
            client.mark_layout_dirty();
            OpResult::Failure
        }
    };
    let _ = connection::send_response_finish_write_file(client, &task.path, result);
}
