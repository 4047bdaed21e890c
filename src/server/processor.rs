//! Server-side task processing.
//!
//! Worker threads drain the peer's pending-task queue: building the local
//! layout, computing the diff against the client's layout and reading
//! blocks scheduled for transmission.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::Result;
use crate::layout::{FileBlock, FileEntry, FileLayout};
use crate::task::{
    BlockStatus, DeleteFileTask, SyncPhase, SyncTask, Task, TaskStatus, WriteBlockTask,
    WriteFileTask,
};

use super::{connection, RemoteClient};

pub(crate) fn spawn_workers(client: &Arc<RemoteClient>) {
    for _ in 0..client.config.worker_count {
        let client = client.clone();
        thread::spawn(move || run_worker(client));
    }
}

fn run_worker(client: Arc<RemoteClient>) {
    loop {
        let Some(task) = client.queue.next_runnable(runnable) else {
            return;
        };
        match task {
            Task::Layout => process_layout(&client),
            Task::WriteBlock { file, block } => process_read_block(&client, &file, &block),
            Task::Sync(sync) => process_sync(&client, &sync),
            _ => {}
        }
    }
}

fn runnable(task: &Task) -> bool {
    match task {
        Task::Layout | Task::WriteBlock { .. } => true,
        Task::Sync(sync) => matches!(
            sync.phase(),
            SyncPhase::PrepareHashing | SyncPhase::PrepareWriting
        ),
        _ => false,
    }
}

// =============================================================================
// Layout scan
// =============================================================================

fn process_layout(client: &Arc<RemoteClient>) {
    debug!(client = %client.name(), "building server file layout");
    match build_server_layout(client) {
        Ok(layout) => {
            client.set_layout_server(Arc::new(layout));
            let Some(sync) = client.sync_task() else {
                return;
            };
            let ready = {
                let mut state = sync.state.lock().unwrap();
                state.layout_server_pending = false;
                if state.layout_client_pending {
                    false
                } else {
                    sync.set_phase(SyncPhase::PrepareHashing);
                    true
                }
            };
            if ready {
                client.queue.push(Task::Sync(sync));
            }
        }
        Err(e) => client.fail_sync(format!("build server file layout failed: {e}")),
    }
}

/// Scan the data directory and attach a block partition to every file. A
/// file no larger than one block reuses the whole-file hash as its single
/// block hash instead of a second read pass.
fn build_server_layout(client: &RemoteClient) -> Result<FileLayout> {
    let block_size = client.config.block_size;
    let mut entries = client.storage.scan_layout()?;

    for entry in entries.values_mut() {
        entry.block_size = block_size;
        if entry.size <= block_size as u64 {
            let mut blocks = Vec::new();
            if entry.size > 0 {
                blocks.push(FileBlock {
                    offset: 0,
                    size: entry.size,
                    hash: entry.hash.clone(),
                });
            }
            entry.blocks = Some(blocks);
        } else {
            entry.blocks = Some(client.storage.block_hashes(&entry.path, block_size)?);
        }
    }
    Ok(FileLayout::from_entries(entries))
}

// =============================================================================
// Sync orchestration
// =============================================================================

fn process_sync(client: &Arc<RemoteClient>, sync: &Arc<SyncTask>) {
    if sync.phase() == SyncPhase::PrepareHashing {
        prepare_hashing(client, sync);
    }
    if sync.phase() == SyncPhase::PrepareWriting {
        prepare_writing(client, sync);
    }
}

/// Compare both layouts and request block hashes for every file that has
/// the same size but a different whole-file hash.
fn prepare_hashing(client: &Arc<RemoteClient>, sync: &Arc<SyncTask>) {
    debug!(client = %client.name(), "preparing block hash requests");

    let (layout_server, layout_client) = client.layouts();
    let (Some(layout_server), Some(layout_client)) = (layout_server, layout_client) else {
        client.fail_sync("synchronize client failed: missing layouts".into());
        return;
    };
    let server_files = layout_server.snapshot();

    let result: Result<()> = (|| {
        let mut state = sync.state.lock().unwrap();
        for (path, file_server) in &server_files {
            let Some(mut file_client) = layout_client.file_at(path) else {
                continue;
            };
            if file_client.size != file_server.size {
                continue;
            }
            if file_client.hash == file_server.hash {
                continue;
            }

            // Clone the server partition onto the client entry with the
            // hashes unknown; the response fills them in.
            file_client.block_size = file_server.block_size;
            file_client.blocks = Some(
                file_server
                    .blocks
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|b| FileBlock::new(b.offset, b.size))
                    .collect(),
            );
            layout_client.set_file(file_client);

            state
                .block_hashes
                .insert(path.clone(), TaskStatus::Processing);
            connection::send_request_file_block_hashes(client, path, file_server.block_size)?;
        }

        sync.set_phase(if state.block_hashes.is_empty() {
            SyncPhase::PrepareWriting
        } else {
            SyncPhase::ProcessHashing
        });
        Ok(())
    })();

    if let Err(e) = result {
        client.fail_sync(format!("synchronize client failed: {e}"));
    }
}

/// Compute the delta: delete tasks for client-only paths and write tasks
/// (full or partial) for changed files, then enter the writing phase.
fn prepare_writing(client: &Arc<RemoteClient>, sync: &Arc<SyncTask>) {
    debug!(client = %client.name(), "preparing delete and write tasks");

    let (layout_server, layout_client) = client.layouts();
    let (Some(layout_server), Some(layout_client)) = (layout_server, layout_client) else {
        client.fail_sync("synchronize client failed: missing layouts".into());
        return;
    };
    let server_files = layout_server.snapshot();
    let client_files = layout_client.snapshot();

    let result: Result<bool> = (|| {
        let mut state = sync.state.lock().unwrap();

        for path in client_files.keys() {
            if server_files.contains_key(path) {
                continue;
            }
            state
                .delete_files
                .insert(path.clone(), Arc::new(DeleteFileTask::new(path.clone())));
            connection::send_request_delete_file(client, path)?;
        }

        for (path, file_server) in &server_files {
            match client_files.get(path) {
                Some(file_client)
                    if file_client.hash == file_server.hash
                        && file_client.size == file_server.size =>
                {
                    continue;
                }
                Some(file_client)
                    if file_client.block_size == file_server.block_size
                        && file_client.block_count() == file_server.block_count() =>
                {
                    // The client entry carries the block hashes received
                    // during the hashing phase.
                    state.write_files.insert(
                        path.clone(),
                        partial_write_task(file_server, file_client),
                    );
                }
                _ => {
                    state
                        .write_files
                        .insert(path.clone(), full_write_task(file_server));
                }
            }
        }

        sync.set_phase(SyncPhase::ProcessWriting);
        let finished = state.delete_files.is_empty() && state.write_files.is_empty();
        if finished {
            sync.set_phase(SyncPhase::Success);
        }
        Ok(finished)
    })();

    match result {
        Ok(true) => client.succeed_sync(),
        Ok(false) => connection::send_next_write_requests_fail_sync(client, sync),
        Err(e) => client.fail_sync(format!("synchronize client failed: {e}")),
    }
}

/// Write task carrying every block of the server file.
pub(crate) fn full_write_task(file_server: &FileEntry) -> Arc<WriteFileTask> {
    let task = WriteFileTask::new(
        file_server.path.clone(),
        file_server.size,
        file_server.block_size as u64,
        file_server.block_count() as u32,
        true,
    );
    task.set_hash(file_server.hash.clone());
    {
        let mut blocks = task.blocks.lock().unwrap();
        for (index, block) in file_server.blocks.as_deref().unwrap_or_default().iter().enumerate() {
            blocks.push(Arc::new(WriteBlockTask::new(index as u32, block.size)));
        }
    }
    Arc::new(task)
}

/// Write task carrying only the blocks whose offset, size or hash differ
/// from the server's block at the same index.
pub(crate) fn partial_write_task(
    file_server: &FileEntry,
    file_client: &FileEntry,
) -> Arc<WriteFileTask> {
    let task = WriteFileTask::new(
        file_server.path.clone(),
        file_server.size,
        file_server.block_size as u64,
        file_server.block_count() as u32,
        false,
    );
    task.set_hash(file_server.hash.clone());
    {
        let mut blocks = task.blocks.lock().unwrap();
        let server_blocks = file_server.blocks.as_deref().unwrap_or_default();
        let client_blocks = file_client.blocks.as_deref().unwrap_or_default();
        for (index, (block_server, block_client)) in
            server_blocks.iter().zip(client_blocks).enumerate()
        {
            if block_client.hash == block_server.hash
                && block_client.offset == block_server.offset
                && block_client.size == block_server.size
            {
                continue;
            }
            blocks.push(Arc::new(WriteBlockTask::new(index as u32, block_server.size)));
        }
    }
    Arc::new(task)
}

// =============================================================================
// Block reads
// =============================================================================

fn process_read_block(
    client: &Arc<RemoteClient>,
    file: &Arc<WriteFileTask>,
    block: &Arc<WriteBlockTask>,
) {
    if block.status.get() != BlockStatus::ReadingData {
        return;
    }
    trace!(client = %client.name(), path = %file.path, index = block.index, "reading file block");

    let offset = file.block_size * block.index as u64;
    match client.storage.read_block(&file.path, offset, block.size) {
        Ok(data) => {
            block.set_data(Bytes::from(data));
            block.status.set(BlockStatus::DataReady);
            if let Some(sync) = client.sync_task() {
                connection::send_next_write_requests_fail_sync(client, &sync);
            }
        }
        Err(e) => {
            block.status.set(BlockStatus::Failure);
            client.fail_sync(format!(
                "failed reading block {} of {}: {e}",
                block.index, file.path
            ));
        }
    }
}
