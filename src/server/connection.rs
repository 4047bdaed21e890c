//! Server-side message dispatch and the throttled write pipeline.
//!
//! Runs on the transport read task and, for the pipeline entry points, on
//! worker threads. Never performs file I/O; it only mutates task state and
//! appends frames to the outbound queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tracing::{error, info, trace, warn};

use crate::error::{Error, Result};
use crate::layout::block_partition;
use crate::protocol::{
    FileDataReceived, LogLevel, Logs, MessageCode, RequestDeleteFile, RequestFileBlockHashes,
    RequestFinishWriteFile, RequestWriteFile, ResponseDeleteFile, ResponseFileBlockHashes,
    ResponseFileLayout, ResponseFinishWriteFile, ResponseWriteFile, RunStatus, SendFileData,
    LINK_RUN_STATE,
};
use crate::task::{BlockStatus, SyncPhase, SyncTask, Task, TaskStatus, WriteFileTask};

use super::RemoteClient;

/// Dispatch one inbound protocol message. Returns an error only for
/// violations that require dropping the connection.
pub(crate) fn dispatch(client: &Arc<RemoteClient>, mut payload: Bytes) -> Result<()> {
    if payload.remaining() < 1 {
        return Err(Error::Protocol("empty message".into()));
    }
    let code = payload.get_u8();
    let Some(code) = MessageCode::from_u8(code) else {
        return Err(Error::Protocol(format!("unknown message code {code}")));
    };

    match code {
        MessageCode::Logs => handle_logs(client, payload),
        MessageCode::ResponseFileLayout => handle_response_file_layout(client, payload),
        MessageCode::ResponseFileBlockHashes => handle_response_file_block_hashes(client, payload),
        MessageCode::ResponseDeleteFile => handle_response_delete_file(client, payload),
        MessageCode::ResponseWriteFile => handle_response_write_file(client, payload),
        MessageCode::FileDataReceived => handle_file_data_received(client, payload),
        MessageCode::ResponseFinishWriteFile => handle_response_finish_write_file(client, payload),
        MessageCode::KeepAlive => Ok(()),
        other => {
            warn!(client = %client.name(), ?other, "ignoring unexpected message");
            Ok(())
        }
    }
}

pub(crate) fn handle_link_update(client: &Arc<RemoteClient>, code: u8, value: u8) {
    if code != LINK_RUN_STATE {
        warn!(client = %client.name(), code, "update for unknown link state");
        return;
    }
    let status = RunStatus::from_u8(value);
    if client.run_state.set(status) {
        info!(client = %client.name(), ?status, "run status changed");
        client.handler.run_status_changed(client.name(), status);
    }
}

/// Fetch the current sync task if it is in one of the expected phases.
fn sync_task_in(
    client: &RemoteClient,
    function: &str,
    phases: &[SyncPhase],
) -> Option<Arc<SyncTask>> {
    let Some(sync) = client.sync_task() else {
        warn!(client = %client.name(), function, "response received but no sync task is present");
        return None;
    };
    let phase = sync.phase();
    if !phases.contains(&phase) {
        warn!(
            client = %client.name(),
            function,
            ?phase,
            "response received but sync task is not in the right state"
        );
        return None;
    }
    Some(sync)
}

// =============================================================================
// Response handlers
// =============================================================================

fn handle_logs(client: &Arc<RemoteClient>, payload: Bytes) -> Result<()> {
    let msg = Logs::decode(payload)?;
    let name = client.name();
    match msg.level {
        LogLevel::Error => error!(client = %name, source = %msg.source, "{}", msg.message),
        LogLevel::Warning => warn!(client = %name, source = %msg.source, "{}", msg.message),
        LogLevel::Info => info!(client = %name, source = %msg.source, "{}", msg.message),
    }
    Ok(())
}

fn handle_response_file_layout(client: &Arc<RemoteClient>, payload: Bytes) -> Result<()> {
    let Some(sync) = sync_task_in(client, "responseFileLayout", &[SyncPhase::Pending]) else {
        return Ok(());
    };
    let msg = ResponseFileLayout::decode(payload)?;
    let count = msg.entries.len();

    let layout = crate::layout::FileLayout::new();
    for entry in msg.entries {
        layout.set_file(crate::layout::FileEntry::new(
            entry.path, entry.size, entry.hash,
        ));
    }
    client.set_layout_client(Arc::new(layout));
    info!(client = %client.name(), count, "client file layout received");

    let ready = {
        let mut state = sync.state.lock().unwrap();
        state.layout_client_pending = false;
        if state.layout_server_pending {
            false
        } else {
            sync.set_phase(SyncPhase::PrepareHashing);
            true
        }
    };
    if ready {
        client.queue.push(Task::Sync(sync));
    }
    Ok(())
}

fn handle_response_file_block_hashes(client: &Arc<RemoteClient>, payload: Bytes) -> Result<()> {
    // PrepareHashing is accepted as well: the request burst goes out while
    // the preparing worker still holds the sync lock, and a fast client can
    // answer before the phase advances.
    let Some(sync) = sync_task_in(
        client,
        "responseFileBlockHashes",
        &[SyncPhase::PrepareHashing, SyncPhase::ProcessHashing],
    ) else {
        return Ok(());
    };
    let msg = ResponseFileBlockHashes::decode(payload)?;

    {
        let mut state = sync.state.lock().unwrap();
        match state.block_hashes.get(&msg.path) {
            None => {
                warn!(client = %client.name(), path = %msg.path,
                    "block hashes received but task is absent");
                return Ok(());
            }
            Some(TaskStatus::Processing) => {
                state.block_hashes.remove(&msg.path);
            }
            Some(status) => {
                warn!(client = %client.name(), path = %msg.path, ?status,
                    "block hashes received but task is not processing");
                return Ok(());
            }
        }
    }

    if let Err(e) = apply_block_hashes(client, &msg) {
        client.fail_sync(format!("synchronize client failed: {e}"));
        return Ok(());
    }
    info!(client = %client.name(), path = %msg.path, "block hashes received");

    let ready = {
        let state = sync.state.lock().unwrap();
        if state.block_hashes.is_empty() {
            sync.set_phase(SyncPhase::PrepareWriting);
            true
        } else {
            false
        }
    };
    if ready {
        client.queue.push(Task::Sync(sync));
    }
    Ok(())
}

/// Store received block hashes on the cached client file entry.
fn apply_block_hashes(client: &RemoteClient, msg: &ResponseFileBlockHashes) -> Result<()> {
    let (_, layout_client) = client.layouts();
    let layout = layout_client.ok_or(Error::LayoutMissing)?;
    let mut entry = layout
        .file_at(&msg.path)
        .ok_or_else(|| Error::TaskNotFound(format!("file not in layout: {}", msg.path)))?;

    let expected = entry.block_count();
    if msg.block_size == entry.block_size && msg.hashes.len() == expected {
        let blocks = entry.blocks.as_mut().ok_or(Error::LayoutMissing)?;
        for (block, hash) in blocks.iter_mut().zip(&msg.hashes) {
            block.hash = hash.clone();
        }
    } else {
        // The client answered with a partition of its own (different block
        // size or an empty response for a failed read). Record it as-is so
        // the diff falls back to a full rewrite.
        entry.block_size = msg.block_size;
        entry.blocks = Some(
            block_partition(entry.size, msg.block_size as u64)
                .into_iter()
                .enumerate()
                .map(|(i, (offset, size))| crate::layout::FileBlock {
                    offset,
                    size,
                    hash: msg.hashes.get(i).cloned().unwrap_or_default(),
                })
                .collect(),
        );
    }
    layout.set_file(entry);
    Ok(())
}

fn handle_response_delete_file(client: &Arc<RemoteClient>, payload: Bytes) -> Result<()> {
    let Some(sync) = sync_task_in(
        client,
        "responseDeleteFile",
        &[SyncPhase::PrepareWriting, SyncPhase::ProcessWriting],
    ) else {
        return Ok(());
    };
    let msg = ResponseDeleteFile::decode(payload)?;

    {
        let mut state = sync.state.lock().unwrap();
        if state.delete_files.remove(&msg.path).is_none() {
            warn!(client = %client.name(), path = %msg.path,
                "delete file response received with invalid path");
            return Ok(());
        }
    }

    if msg.result.is_success() {
        info!(client = %client.name(), path = %msg.path, "file deleted");
        check_finished_write(client, &sync);
    } else {
        client.fail_sync(format!("failed deleting file: {}", msg.path));
    }
    Ok(())
}

fn handle_response_write_file(client: &Arc<RemoteClient>, payload: Bytes) -> Result<()> {
    let Some(sync) = sync_task_in(client, "responseWriteFile", &[SyncPhase::ProcessWriting])
    else {
        return Ok(());
    };
    let msg = ResponseWriteFile::decode(payload)?;

    {
        let state = sync.state.lock().unwrap();
        let Some(task) = state.write_files.get(&msg.path) else {
            warn!(client = %client.name(), path = %msg.path,
                "write file response received with invalid path");
            return Ok(());
        };
        if task.status.get() != TaskStatus::Preparing {
            warn!(client = %client.name(), path = %msg.path,
                "write file response received but task is not preparing");
            return Ok(());
        }
        if msg.result.is_success() {
            task.status.set(TaskStatus::Processing);
        } else {
            task.status.set(TaskStatus::Failure);
        }
    }

    if msg.result.is_success() {
        send_next_write_requests_fail_sync(client, &sync);
    } else {
        client.fail_sync(format!("failed writing file: {}", msg.path));
    }
    Ok(())
}

fn handle_file_data_received(client: &Arc<RemoteClient>, payload: Bytes) -> Result<()> {
    let Some(sync) = sync_task_in(client, "fileDataReceived", &[SyncPhase::ProcessWriting])
    else {
        return Ok(());
    };
    let msg = FileDataReceived::decode(payload)?;

    {
        let state = sync.state.lock().unwrap();
        let Some(task) = state.write_files.get(&msg.path) else {
            warn!(client = %client.name(), path = %msg.path,
                "file data response received with invalid path");
            return Ok(());
        };
        if task.status.get() != TaskStatus::Processing {
            warn!(client = %client.name(), path = %msg.path,
                "file data response received but task is not processing");
            return Ok(());
        }
        let mut blocks = task.blocks.lock().unwrap();
        let Some(pos) = blocks.iter().position(|b| b.index == msg.block_index) else {
            warn!(client = %client.name(), path = %msg.path, block = msg.block_index,
                "file data response received with invalid block");
            return Ok(());
        };
        if blocks[pos].status.get() != BlockStatus::DataSent {
            warn!(client = %client.name(), path = %msg.path, block = msg.block_index,
                "file data response received but block is not sent");
            return Ok(());
        }
        blocks.remove(pos);
        let _ = client
            .in_flight_blocks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    if msg.result.is_success() {
        send_next_write_requests_fail_sync(client, &sync);
    } else {
        client.fail_sync(format!(
            "failed sending data: {} block {}",
            msg.path, msg.block_index
        ));
    }
    Ok(())
}

fn handle_response_finish_write_file(client: &Arc<RemoteClient>, payload: Bytes) -> Result<()> {
    let Some(sync) = sync_task_in(
        client,
        "responseFinishWriteFile",
        &[SyncPhase::ProcessWriting],
    ) else {
        return Ok(());
    };
    let msg = ResponseFinishWriteFile::decode(payload)?;

    {
        let mut state = sync.state.lock().unwrap();
        let Some(task) = state.write_files.get(&msg.path) else {
            warn!(client = %client.name(), path = %msg.path,
                "finish write response received with invalid path");
            return Ok(());
        };
        if task.status.get() != TaskStatus::Finishing {
            warn!(client = %client.name(), path = %msg.path,
                "finish write response received but task is not finishing");
            return Ok(());
        }
        state.write_files.remove(&msg.path);
        let _ = client
            .in_flight_files
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    if msg.result.is_success() {
        info!(client = %client.name(), path = %msg.path, "file written");
        check_finished_write(client, &sync);
    } else {
        client.fail_sync(format!("writing file failed: {}", msg.path));
    }
    Ok(())
}

/// Transition to success once both the delete and write maps are empty,
/// otherwise keep the pipeline moving.
fn check_finished_write(client: &Arc<RemoteClient>, sync: &Arc<SyncTask>) {
    let finished = {
        let state = sync.state.lock().unwrap();
        let done = state.delete_files.is_empty() && state.write_files.is_empty();
        if done {
            sync.set_phase(SyncPhase::Success);
        }
        done
    };
    if finished {
        client.succeed_sync();
    } else {
        send_next_write_requests_fail_sync(client, sync);
    }
}

// =============================================================================
// Write pipeline
// =============================================================================

/// Offer pending write work to the network, honoring the in-flight caps.
///
/// Called on entry to the writing phase and after every write-related
/// response. Safe to call from worker threads.
pub(crate) fn send_next_write_requests(
    client: &Arc<RemoteClient>,
    sync: &Arc<SyncTask>,
) -> Result<()> {
    let max_files = client.config.max_in_progress_files;
    let max_blocks = client.config.max_in_progress_blocks;

    let state = sync.state.lock().unwrap();
    if state.write_files.is_empty() {
        return Ok(());
    }

    'files: for task in state.write_files.values() {
        match task.status.get() {
            TaskStatus::Pending => {
                if client.in_flight_files.load(Ordering::Acquire) >= max_files {
                    break 'files;
                }
                task.status.set(TaskStatus::Preparing);
                client.in_flight_files.fetch_add(1, Ordering::AcqRel);
                if let Err(e) = send_request_write_file(client, task) {
                    task.status.set(TaskStatus::Failure);
                    return Err(e);
                }
            }
            TaskStatus::Processing => {
                let blocks = task.blocks.lock().unwrap();
                if blocks.is_empty() {
                    drop(blocks);
                    task.status.set(TaskStatus::Finishing);
                    if let Err(e) = send_request_finish_write_file(client, task) {
                        task.status.set(TaskStatus::Failure);
                        return Err(e);
                    }
                } else {
                    for block in blocks.iter() {
                        if block.status.get() == BlockStatus::Pending {
                            if client.in_flight_blocks.load(Ordering::Acquire) >= max_blocks {
                                break;
                            }
                            client.in_flight_blocks.fetch_add(1, Ordering::AcqRel);
                            if block.size > 0 {
                                block.status.set(BlockStatus::ReadingData);
                                client.queue.push(Task::WriteBlock {
                                    file: task.clone(),
                                    block: block.clone(),
                                });
                                continue;
                            }
                            block.status.set(BlockStatus::DataReady);
                        }
                        if block.status.get() == BlockStatus::DataReady {
                            block.status.set(BlockStatus::DataSent);
                            let data = block.take_data();
                            if let Err(e) =
                                send_file_data(client, &task.path, block.index, data)
                            {
                                task.status.set(TaskStatus::Failure);
                                return Err(e);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Pipeline entry point that fails the whole sync on error.
pub(crate) fn send_next_write_requests_fail_sync(client: &Arc<RemoteClient>, sync: &Arc<SyncTask>) {
    if let Err(e) = send_next_write_requests(client, sync) {
        client.fail_sync(format!("synchronize client failed: {e}"));
    }
}

// =============================================================================
// Request senders
// =============================================================================

pub(crate) fn send_request_layout(client: &RemoteClient) -> Result<()> {
    info!(client = %client.name(), "request file layout");
    client.send(crate::protocol::request_file_layout_frame())
}

pub(crate) fn send_request_file_block_hashes(
    client: &RemoteClient,
    path: &str,
    block_size: u32,
) -> Result<()> {
    info!(client = %client.name(), %path, block_size, "request file block hashes");
    client.send(
        RequestFileBlockHashes {
            path: path.to_string(),
            block_size,
        }
        .encode(),
    )
}

pub(crate) fn send_request_delete_file(client: &RemoteClient, path: &str) -> Result<()> {
    info!(client = %client.name(), %path, "request delete file");
    client.send(
        RequestDeleteFile {
            path: path.to_string(),
        }
        .encode(),
    )
}

fn send_request_write_file(client: &RemoteClient, task: &WriteFileTask) -> Result<()> {
    info!(client = %client.name(), path = %task.path, size = task.file_size, "request write file");
    client.send(
        RequestWriteFile {
            path: task.path.clone(),
            file_size: task.file_size,
            block_size: task.block_size,
            block_count: task.block_count,
        }
        .encode(),
    )
}

fn send_file_data(client: &RemoteClient, path: &str, index: u32, data: Bytes) -> Result<()> {
    trace!(client = %client.name(), %path, index, len = data.len(), "send file data");
    client.send(
        SendFileData {
            path: path.to_string(),
            block_index: index,
            data,
        }
        .encode(),
    )
}

fn send_request_finish_write_file(client: &RemoteClient, task: &WriteFileTask) -> Result<()> {
    let hash = task.hash();
    if hash.is_empty() {
        return Err(Error::TaskNotFound(format!(
            "file missing in layout: {}",
            task.path
        )));
    }
    info!(client = %client.name(), path = %task.path, "request finish write file");
    client.send(
        RequestFinishWriteFile {
            path: task.path.clone(),
            hash,
        }
        .encode(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::NullHandler;
    use crate::task::WriteBlockTask;

    fn test_client() -> Arc<RemoteClient> {
        let mut config = ServerConfig::new("/nonexistent", "127.0.0.1:0");
        config.max_in_progress_files = 1;
        config.max_in_progress_blocks = 2;
        Arc::new(RemoteClient::new(
            "test".to_string(),
            config,
            Arc::new(NullHandler),
        ))
    }

    fn write_task_with_blocks(path: &str, sizes: &[u64]) -> Arc<WriteFileTask> {
        let task = WriteFileTask::new(path, sizes.iter().sum(), 1024, sizes.len() as u32, true);
        task.set_hash(vec![1; 32]);
        {
            let mut blocks = task.blocks.lock().unwrap();
            for (index, size) in sizes.iter().enumerate() {
                blocks.push(Arc::new(WriteBlockTask::new(index as u32, *size)));
            }
        }
        Arc::new(task)
    }

    fn install_sync(client: &Arc<RemoteClient>, tasks: Vec<Arc<WriteFileTask>>) -> Arc<SyncTask> {
        let sync = Arc::new(SyncTask::new());
        {
            let mut state = sync.state.lock().unwrap();
            for task in tasks {
                state.write_files.insert(task.path.clone(), task);
            }
        }
        sync.set_phase(SyncPhase::ProcessWriting);
        client.state.lock().unwrap().sync = Some(sync.clone());
        sync
    }

    #[test]
    fn test_file_cap_limits_outstanding_write_requests() {
        let client = test_client();
        let first = write_task_with_blocks("a.bin", &[10]);
        let second = write_task_with_blocks("b.bin", &[10]);
        let sync = install_sync(&client, vec![first.clone(), second.clone()]);

        send_next_write_requests(&client, &sync).unwrap();

        assert_eq!(first.status.get(), TaskStatus::Preparing);
        assert_eq!(second.status.get(), TaskStatus::Pending);
        assert_eq!(client.in_flight_files.load(Ordering::Acquire), 1);
        assert_eq!(client.outbound.pop_all().len(), 1);
    }

    #[test]
    fn test_block_cap_limits_in_flight_blocks() {
        let client = test_client();
        let task = write_task_with_blocks("a.bin", &[10, 10, 10, 10]);
        task.status.set(TaskStatus::Processing);
        client.in_flight_files.fetch_add(1, Ordering::AcqRel);
        let sync = install_sync(&client, vec![task.clone()]);

        send_next_write_requests(&client, &sync).unwrap();

        assert_eq!(client.in_flight_blocks.load(Ordering::Acquire), 2);
        let blocks = task.blocks.lock().unwrap();
        assert_eq!(blocks[0].status.get(), BlockStatus::ReadingData);
        assert_eq!(blocks[1].status.get(), BlockStatus::ReadingData);
        assert_eq!(blocks[2].status.get(), BlockStatus::Pending);
        assert_eq!(blocks[3].status.get(), BlockStatus::Pending);
        // Both scheduled blocks went to the worker pool as read tasks.
        assert_eq!(client.queue.len(), 2);
    }

    #[test]
    fn test_ready_block_is_sent_and_data_released() {
        let client = test_client();
        let task = write_task_with_blocks("a.bin", &[4]);
        task.status.set(TaskStatus::Processing);
        client.in_flight_files.fetch_add(1, Ordering::AcqRel);
        {
            let blocks = task.blocks.lock().unwrap();
            blocks[0].status.set(BlockStatus::DataReady);
            blocks[0].set_data(Bytes::from_static(b"abcd"));
        }
        client.in_flight_blocks.fetch_add(1, Ordering::AcqRel);
        let sync = install_sync(&client, vec![task.clone()]);

        send_next_write_requests(&client, &sync).unwrap();

        let blocks = task.blocks.lock().unwrap();
        assert_eq!(blocks[0].status.get(), BlockStatus::DataSent);
        assert!(blocks[0].data.lock().unwrap().is_empty());
        assert_eq!(client.outbound.pop_all().len(), 1);
    }

    #[test]
    fn test_empty_block_list_moves_to_finishing() {
        let client = test_client();
        let task = write_task_with_blocks("a.bin", &[]);
        task.status.set(TaskStatus::Processing);
        client.in_flight_files.fetch_add(1, Ordering::AcqRel);
        let sync = install_sync(&client, vec![task.clone()]);

        send_next_write_requests(&client, &sync).unwrap();

        assert_eq!(task.status.get(), TaskStatus::Finishing);
        // The finish request was queued.
        assert_eq!(client.outbound.pop_all().len(), 1);
    }

    #[test]
    fn test_write_file_response_advances_task() {
        let client = test_client();
        let task = write_task_with_blocks("a.bin", &[4]);
        task.status.set(TaskStatus::Preparing);
        client.in_flight_files.fetch_add(1, Ordering::AcqRel);
        install_sync(&client, vec![task.clone()]);

        let frame = ResponseWriteFile {
            path: "a.bin".to_string(),
            result: crate::protocol::OpResult::Success,
        }
        .encode();
        dispatch(&client, frame.slice(5..)).unwrap();

        assert_eq!(task.status.get(), TaskStatus::Processing);
        // The pipeline immediately scheduled the block read.
        assert_eq!(client.queue.len(), 1);
    }

    #[test]
    fn test_failed_write_response_fails_sync() {
        let client = test_client();
        let task = write_task_with_blocks("a.bin", &[4]);
        task.status.set(TaskStatus::Preparing);
        client.in_flight_files.fetch_add(1, Ordering::AcqRel);
        let sync = install_sync(&client, vec![task.clone()]);

        let frame = ResponseWriteFile {
            path: "a.bin".to_string(),
            result: crate::protocol::OpResult::Failure,
        }
        .encode();
        dispatch(&client, frame.slice(5..)).unwrap();

        assert_eq!(sync.phase(), SyncPhase::Failure);
        assert!(client.sync_task().is_none());
    }

    #[test]
    fn test_response_for_unknown_path_is_ignored() {
        let client = test_client();
        let task = write_task_with_blocks("a.bin", &[4]);
        task.status.set(TaskStatus::Preparing);
        let sync = install_sync(&client, vec![task]);

        let frame = ResponseWriteFile {
            path: "other.bin".to_string(),
            result: crate::protocol::OpResult::Success,
        }
        .encode();
        dispatch(&client, frame.slice(5..)).unwrap();

        assert_eq!(sync.phase(), SyncPhase::ProcessWriting);
        assert!(client.sync_task().is_some());
    }

    #[test]
    fn test_unknown_message_code_is_a_violation() {
        let client = test_client();
        let payload = Bytes::from_static(&[0xEE]);
        assert!(matches!(
            dispatch(&client, payload),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_link_update_tracks_run_status() {
        let client = test_client();
        client.run_state.link(RunStatus::Stopped);

        handle_link_update(&client, LINK_RUN_STATE, RunStatus::Running as u8);
        assert_eq!(client.run_state.get(), RunStatus::Running);

        handle_link_update(&client, LINK_RUN_STATE, RunStatus::Stopped as u8);
        assert_eq!(client.run_state.get(), RunStatus::Stopped);
    }
}
