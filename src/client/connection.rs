//! Client-side message dispatch.
//!
//! Runs on the transport read task. Requests that touch the filesystem are
//! turned into tasks for the worker pool; everything else is answered in
//! place.

use std::sync::Arc;

use bytes::{Buf, Bytes};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::layout::FileLayout;
use crate::protocol::{
    FileDataReceived, LogLevel, MessageCode, OpResult, RequestDeleteFile, RequestFileBlockHashes,
    RequestFinishWriteFile, RequestWriteFile, ResponseDeleteFile, ResponseFileBlockHashes,
    ResponseFileLayout, ResponseFinishWriteFile, ResponseWriteFile, RunStatus, SendFileData,
    StartApplication, StopApplication, StopMode,
};
use crate::task::{BlockHashesTask, DeleteFileTask, Task, TaskStatus, WriteBlockTask, WriteFileTask};

use super::runner::RunParameters;
use super::LauncherClient;

/// Dispatch one inbound protocol message. Returns an error only for
/// violations that require dropping the connection.
pub(crate) fn dispatch(client: &Arc<LauncherClient>, mut payload: Bytes) -> Result<()> {
    if payload.remaining() < 1 {
        return Err(Error::Protocol("empty message".into()));
    }
    let code = payload.get_u8();
    let Some(code) = MessageCode::from_u8(code) else {
        return Err(Error::Protocol(format!("unknown message code {code}")));
    };

    match code {
        MessageCode::RequestFileLayout => handle_request_file_layout(client),
        MessageCode::RequestFileBlockHashes => handle_request_file_block_hashes(client, payload),
        MessageCode::RequestDeleteFile => handle_request_delete_file(client, payload),
        MessageCode::RequestWriteFile => handle_request_write_file(client, payload),
        MessageCode::SendFileData => handle_send_file_data(client, payload),
        MessageCode::RequestFinishWriteFile => handle_request_finish_write_file(client, payload),
        MessageCode::StartApplication => handle_start_application(client, payload),
        MessageCode::StopApplication => handle_stop_application(client, payload),
        MessageCode::KeepAlive => Ok(()),
        other => {
            warn!(?other, "ignoring unexpected message");
            Ok(())
        }
    }
}

// =============================================================================
// Request handlers
// =============================================================================

fn handle_request_file_layout(client: &Arc<LauncherClient>) -> Result<()> {
    info!("file layout requested");
    let (layout, dirty) = client.layout_state();
    match layout {
        Some(layout) if !dirty => send_response_file_layout(client, &layout),
        _ => {
            // Stale or missing; a fresh scan answers when it completes.
            client.queue.push(Task::Layout);
            Ok(())
        }
    }
}

fn handle_request_file_block_hashes(client: &Arc<LauncherClient>, payload: Bytes) -> Result<()> {
    let msg = RequestFileBlockHashes::decode(payload)?;
    info!(path = %msg.path, block_size = msg.block_size, "file block hashes requested");

    let entry = client.layout().and_then(|layout| layout.file_at(&msg.path));
    let Some(entry) = entry else {
        warn!(path = %msg.path, "block hashes for non-existing file requested, answering empty");
        return client.send(ResponseFileBlockHashes::empty(msg.path, msg.block_size).encode()?);
    };

    let cached = entry.has_blocks()
        && entry.block_size == msg.block_size
        && entry
            .blocks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .all(|b| b.has_hash());
    if cached {
        let hashes = entry
            .blocks
            .unwrap_or_default()
            .into_iter()
            .map(|b| b.hash)
            .collect();
        return send_response_file_block_hashes(client, &msg.path, msg.block_size, hashes);
    }

    // Unknown or differently partitioned; recompute with the requested
    // block size.
    client.queue.push(Task::BlockHashes(Arc::new(BlockHashesTask::new(
        msg.path,
        msg.block_size,
    ))));
    Ok(())
}

fn handle_request_delete_file(client: &Arc<LauncherClient>, payload: Bytes) -> Result<()> {
    let msg = RequestDeleteFile::decode(payload)?;
    info!(path = %msg.path, "delete file requested");
    client
        .queue
        .push(Task::DeleteFile(Arc::new(DeleteFileTask::new(msg.path))));
    Ok(())
}

fn handle_request_write_file(client: &Arc<LauncherClient>, payload: Bytes) -> Result<()> {
    let msg = RequestWriteFile::decode(payload)?;
    info!(path = %msg.path, size = msg.file_size, "write file requested");

    // Truncate unless the cached entry matches the incoming partition
    // exactly; a matching partition means block-indexed overwrites patch
    // the existing file in place.
    let truncate = match client.layout().and_then(|layout| layout.file_at(&msg.path)) {
        Some(entry) => {
            !(entry.size == msg.file_size
                && entry.block_size as u64 == msg.block_size
                && entry.block_count() as u32 == msg.block_count)
        }
        None => true,
    };

    let task = Arc::new(WriteFileTask::new(
        msg.path,
        msg.file_size,
        msg.block_size,
        msg.block_count,
        truncate,
    ));
    client.insert_write_task(task.clone());
    client.queue.push(Task::WriteFile(task));
    Ok(())
}

fn handle_send_file_data(client: &Arc<LauncherClient>, payload: Bytes) -> Result<()> {
    let msg = SendFileData::decode(payload)?;

    let Some(task) = client.write_task(&msg.path) else {
        warn!(path = %msg.path, block = msg.block_index,
            "file data received without a write task");
        return client.send(
            FileDataReceived {
                path: msg.path,
                block_index: msg.block_index,
                result: OpResult::Failure,
            }
            .encode(),
        );
    };

    let block = Arc::new(WriteBlockTask::with_data(
        msg.block_index,
        msg.data.len() as u64,
        msg.data,
    ));
    client.queue.push(Task::WriteBlock { file: task, block });
    Ok(())
}

fn handle_request_finish_write_file(client: &Arc<LauncherClient>, payload: Bytes) -> Result<()> {
    let msg = RequestFinishWriteFile::decode(payload)?;
    info!(path = %msg.path, "finish write file requested");

    let Some(task) = client.write_task(&msg.path) else {
        warn!(path = %msg.path, "finish write requested without a write task");
        return client.send(
            ResponseFinishWriteFile {
                path: msg.path,
                result: OpResult::Failure,
            }
            .encode(),
        );
    };

    task.set_hash(msg.hash);
    task.status.set(TaskStatus::Finishing);
    client.queue.push(Task::WriteFile(task));
    Ok(())
}

fn handle_start_application(client: &Arc<LauncherClient>, payload: Bytes) -> Result<()> {
    let msg = StartApplication::decode(payload)?;
    info!(profile = %msg.profile_name, args = %msg.arguments, "start application requested");

    let params = RunParameters {
        game_config: msg.game_config,
        profile_name: msg.profile_name,
        arguments: msg.arguments,
    };
    let result = client.runner.lock().unwrap().run(&params);
    match result {
        Ok(()) => client.set_run_status(RunStatus::Running),
        Err(e) => {
            error!(error = %e, "starting application failed");
            client.send_log(
                LogLevel::Error,
                "runner",
                &format!("starting application failed: {e}"),
            );
        }
    }
    Ok(())
}

fn handle_stop_application(client: &Arc<LauncherClient>, payload: Bytes) -> Result<()> {
    let msg = StopApplication::decode(payload)?;
    info!(mode = ?msg.mode, "stop application requested");

    let mut runner = client.runner.lock().unwrap();
    match msg.mode {
        StopMode::RequestClose => runner.stop(),
        StopMode::KillProcess => runner.kill(),
    }
    Ok(())
}

// =============================================================================
// Response senders (also called from worker threads)
// =============================================================================

pub(crate) fn send_response_file_layout(
    client: &LauncherClient,
    layout: &FileLayout,
) -> Result<()> {
    let entries = layout
        .snapshot()
        .into_values()
        .map(|entry| crate::protocol::LayoutEntry {
            path: entry.path,
            size: entry.size,
            hash: entry.hash,
        })
        .collect::<Vec<_>>();
    info!(count = entries.len(), "sending file layout");
    client.send(ResponseFileLayout { entries }.encode()?)
}

/// An answer that would not fit in one frame degrades to the empty
/// response, the same form a failed hash computation produces; the server
/// then falls back to a full rewrite for the file.
pub(crate) fn send_response_file_block_hashes(
    client: &LauncherClient,
    path: &str,
    block_size: u32,
    hashes: Vec<Vec<u8>>,
) -> Result<()> {
    let response = ResponseFileBlockHashes {
        path: path.to_string(),
        block_size,
        hashes,
    };
    let frame = match response.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%path, error = %e, "block hashes response too large, answering empty");
            ResponseFileBlockHashes::empty(path, block_size).encode()?
        }
    };
    client.send(frame)
}

pub(crate) fn send_response_delete_file(
    client: &LauncherClient,
    path: &str,
    result: OpResult,
) -> Result<()> {
    client.send(
        ResponseDeleteFile {
            path: path.to_string(),
            result,
        }
        .encode(),
    )
}

pub(crate) fn send_response_write_file(
    client: &LauncherClient,
    path: &str,
    result: OpResult,
) -> Result<()> {
    client.send(
        ResponseWriteFile {
            path: path.to_string(),
            result,
        }
        .encode(),
    )
}

pub(crate) fn send_file_data_received(
    client: &LauncherClient,
    path: &str,
    block_index: u32,
    result: OpResult,
) -> Result<()> {
    client.send(
        FileDataReceived {
            path: path.to_string(),
            block_index,
            result,
        }
        .encode(),
    )
}

pub(crate) fn send_response_finish_write_file(
    client: &LauncherClient,
    path: &str,
    result: OpResult,
) -> Result<()> {
    client.send(
        ResponseFinishWriteFile {
            path: path.to_string(),
            result,
        }
        .encode(),
    )
}
