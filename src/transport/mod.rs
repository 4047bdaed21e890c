//! Frame transport over a reliable byte stream.
//!
//! Carries two channels over one TCP connection: protocol messages and the
//! linked-state channel. Every frame is length-prefixed; the transport
//! guarantees ordered delivery per direction.
//!
//! Frame format: len:u32 LE | kind:u8 | body (len bytes)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{RunStatus, FRAME_MESSAGE};

/// Maximum frame size (16 MiB). Bounds allocation for corrupt or hostile
/// length fields; also bounds a single-message layout response.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame kind: link a shared state value (server to client).
pub const FRAME_LINK_STATE: u8 = 1;
/// Frame kind: push a new value of a linked state (writer to observer).
pub const FRAME_LINK_UPDATE: u8 = 2;

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Frame {
    /// Protocol message body, message code still at the front.
    Message(Bytes),
    LinkState { code: u8, value: u8 },
    LinkUpdate { code: u8, value: u8 },
}

/// Read a single frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let mut head = [0u8; 5];
    if let Err(e) = r.read_exact(&mut head).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => Error::TransportClosed,
            _ => Error::Io(e),
        });
    }
    let len = u32::from_le_bytes(head[0..4].try_into().unwrap());
    let kind = head[4];

    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    let mut body = vec![0u8; len as usize];
    if let Err(e) = r.read_exact(&mut body).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => Error::TransportClosed,
            _ => Error::Io(e),
        });
    }

    match kind {
        FRAME_MESSAGE => Ok(Frame::Message(Bytes::from(body))),
        FRAME_LINK_STATE | FRAME_LINK_UPDATE => {
            if body.len() != 2 {
                return Err(Error::Protocol("malformed link frame".into()));
            }
            if kind == FRAME_LINK_STATE {
                Ok(Frame::LinkState {
                    code: body[0],
                    value: body[1],
                })
            } else {
                Ok(Frame::LinkUpdate {
                    code: body[0],
                    value: body[1],
                })
            }
        }
        other => Err(Error::Protocol(format!("unknown frame kind {other}"))),
    }
}

/// Encode a link-state creation frame.
pub fn link_state_frame(code: u8, value: u8) -> Bytes {
    Bytes::from(vec![2, 0, 0, 0, FRAME_LINK_STATE, code, value])
}

/// Encode a link-value update frame.
pub fn link_update_frame(code: u8, value: u8) -> Bytes {
    Bytes::from(vec![2, 0, 0, 0, FRAME_LINK_UPDATE, code, value])
}

// =============================================================================
// Outbound message queue
// =============================================================================

/// Thread-safe FIFO of encoded outbound frames.
///
/// Any thread may push; a single writer task drains the queue to the
/// socket, so all sends serialize through one place.
#[derive(Debug, Default)]
pub struct MessageQueue {
    frames: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a frame. Returns false if the connection is gone.
    pub fn push(&self, frame: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.frames.lock().unwrap().push_back(frame);
        self.notify.notify_one();
        true
    }

    pub fn pop_all(&self) -> Vec<Bytes> {
        self.frames.lock().unwrap().drain(..).collect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Drain the queue to the stream until the queue closes or the stream fails.
pub async fn run_writer<W: AsyncWrite + Unpin>(queue: std::sync::Arc<MessageQueue>, mut w: W) {
    loop {
        let batch = queue.pop_all();
        if batch.is_empty() {
            if queue.is_closed() {
                break;
            }
            queue.wait().await;
            continue;
        }
        for frame in batch {
            if let Err(e) = w.write_all(&frame).await {
                debug!(error = %e, "send path failed, closing outbound queue");
                queue.close();
                return;
            }
        }
        if let Err(e) = w.flush().await {
            debug!(error = %e, "flush failed, closing outbound queue");
            queue.close();
            return;
        }
    }
    let _ = w.shutdown().await;
}

// =============================================================================
// Linked run state
// =============================================================================

/// Small shared value pushed across the link. The client holds write
/// access; the server observes value changes.
#[derive(Debug, Default)]
pub struct LinkedRunState {
    linked: AtomicBool,
    status: AtomicU8,
}

impl LinkedRunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, initial: RunStatus) {
        self.status.store(initial as u8, Ordering::Release);
        self.linked.store(true, Ordering::Release);
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub fn get(&self) -> RunStatus {
        RunStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Store a new value. Returns true when the value actually changed.
    pub fn set(&self, status: RunStatus) -> bool {
        self.status.swap(status as u8, Ordering::AcqRel) != status as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_message_frame_roundtrip() {
        let frame = crate::protocol::keep_alive_frame();
        let mut cursor = std::io::Cursor::new(frame.to_vec());
        match read_frame(&mut cursor).await.unwrap() {
            Frame::Message(body) => {
                assert_eq!(body[0], crate::protocol::MessageCode::KeepAlive as u8)
            }
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_link_frames_roundtrip() {
        let mut data = link_state_frame(1, 0).to_vec();
        data.extend_from_slice(&link_update_frame(1, 1));
        let mut cursor = std::io::Cursor::new(data);

        match read_frame(&mut cursor).await.unwrap() {
            Frame::LinkState { code, value } => {
                assert_eq!(code, 1);
                assert_eq!(value, 0);
            }
            other => panic!("expected link state, got {other:?}"),
        }
        match read_frame(&mut cursor).await.unwrap() {
            Frame::LinkUpdate { code, value } => {
                assert_eq!(code, 1);
                assert_eq!(value, 1);
            }
            other => panic!("expected link update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_maps_to_transport_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(crate::error::Error::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut data = ((MAX_FRAME_SIZE + 1).to_le_bytes()).to_vec();
        data.push(FRAME_MESSAGE);
        let mut cursor = std::io::Cursor::new(data);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(crate::error::Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_drains_and_shuts_down() {
        let queue = Arc::new(MessageQueue::new());
        queue.push(Bytes::from_static(b"one"));
        queue.push(Bytes::from_static(b"two"));
        queue.close();

        let mut out = Vec::new();
        run_writer(queue, &mut out).await;
        assert_eq!(out, b"onetwo");
    }

    #[test]
    fn test_push_after_close_is_dropped() {
        let queue = MessageQueue::new();
        queue.close();
        assert!(!queue.push(Bytes::from_static(b"late")));
        assert!(queue.pop_all().is_empty());
    }

    #[test]
    fn test_linked_run_state_change_detection() {
        let state = LinkedRunState::new();
        state.link(RunStatus::Stopped);
        assert!(state.is_linked());
        assert!(state.set(RunStatus::Running));
        assert!(!state.set(RunStatus::Running));
        assert_eq!(state.get(), RunStatus::Running);
    }
}
