//! Launcher protocol message types.
//!
//! Request/response pairs between the distribution server and the launcher
//! client, one message per frame. The first payload byte is the message
//! code; remaining bytes are positional fields.
//!
//! Wire format: all multi-byte integers are little-endian.
//! Strings and hashes are length-prefixed (`str8` = u8 len, `str16` = u16 len).
//! Frame format: len:u32 | kind:u8 | code:u8 | payload

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::transport::MAX_FRAME_SIZE;

/// Hello signature sent by the launcher client.
pub const SIGNATURE_CLIENT: &[u8; 16] = b"DERemLaunchCnt-0";

/// Hello signature sent by the server.
pub const SIGNATURE_SERVER: &[u8; 16] = b"DERemLaunchSrv-0";

/// Feature bits supported by this implementation. None are defined yet.
pub const SUPPORTED_FEATURES: u32 = 0;

// =============================================================================
// Message codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageCode {
    ConnectRequest = 1,
    ConnectAccepted = 2,
    RequestFileLayout = 3,
    ResponseFileLayout = 4,
    RequestFileBlockHashes = 5,
    ResponseFileBlockHashes = 6,
    RequestDeleteFile = 7,
    ResponseDeleteFile = 8,
    RequestWriteFile = 9,
    ResponseWriteFile = 10,
    SendFileData = 11,
    FileDataReceived = 12,
    RequestFinishWriteFile = 13,
    ResponseFinishWriteFile = 14,
    StartApplication = 15,
    StopApplication = 16,
    Logs = 17,
    KeepAlive = 18,
}

impl MessageCode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::ConnectRequest),
            2 => Some(Self::ConnectAccepted),
            3 => Some(Self::RequestFileLayout),
            4 => Some(Self::ResponseFileLayout),
            5 => Some(Self::RequestFileBlockHashes),
            6 => Some(Self::ResponseFileBlockHashes),
            7 => Some(Self::RequestDeleteFile),
            8 => Some(Self::ResponseDeleteFile),
            9 => Some(Self::RequestWriteFile),
            10 => Some(Self::ResponseWriteFile),
            11 => Some(Self::SendFileData),
            12 => Some(Self::FileDataReceived),
            13 => Some(Self::RequestFinishWriteFile),
            14 => Some(Self::ResponseFinishWriteFile),
            15 => Some(Self::StartApplication),
            16 => Some(Self::StopApplication),
            17 => Some(Self::Logs),
            18 => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

/// Link codes for the shared-state channel.
pub const LINK_RUN_STATE: u8 = 1;

// =============================================================================
// Field enums
// =============================================================================

/// Result byte carried by every response message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpResult {
    Success = 0,
    Failure = 1,
}

impl OpResult {
    pub fn from_u8(b: u8) -> Self {
        if b == 0 {
            Self::Success
        } else {
            Self::Failure
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<bool> for OpResult {
    fn from(ok: bool) -> Self {
        if ok {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// How the server wants the running application stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopMode {
    RequestClose = 0,
    KillProcess = 1,
}

impl StopMode {
    pub fn from_u8(b: u8) -> Self {
        if b == 1 {
            Self::KillProcess
        } else {
            Self::RequestClose
        }
    }
}

/// Severity of a forwarded log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogLevel {
    Info = 0,
    Warning = 1,
    Error = 2,
}

impl LogLevel {
    pub fn from_u8(b: u8) -> Self {
        match b {
            2 => Self::Error,
            1 => Self::Warning,
            _ => Self::Info,
        }
    }
}

/// Value of the linked run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunStatus {
    Stopped = 0,
    Running = 1,
}

impl RunStatus {
    pub fn from_u8(b: u8) -> Self {
        if b == 1 {
            Self::Running
        } else {
            Self::Stopped
        }
    }
}

// =============================================================================
// Encode/decode helpers
// =============================================================================

/// Frame kind for protocol messages. Link frames are defined in `transport`.
pub const FRAME_MESSAGE: u8 = 0;

fn finish_frame(body: BytesMut) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_u8(FRAME_MESSAGE);
    buf.extend_from_slice(&body);
    buf.freeze()
}

/// Finish a frame whose body is unbounded in principle. Failing here keeps
/// an oversized response a local error instead of a protocol violation on
/// the receiving side.
fn finish_frame_checked(body: BytesMut, what: &str) -> Result<Bytes> {
    if 5 + body.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::Protocol(format!(
            "{what} of {} bytes exceeds maximum frame size {MAX_FRAME_SIZE}",
            body.len()
        )));
    }
    Ok(finish_frame(body))
}

fn body(code: MessageCode, capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + capacity);
    buf.put_u8(code as u8);
    buf
}

fn put_str8(buf: &mut BytesMut, data: &[u8]) {
    debug_assert!(data.len() <= u8::MAX as usize);
    buf.put_u8(data.len() as u8);
    buf.put_slice(data);
}

fn put_str16(buf: &mut BytesMut, data: &[u8]) {
    debug_assert!(data.len() <= u16::MAX as usize);
    buf.put_u16_le(data.len() as u16);
    buf.put_slice(data);
}

fn get_str8(payload: &mut Bytes, what: &str) -> Result<Vec<u8>> {
    if payload.remaining() < 1 {
        return Err(Error::Protocol(format!("{what}: length truncated")));
    }
    let len = payload.get_u8() as usize;
    if payload.remaining() < len {
        return Err(Error::Protocol(format!("{what}: data truncated")));
    }
    Ok(payload.copy_to_bytes(len).to_vec())
}

fn get_str16(payload: &mut Bytes, what: &str) -> Result<Vec<u8>> {
    if payload.remaining() < 2 {
        return Err(Error::Protocol(format!("{what}: length truncated")));
    }
    let len = payload.get_u16_le() as usize;
    if payload.remaining() < len {
        return Err(Error::Protocol(format!("{what}: data truncated")));
    }
    Ok(payload.copy_to_bytes(len).to_vec())
}

fn get_string8(payload: &mut Bytes, what: &str) -> Result<String> {
    String::from_utf8(get_str8(payload, what)?)
        .map_err(|_| Error::Protocol(format!("{what}: invalid UTF-8")))
}

fn get_string16(payload: &mut Bytes, what: &str) -> Result<String> {
    String::from_utf8(get_str16(payload, what)?)
        .map_err(|_| Error::Protocol(format!("{what}: invalid UTF-8")))
}

fn need(payload: &Bytes, bytes: usize, what: &str) -> Result<()> {
    if payload.remaining() < bytes {
        return Err(Error::Protocol(format!("{what}: payload truncated")));
    }
    Ok(())
}

// =============================================================================
// CONNECT_REQUEST (1)
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub signature: [u8; 16],
    pub features: u32,
    pub client_name: String,
}

impl ConnectRequest {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            signature: *SIGNATURE_CLIENT,
            features: SUPPORTED_FEATURES,
            client_name: client_name.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let name = self.client_name.as_bytes();
        let mut buf = body(MessageCode::ConnectRequest, 16 + 4 + 1 + name.len());
        buf.put_slice(&self.signature);
        buf.put_u32_le(self.features);
        put_str8(&mut buf, name);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        need(&payload, 20, "ConnectRequest")?;
        let mut signature = [0u8; 16];
        payload.copy_to_slice(&mut signature);
        let features = payload.get_u32_le();
        let client_name = get_string8(&mut payload, "ConnectRequest name")?;
        Ok(Self {
            signature,
            features,
            client_name,
        })
    }
}

// =============================================================================
// CONNECT_ACCEPTED (2)
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConnectAccepted {
    pub signature: [u8; 16],
    pub enabled_features: u32,
}

impl ConnectAccepted {
    pub fn new(enabled_features: u32) -> Self {
        Self {
            signature: *SIGNATURE_SERVER,
            enabled_features,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = body(MessageCode::ConnectAccepted, 20);
        buf.put_slice(&self.signature);
        buf.put_u32_le(self.enabled_features);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        need(&payload, 20, "ConnectAccepted")?;
        let mut signature = [0u8; 16];
        payload.copy_to_slice(&mut signature);
        let enabled_features = payload.get_u32_le();
        Ok(Self {
            signature,
            enabled_features,
        })
    }
}

// =============================================================================
// REQUEST_FILE_LAYOUT (3)
// =============================================================================

pub fn request_file_layout_frame() -> Bytes {
    finish_frame(body(MessageCode::RequestFileLayout, 0))
}

// =============================================================================
// RESPONSE_FILE_LAYOUT (4)
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutEntry {
    pub path: String,
    pub size: u64,
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ResponseFileLayout {
    pub entries: Vec<LayoutEntry>,
}

impl ResponseFileLayout {
    pub fn encode(&self) -> Result<Bytes> {
        if self.entries.len() > u32::MAX as usize {
            return Err(Error::Protocol("too many files in layout".into()));
        }
        let mut buf = body(MessageCode::ResponseFileLayout, 4 + self.entries.len() * 48);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            put_str16(&mut buf, entry.path.as_bytes());
            buf.put_u64_le(entry.size);
            put_str8(&mut buf, &entry.hash);
        }
        finish_frame_checked(buf, "file layout response")
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        need(&payload, 4, "ResponseFileLayout")?;
        let count = payload.get_u32_le() as usize;
        let mut entries = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let path = get_string16(&mut payload, "ResponseFileLayout path")?;
            need(&payload, 8, "ResponseFileLayout size")?;
            let size = payload.get_u64_le();
            let hash = get_str8(&mut payload, "ResponseFileLayout hash")?;
            entries.push(LayoutEntry { path, size, hash });
        }
        Ok(Self { entries })
    }
}

// =============================================================================
// REQUEST_FILE_BLOCK_HASHES (5)
// =============================================================================

#[derive(Debug, Clone)]
pub struct RequestFileBlockHashes {
    pub path: String,
    pub block_size: u32,
}

impl RequestFileBlockHashes {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(MessageCode::RequestFileBlockHashes, 2 + self.path.len() + 4);
        put_str16(&mut buf, self.path.as_bytes());
        buf.put_u32_le(self.block_size);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "RequestFileBlockHashes path")?;
        need(&payload, 4, "RequestFileBlockHashes")?;
        let block_size = payload.get_u32_le();
        Ok(Self { path, block_size })
    }
}

// =============================================================================
// RESPONSE_FILE_BLOCK_HASHES (6)
// =============================================================================

#[derive(Debug, Clone)]
pub struct ResponseFileBlockHashes {
    pub path: String,
    pub block_size: u32,
    pub hashes: Vec<Vec<u8>>,
}

impl ResponseFileBlockHashes {
    /// Empty response for a path absent from the layout.
    pub fn empty(path: impl Into<String>, block_size: u32) -> Self {
        Self {
            path: path.into(),
            block_size,
            hashes: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = body(
            MessageCode::ResponseFileBlockHashes,
            2 + self.path.len() + 8 + self.hashes.len() * 33,
        );
        put_str16(&mut buf, self.path.as_bytes());
        buf.put_u32_le(self.hashes.len() as u32);
        buf.put_u32_le(self.block_size);
        for hash in &self.hashes {
            put_str8(&mut buf, hash);
        }
        finish_frame_checked(buf, "file block hashes response")
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "ResponseFileBlockHashes path")?;
        need(&payload, 8, "ResponseFileBlockHashes")?;
        let count = payload.get_u32_le() as usize;
        let block_size = payload.get_u32_le();
        let mut hashes = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            hashes.push(get_str8(&mut payload, "ResponseFileBlockHashes hash")?);
        }
        Ok(Self {
            path,
            block_size,
            hashes,
        })
    }
}

// =============================================================================
// REQUEST_DELETE_FILE (7) / RESPONSE_DELETE_FILE (8)
// =============================================================================

#[derive(Debug, Clone)]
pub struct RequestDeleteFile {
    pub path: String,
}

impl RequestDeleteFile {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(MessageCode::RequestDeleteFile, 2 + self.path.len());
        put_str16(&mut buf, self.path.as_bytes());
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "RequestDeleteFile path")?;
        Ok(Self { path })
    }
}

#[derive(Debug, Clone)]
pub struct ResponseDeleteFile {
    pub path: String,
    pub result: OpResult,
}

impl ResponseDeleteFile {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(MessageCode::ResponseDeleteFile, 2 + self.path.len() + 1);
        put_str16(&mut buf, self.path.as_bytes());
        buf.put_u8(self.result as u8);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "ResponseDeleteFile path")?;
        need(&payload, 1, "ResponseDeleteFile")?;
        let result = OpResult::from_u8(payload.get_u8());
        Ok(Self { path, result })
    }
}

// =============================================================================
// REQUEST_WRITE_FILE (9) / RESPONSE_WRITE_FILE (10)
// =============================================================================

#[derive(Debug, Clone)]
pub struct RequestWriteFile {
    pub path: String,
    pub file_size: u64,
    pub block_size: u64,
    pub block_count: u32,
}

impl RequestWriteFile {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(MessageCode::RequestWriteFile, 2 + self.path.len() + 20);
        put_str16(&mut buf, self.path.as_bytes());
        buf.put_u64_le(self.file_size);
        buf.put_u64_le(self.block_size);
        buf.put_u32_le(self.block_count);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "RequestWriteFile path")?;
        need(&payload, 20, "RequestWriteFile")?;
        let file_size = payload.get_u64_le();
        let block_size = payload.get_u64_le();
        let block_count = payload.get_u32_le();
        Ok(Self {
            path,
            file_size,
            block_size,
            block_count,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResponseWriteFile {
    pub path: String,
    pub result: OpResult,
}

impl ResponseWriteFile {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(MessageCode::ResponseWriteFile, 2 + self.path.len() + 1);
        put_str16(&mut buf, self.path.as_bytes());
        buf.put_u8(self.result as u8);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "ResponseWriteFile path")?;
        need(&payload, 1, "ResponseWriteFile")?;
        let result = OpResult::from_u8(payload.get_u8());
        Ok(Self { path, result })
    }
}

// =============================================================================
// SEND_FILE_DATA (11) / FILE_DATA_RECEIVED (12)
// =============================================================================

#[derive(Debug, Clone)]
pub struct SendFileData {
    pub path: String,
    pub block_index: u32,
    /// Raw block content to the end of the message, no self-length.
    pub data: Bytes,
}

impl SendFileData {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(
            MessageCode::SendFileData,
            2 + self.path.len() + 4 + self.data.len(),
        );
        put_str16(&mut buf, self.path.as_bytes());
        buf.put_u32_le(self.block_index);
        buf.put_slice(&self.data);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "SendFileData path")?;
        need(&payload, 4, "SendFileData")?;
        let block_index = payload.get_u32_le();
        let data = payload.copy_to_bytes(payload.remaining());
        Ok(Self {
            path,
            block_index,
            data,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FileDataReceived {
    pub path: String,
    pub block_index: u32,
    pub result: OpResult,
}

impl FileDataReceived {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(MessageCode::FileDataReceived, 2 + self.path.len() + 5);
        put_str16(&mut buf, self.path.as_bytes());
        buf.put_u32_le(self.block_index);
        buf.put_u8(self.result as u8);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "FileDataReceived path")?;
        need(&payload, 5, "FileDataReceived")?;
        let block_index = payload.get_u32_le();
        let result = OpResult::from_u8(payload.get_u8());
        Ok(Self {
            path,
            block_index,
            result,
        })
    }
}

// =============================================================================
// REQUEST_FINISH_WRITE_FILE (13) / RESPONSE_FINISH_WRITE_FILE (14)
// =============================================================================

#[derive(Debug, Clone)]
pub struct RequestFinishWriteFile {
    pub path: String,
    pub hash: Vec<u8>,
}

impl RequestFinishWriteFile {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(
            MessageCode::RequestFinishWriteFile,
            2 + self.path.len() + 1 + self.hash.len(),
        );
        put_str16(&mut buf, self.path.as_bytes());
        put_str8(&mut buf, &self.hash);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "RequestFinishWriteFile path")?;
        let hash = get_str8(&mut payload, "RequestFinishWriteFile hash")?;
        Ok(Self { path, hash })
    }
}

#[derive(Debug, Clone)]
pub struct ResponseFinishWriteFile {
    pub path: String,
    pub result: OpResult,
}

impl ResponseFinishWriteFile {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(MessageCode::ResponseFinishWriteFile, 2 + self.path.len() + 1);
        put_str16(&mut buf, self.path.as_bytes());
        buf.put_u8(self.result as u8);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string16(&mut payload, "ResponseFinishWriteFile path")?;
        need(&payload, 1, "ResponseFinishWriteFile")?;
        let result = OpResult::from_u8(payload.get_u8());
        Ok(Self { path, result })
    }
}

// =============================================================================
// START_APPLICATION (15) / STOP_APPLICATION (16)
// =============================================================================

#[derive(Debug, Clone)]
pub struct StartApplication {
    pub game_config: String,
    pub profile_name: String,
    pub arguments: String,
}

impl StartApplication {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(
            MessageCode::StartApplication,
            2 + self.game_config.len() + 1 + self.profile_name.len() + 2 + self.arguments.len(),
        );
        put_str16(&mut buf, self.game_config.as_bytes());
        put_str8(&mut buf, self.profile_name.as_bytes());
        put_str16(&mut buf, self.arguments.as_bytes());
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let game_config = get_string16(&mut payload, "StartApplication config")?;
        let profile_name = get_string8(&mut payload, "StartApplication profile")?;
        let arguments = get_string16(&mut payload, "StartApplication arguments")?;
        Ok(Self {
            game_config,
            profile_name,
            arguments,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StopApplication {
    pub mode: StopMode,
}

impl StopApplication {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(MessageCode::StopApplication, 1);
        buf.put_u8(self.mode as u8);
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        need(&payload, 1, "StopApplication")?;
        let mode = StopMode::from_u8(payload.get_u8());
        Ok(Self { mode })
    }
}

// =============================================================================
// LOGS (17) / KEEP_ALIVE (18)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Logs {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

impl Logs {
    pub fn encode(&self) -> Bytes {
        let mut buf = body(
            MessageCode::Logs,
            1 + 1 + self.source.len() + 2 + self.message.len(),
        );
        buf.put_u8(self.level as u8);
        put_str8(&mut buf, self.source.as_bytes());
        put_str16(&mut buf, self.message.as_bytes());
        finish_frame(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        need(&payload, 1, "Logs")?;
        let level = LogLevel::from_u8(payload.get_u8());
        let source = get_string8(&mut payload, "Logs source")?;
        let message = get_string16(&mut payload, "Logs message")?;
        Ok(Self {
            level,
            source,
            message,
        })
    }
}

pub fn keep_alive_frame() -> Bytes {
    finish_frame(body(MessageCode::KeepAlive, 0))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Strip the frame header (4 bytes len + 1 byte kind + 1 byte code).
    fn payload_of(frame: &Bytes) -> Bytes {
        frame.slice(6..)
    }

    #[test]
    fn test_connect_request_roundtrip() {
        let req = ConnectRequest::new("test-client");
        let encoded = req.encode();
        assert_eq!(encoded[5], MessageCode::ConnectRequest as u8);

        let decoded = ConnectRequest::decode(payload_of(&encoded)).unwrap();
        assert_eq!(&decoded.signature, SIGNATURE_CLIENT);
        assert_eq!(decoded.features, 0);
        assert_eq!(decoded.client_name, "test-client");
    }

    #[test]
    fn test_connect_accepted_roundtrip() {
        let msg = ConnectAccepted::new(0);
        let decoded = ConnectAccepted::decode(payload_of(&msg.encode())).unwrap();
        assert_eq!(&decoded.signature, SIGNATURE_SERVER);
        assert_eq!(decoded.enabled_features, 0);
    }

    #[test]
    fn test_frame_length_field() {
        let frame = request_file_layout_frame();
        let len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        // Body is just the message code byte.
        assert_eq!(len, 1);
        assert_eq!(frame[4], FRAME_MESSAGE);
        assert_eq!(frame[5], MessageCode::RequestFileLayout as u8);
    }

    #[test]
    fn test_response_file_layout_roundtrip() {
        let msg = ResponseFileLayout {
            entries: vec![
                LayoutEntry {
                    path: "data/content.pak".to_string(),
                    size: 4096,
                    hash: vec![0xAB; 32],
                },
                LayoutEntry {
                    path: "hello.txt".to_string(),
                    size: 3,
                    hash: vec![0x01; 32],
                },
            ],
        };
        let decoded = ResponseFileLayout::decode(payload_of(&msg.encode().unwrap())).unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[0].path, "data/content.pak");
        assert_eq!(decoded.entries[0].size, 4096);
        assert_eq!(decoded.entries[0].hash, vec![0xAB; 32]);
        assert_eq!(decoded.entries[1].path, "hello.txt");
    }

    #[test]
    fn test_block_hashes_roundtrip() {
        let req = RequestFileBlockHashes {
            path: "data.bin".to_string(),
            block_size: 1_024_000,
        };
        let decoded = RequestFileBlockHashes::decode(payload_of(&req.encode())).unwrap();
        assert_eq!(decoded.path, "data.bin");
        assert_eq!(decoded.block_size, 1_024_000);

        let resp = ResponseFileBlockHashes {
            path: "data.bin".to_string(),
            block_size: 1_024_000,
            hashes: vec![vec![1; 32], vec![2; 32]],
        };
        let decoded =
            ResponseFileBlockHashes::decode(payload_of(&resp.encode().unwrap())).unwrap();
        assert_eq!(decoded.hashes.len(), 2);
        assert_eq!(decoded.block_size, 1_024_000);
        assert_eq!(decoded.hashes[1], vec![2; 32]);
    }

    #[test]
    fn test_empty_block_hashes_response() {
        let resp = ResponseFileBlockHashes::empty("missing.bin", 4096);
        let decoded =
            ResponseFileBlockHashes::decode(payload_of(&resp.encode().unwrap())).unwrap();
        assert_eq!(decoded.path, "missing.bin");
        assert_eq!(decoded.block_size, 4096);
        assert!(decoded.hashes.is_empty());
    }

    #[test]
    fn test_oversized_layout_response_rejected() {
        // Maximum-length str8 hashes push each entry near 300 bytes; 70k
        // entries exceed the 16 MiB frame cap.
        let entries = (0..70_000)
            .map(|i| LayoutEntry {
                path: format!("data/file-{i:06}.pak"),
                size: 1,
                hash: vec![0xAB; 255],
            })
            .collect();
        let msg = ResponseFileLayout { entries };
        assert!(matches!(msg.encode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversized_block_hashes_response_rejected() {
        // The shape a tiny requested block size produces against a large
        // file: far more hashes than one frame can carry.
        let msg = ResponseFileBlockHashes {
            path: "big.bin".to_string(),
            block_size: 1,
            hashes: vec![vec![0x5A; 255]; 70_000],
        };
        assert!(matches!(msg.encode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_write_file_roundtrip() {
        let req = RequestWriteFile {
            path: "big/file.dat".to_string(),
            file_size: 2_048_000,
            block_size: 1_024_000,
            block_count: 2,
        };
        let decoded = RequestWriteFile::decode(payload_of(&req.encode())).unwrap();
        assert_eq!(decoded.path, "big/file.dat");
        assert_eq!(decoded.file_size, 2_048_000);
        assert_eq!(decoded.block_size, 1_024_000);
        assert_eq!(decoded.block_count, 2);
    }

    #[test]
    fn test_send_file_data_raw_tail() {
        let msg = SendFileData {
            path: "f".to_string(),
            block_index: 7,
            data: Bytes::from(vec![9, 8, 7, 6]),
        };
        let decoded = SendFileData::decode(payload_of(&msg.encode())).unwrap();
        assert_eq!(decoded.block_index, 7);
        assert_eq!(decoded.data.as_ref(), &[9, 8, 7, 6]);
    }

    #[test]
    fn test_send_file_data_empty_block() {
        let msg = SendFileData {
            path: "empty".to_string(),
            block_index: 0,
            data: Bytes::new(),
        };
        let decoded = SendFileData::decode(payload_of(&msg.encode())).unwrap();
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_file_data_received_roundtrip() {
        let msg = FileDataReceived {
            path: "f".to_string(),
            block_index: 3,
            result: OpResult::Failure,
        };
        let decoded = FileDataReceived::decode(payload_of(&msg.encode())).unwrap();
        assert_eq!(decoded.block_index, 3);
        assert_eq!(decoded.result, OpResult::Failure);
    }

    #[test]
    fn test_finish_write_roundtrip() {
        let req = RequestFinishWriteFile {
            path: "out.bin".to_string(),
            hash: vec![0x5A; 32],
        };
        let decoded = RequestFinishWriteFile::decode(payload_of(&req.encode())).unwrap();
        assert_eq!(decoded.path, "out.bin");
        assert_eq!(decoded.hash, vec![0x5A; 32]);
    }

    #[test]
    fn test_start_application_roundtrip() {
        let msg = StartApplication {
            game_config: "<config/>".to_string(),
            profile_name: "default".to_string(),
            arguments: "--windowed".to_string(),
        };
        let decoded = StartApplication::decode(payload_of(&msg.encode())).unwrap();
        assert_eq!(decoded.game_config, "<config/>");
        assert_eq!(decoded.profile_name, "default");
        assert_eq!(decoded.arguments, "--windowed");
    }

    #[test]
    fn test_logs_roundtrip() {
        let msg = Logs {
            level: LogLevel::Warning,
            source: "runner".to_string(),
            message: "game exited early".to_string(),
        };
        let decoded = Logs::decode(payload_of(&msg.encode())).unwrap();
        assert_eq!(decoded.level, LogLevel::Warning);
        assert_eq!(decoded.source, "runner");
        assert_eq!(decoded.message, "game exited early");
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let msg = RequestWriteFile {
            path: "x".to_string(),
            file_size: 1,
            block_size: 1,
            block_count: 1,
        };
        let frame = msg.encode();
        let short = frame.slice(6..frame.len() - 4);
        assert!(RequestWriteFile::decode(short).is_err());
    }

    #[test]
    fn test_message_code_from_u8() {
        assert_eq!(MessageCode::from_u8(1), Some(MessageCode::ConnectRequest));
        assert_eq!(MessageCode::from_u8(11), Some(MessageCode::SendFileData));
        assert_eq!(MessageCode::from_u8(18), Some(MessageCode::KeepAlive));
        assert_eq!(MessageCode::from_u8(0), None);
        assert_eq!(MessageCode::from_u8(99), None);
    }

    proptest! {
        #[test]
        fn prop_delete_file_preserves_path(path in "[a-zA-Z0-9_/.-]{1,200}") {
            let req = RequestDeleteFile { path: path.clone() };
            let decoded = RequestDeleteFile::decode(req.encode().slice(6..)).unwrap();
            prop_assert_eq!(decoded.path, path);
        }

        #[test]
        fn prop_send_file_data_preserves_bytes(
            path in "[a-z0-9/]{1,64}",
            index in 0u32..10_000,
            data in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let msg = SendFileData {
                path: path.clone(),
                block_index: index,
                data: Bytes::from(data.clone()),
            };
            let decoded = SendFileData::decode(msg.encode().slice(6..)).unwrap();
            prop_assert_eq!(decoded.path, path);
            prop_assert_eq!(decoded.block_index, index);
            prop_assert_eq!(decoded.data.to_vec(), data);
        }

        #[test]
        fn prop_finish_write_preserves_hash(hash in proptest::collection::vec(any::<u8>(), 32)) {
            let req = RequestFinishWriteFile { path: "p".to_string(), hash: hash.clone() };
            let decoded = RequestFinishWriteFile::decode(req.encode().slice(6..)).unwrap();
            prop_assert_eq!(decoded.hash, hash);
        }
    }
}
