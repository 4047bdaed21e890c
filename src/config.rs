//! Peer configuration.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::storage::DEFAULT_BLOCK_SIZE;

/// Default TCP port of the launcher protocol.
pub const DEFAULT_PORT: u16 = 3413;

/// Append the default port to an address given as bare `"host"`.
pub fn resolve_address(address: &str) -> Result<String> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::Config("address must not be empty".into()));
    }
    // A bare IP literal is always a host; "127.0.0.1" must not be read as
    // host "127.0.0" with port 1.
    if let Ok(ip) = address.parse::<std::net::IpAddr>() {
        return Ok(if ip.is_ipv6() {
            format!("[{address}]:{DEFAULT_PORT}")
        } else {
            format!("{address}:{DEFAULT_PORT}")
        });
    }
    // Bracketed IPv6 literals ("[::1]" or "[::1]:3413").
    if let Some(rest) = address.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((_, suffix)) if suffix.starts_with(':') => Ok(address.to_string()),
            Some((_, "")) => Ok(format!("{address}:{DEFAULT_PORT}")),
            _ => Err(Error::Config(format!("invalid address: {address}"))),
        };
    }
    match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => Ok(address.to_string()),
        Some(_) => Err(Error::Config(format!("invalid port in address: {address}"))),
        None => Ok(format!("{address}:{DEFAULT_PORT}")),
    }
}

/// Configuration of the distribution server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding the authoritative data tree.
    pub base_dir: PathBuf,
    /// `"host"` or `"host:port"` to listen on.
    pub listen_address: String,
    /// Cap on files with an outstanding write request.
    pub max_in_progress_files: u32,
    /// Cap on blocks in flight across all files.
    pub max_in_progress_blocks: u32,
    /// Uniform block size for diffing.
    pub block_size: u32,
    /// Worker threads per connected client.
    pub worker_count: usize,
    pub enable_debug_log: bool,
}

impl ServerConfig {
    pub fn new(base_dir: impl Into<PathBuf>, listen_address: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            listen_address: listen_address.into(),
            max_in_progress_files: 1,
            max_in_progress_blocks: 2,
            block_size: DEFAULT_BLOCK_SIZE,
            worker_count: 1,
            enable_debug_log: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(Error::Config("base directory must not be empty".into()));
        }
        if self.max_in_progress_files == 0 || self.max_in_progress_blocks == 0 {
            return Err(Error::Config("in-progress caps must be at least 1".into()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block size must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Configuration of the launcher client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory the server's data tree is synchronized into.
    pub base_dir: PathBuf,
    /// Name identifying this client to the server.
    pub client_name: String,
    /// `"host"` or `"host:port"` of the server.
    pub connect_address: String,
    /// Worker threads draining the task queue.
    pub worker_count: usize,
    pub enable_debug_log: bool,
}

impl ClientConfig {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        client_name: impl Into<String>,
        connect_address: impl Into<String>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            client_name: client_name.into(),
            connect_address: connect_address.into(),
            worker_count: 1,
            enable_debug_log: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(Error::Config("base directory must not be empty".into()));
        }
        if self.client_name.is_empty() {
            return Err(Error::Config("client name must not be empty".into()));
        }
        if self.client_name.len() > u8::MAX as usize {
            return Err(Error::Config("client name longer than 255 bytes".into()));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker count must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_address() {
        assert_eq!(resolve_address("example.net").unwrap(), "example.net:3413");
        assert_eq!(resolve_address("example.net:9000").unwrap(), "example.net:9000");
        assert_eq!(resolve_address("127.0.0.1").unwrap(), "127.0.0.1:3413");
        assert_eq!(resolve_address("127.0.0.1:0").unwrap(), "127.0.0.1:0");
        assert_eq!(resolve_address("::1").unwrap(), "[::1]:3413");
        assert_eq!(resolve_address("[::1]").unwrap(), "[::1]:3413");
        assert_eq!(resolve_address("[::1]:9000").unwrap(), "[::1]:9000");
        assert!(resolve_address("").is_err());
        assert!(resolve_address("host:notaport").is_err());
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::new("/data", "0.0.0.0");
        assert_eq!(config.max_in_progress_files, 1);
        assert_eq!(config.max_in_progress_blocks, 2);
        assert_eq!(config.block_size, 1_024_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_name_length_limit() {
        let mut config = ClientConfig::new("/data", "c", "localhost");
        assert!(config.validate().is_ok());
        config.client_name = "x".repeat(256);
        assert!(config.validate().is_err());
    }
}
