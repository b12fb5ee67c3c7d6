//! HTTP `CONNECT` forward-proxy tunnel.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use chainrelay_core::error::TransportError;
pub use chainrelay_core::proxy::ProxyConfig;

const USER_AGENT: &str = concat!("chainrelay/", env!("CARGO_PKG_VERSION"));
const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Opens tunnels through one proxy.
#[derive(Debug, Clone)]
pub struct ProxyTunnel {
    config: ProxyConfig,
    timeout: Duration,
}

impl ProxyTunnel {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect to the proxy and ask it to tunnel to `addr` (`host:port`).
    /// The returned stream is positioned right after the proxy's response.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream, TransportError> {
        tokio::time::timeout(self.timeout, self.handshake(addr))
            .await
            .map_err(|_| TransportError::Timeout {
                ms: self.timeout.as_millis() as u64,
            })?
    }

    async fn handshake(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let proxy_addr = self.config.address();
        let mut stream = TcpStream::connect(&proxy_addr).await.map_err(|e| {
            TransportError::Proxy(format!("failed to connect to proxy {proxy_addr}: {e}"))
        })?;

        let request = format!(
            "CONNECT {addr} HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Proxy-Authorization: Basic {auth}\r\n\
             User-Agent: {USER_AGENT}\r\n\
             \r\n",
            auth = self.config.basic_auth(),
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| TransportError::Proxy(format!("failed to write CONNECT request: {e}")))?;

        let head = read_response_head(&mut stream).await?;
        let status = parse_status(&head)?;
        if status != 200 {
            let line = head.lines().next().unwrap_or_default();
            return Err(TransportError::Proxy(format!("proxy connection failed: {line}")));
        }

        tracing::debug!(proxy = %proxy_addr, %addr, "proxy tunnel established");
        Ok(stream)
    }
}

/// Read up to and including the blank line ending the response headers, one
/// byte at a time so nothing past it is consumed.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, TransportError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEADER {
            return Err(TransportError::Proxy("CONNECT response header too large".into()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| TransportError::Proxy(format!("failed to read CONNECT response: {e}")))?;
        if n == 0 {
            return Err(TransportError::Proxy(
                "proxy closed the connection before responding".into(),
            ));
        }
        head.push(byte[0]);
    }
    String::from_utf8(head)
        .map_err(|_| TransportError::Proxy("CONNECT response is not valid UTF-8".into()))
}

fn parse_status(head: &str) -> Result<u16, TransportError> {
    let line = head.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| TransportError::Proxy(format!("malformed status line: {line}"))),
        _ => Err(TransportError::Proxy(format!("malformed status line: {line}"))),
    }
}
