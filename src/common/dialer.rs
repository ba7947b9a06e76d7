//! Outbound TCP dialer.
//!
//! Applies socket-level options before and after connecting:
//!
//! - Bind to specific source address
//! - Keep-alive settings
//! - TCP_NODELAY
//!
//! Timeouts are not applied here; the outbound connector races each dial
//! against its staged deadline.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use super::error::ProxyError;
use super::stream::ProxyStream;

/// Dialer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Bind to a specific source IP address.
    #[serde(rename = "bind-address")]
    pub bind_address: Option<String>,

    /// TCP keep-alive interval in seconds. 0 = disabled.
    #[serde(rename = "tcp-keep-alive")]
    pub tcp_keep_alive_secs: Option<u64>,
}

/// 打开一条到 host:port 的 TCP 连接
#[async_trait]
pub trait TcpDial: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<ProxyStream, ProxyError>;
}

/// Dialer that applies socket options and connects.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    config: DialerConfig,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }

    /// Connect to the given address, applying all configured socket options.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, ProxyError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(ref bind_addr) = self.config.bind_address {
            let ip: IpAddr = bind_addr
                .parse()
                .map_err(|e| ProxyError::Config(format!("invalid bind address '{}': {}", bind_addr, e)))?;
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        let stream = socket.connect(addr).await?;
        self.apply_post_connect(&stream)?;

        debug!(addr = %addr, "dialer connected");
        Ok(stream)
    }

    /// Resolve host:port with system DNS and connect to the first address.
    pub async fn connect_host(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let addr = match bare.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => tokio::net::lookup_host((bare, port))
                .await?
                .next()
                .ok_or_else(|| {
                    ProxyError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("DNS resolution failed for {}:{}", host, port),
                    ))
                })?,
        };
        self.connect(addr).await
    }

    fn apply_post_connect(&self, stream: &TcpStream) -> Result<(), ProxyError> {
        if let Some(interval) = self.config.tcp_keep_alive_secs {
            if interval > 0 {
                let sock_ref = socket2::SockRef::from(stream);
                let keepalive =
                    socket2::TcpKeepalive::new().with_time(Duration::from_secs(interval));
                sock_ref.set_tcp_keepalive(&keepalive)?;
            }
        }

        // TCP_NODELAY: always on for proxy traffic
        stream.set_nodelay(true)?;

        Ok(())
    }
}

#[async_trait]
impl TcpDial for Dialer {
    async fn dial(&self, host: &str, port: u16) -> Result<ProxyStream, ProxyError> {
        let stream = self.connect_host(host, port).await?;
        Ok(Box::new(stream))
    }
}
