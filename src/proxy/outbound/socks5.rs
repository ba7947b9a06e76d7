use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::common::addr::format_host_port;
use crate::common::dialer::TcpDial;
use crate::common::{Address, ProxyError, ProxyStream};

/// 上游 SOCKS5 代理
///
/// 实现 RFC 1928 客户端侧的 CONNECT：
/// - 方法协商（无认证 / 用户名密码）
/// - RFC 1929 用户名密码认证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpstreamProxy {
    /// 解析 `[http(s)://][user:pass@]host:port`，IPv6 主机带方括号
    pub fn parse(s: &str) -> Result<Self, ProxyError> {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        let rest = if lower.starts_with("https://") {
            &s[8..]
        } else if lower.starts_with("http://") {
            &s[7..]
        } else if lower.starts_with("socks5://") {
            &s[9..]
        } else {
            s
        };

        let (auth, server) = match rest.rfind('@') {
            Some(at) => (Some(&rest[..at]), &rest[at + 1..]),
            None => (None, rest),
        };

        let (username, password) = match auth {
            Some(auth) => {
                let parts: Vec<&str> = auth.split(':').collect();
                if parts.len() != 2 {
                    return Err(ProxyError::Config("invalid socks auth format".into()));
                }
                (Some(parts[0].to_string()), Some(parts[1].to_string()))
            }
            None => (None, None),
        };

        let colon = server
            .rfind(':')
            .ok_or_else(|| ProxyError::Config("socks address is missing a port".into()))?;
        let port = server[colon + 1..]
            .parse::<u16>()
            .map_err(|_| ProxyError::Config(format!("invalid socks port in '{}'", server)))?;
        let mut host = &server[..colon];
        if host.starts_with('[') && host.ends_with(']') {
            host = &host[1..host.len() - 1];
        }
        if host.is_empty() {
            return Err(ProxyError::Config("socks address is missing a host".into()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// 连接上游代理并请求到 `target` 的隧道
    pub async fn connect(&self, dialer: &dyn TcpDial, target: &Address) -> Result<ProxyStream, ProxyError> {
        debug!(
            target = %target,
            server = %format_host_port(&self.host, self.port),
            auth = self.has_auth(),
            "socks5 CONNECT"
        );

        let mut stream = dialer.dial(&self.host, self.port).await?;
        self.handshake(&mut stream).await?;
        send_connect(&mut stream, target).await?;

        debug!(target = %target, "socks5 CONNECT tunnel established");
        Ok(stream)
    }

    /// 方法协商 + 可选认证
    async fn handshake(&self, stream: &mut (impl AsyncRead + AsyncWrite + Unpin)) -> Result<(), ProxyError> {
        if self.has_auth() {
            stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
        } else {
            stream.write_all(&[0x05, 0x01, 0x00]).await?;
        }

        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await?;

        if resp[0] != 0x05 {
            return Err(ProxyError::Protocol(format!(
                "socks5: server returned unsupported version: 0x{:02x}",
                resp[0]
            )));
        }

        match (resp[1], &self.username, &self.password) {
            (0x00, _, _) => {
                debug!("socks5: no authentication required");
            }
            (0x02, Some(username), Some(password)) => {
                let mut auth_req = BytesMut::with_capacity(3 + username.len() + password.len());
                auth_req.put_u8(0x01);
                auth_req.put_u8(username.len() as u8);
                auth_req.put_slice(username.as_bytes());
                auth_req.put_u8(password.len() as u8);
                auth_req.put_slice(password.as_bytes());
                stream.write_all(&auth_req).await?;

                let mut auth_resp = [0u8; 2];
                stream.read_exact(&mut auth_resp).await?;
                if auth_resp[1] != 0x00 {
                    return Err(ProxyError::AuthenticationFailed(format!(
                        "socks5: upstream rejected credentials (status: 0x{:02x})",
                        auth_resp[1]
                    )));
                }
                debug!("socks5: authentication successful");
            }
            (0x02, _, _) => {
                return Err(ProxyError::AuthenticationFailed(
                    "socks5: upstream requires credentials".into(),
                ));
            }
            (0xFF, _, _) => {
                return Err(ProxyError::Protocol(
                    "socks5: server rejected all authentication methods".into(),
                ));
            }
            (method, _, _) => {
                return Err(ProxyError::Protocol(format!(
                    "socks5: unsupported auth method selected: 0x{:02x}",
                    method
                )));
            }
        }

        Ok(())
    }
}

impl FromStr for UpstreamProxy {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 发送 CONNECT 并读完回复（包括 BND.ADDR）
async fn send_connect(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    target: &Address,
) -> Result<(), ProxyError> {
    let mut req = BytesMut::with_capacity(64);
    req.put_u8(0x05); // VER
    req.put_u8(0x01); // CMD = CONNECT
    req.put_u8(0x00); // RSV
    target.encode_socks5(&mut req);
    stream.write_all(&req).await?;

    let mut resp_head = [0u8; 4];
    stream.read_exact(&mut resp_head).await?;

    if resp_head[0] != 0x05 {
        return Err(ProxyError::Protocol(format!(
            "socks5: invalid reply version: 0x{:02x}",
            resp_head[0]
        )));
    }
    if resp_head[1] != 0x00 {
        let reason = match resp_head[1] {
            0x01 => "general failure",
            0x02 => "connection not allowed",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unknown error",
        };
        return Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("socks5: request failed: {} (0x{:02x})", reason, resp_head[1]),
        )));
    }

    // BND.ADDR + BND.PORT，内容不使用
    let skip = match resp_head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        atyp => {
            return Err(ProxyError::InvalidAddressType(format!(
                "socks5: unsupported bind address type: 0x{:02x}",
                atyp
            )));
        }
    };
    let mut bind = vec![0u8; skip];
    stream.read_exact(&mut bind).await?;
    Ok(())
}
