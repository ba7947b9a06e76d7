use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use super::error::ProxyError;

/// 目标地址类型（与具体协议的编号无关）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Ipv4,
    Ipv6,
    Domain,
}

impl AddressType {
    /// VLESS 编号: 0x01=IPv4, 0x02=Domain, 0x03=IPv6
    pub fn from_vless(atyp: u8) -> Result<Self, ProxyError> {
        match atyp {
            0x01 => Ok(AddressType::Ipv4),
            0x02 => Ok(AddressType::Domain),
            0x03 => Ok(AddressType::Ipv6),
            other => Err(ProxyError::InvalidAddressType(format!(
                "vless address type 0x{:02x}",
                other
            ))),
        }
    }

    /// SOCKS5 编号（Trojan / Shadowsocks / Mandala 共用）: 0x01=IPv4, 0x03=Domain, 0x04=IPv6
    pub fn from_socks(atyp: u8) -> Result<Self, ProxyError> {
        match atyp {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            other => Err(ProxyError::InvalidAddressType(format!(
                "socks address type 0x{:02x}",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AddressType::Ipv4 => "ipv4",
            AddressType::Ipv6 => "ipv6",
            AddressType::Domain => "domain",
        }
    }
}

/// 从 `buf[offset..]` 解码一个地址字段，返回 (地址字符串, 下一个偏移)
///
/// - IPv4: 4 字节，点分十进制
/// - IPv6: 16 字节，冒号分隔的 8 组十六进制（不做零压缩，不带方括号）
/// - Domain: 1 字节长度 + UTF-8 字节
pub fn decode_address(
    buf: &[u8],
    offset: usize,
    atyp: AddressType,
) -> Result<(String, usize), ProxyError> {
    match atyp {
        AddressType::Ipv4 => {
            let end = offset + 4;
            if buf.len() < end {
                return Err(ProxyError::ShortBuffer("ipv4 address".into()));
            }
            let b = &buf[offset..end];
            Ok((Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string(), end))
        }
        AddressType::Ipv6 => {
            let end = offset + 16;
            if buf.len() < end {
                return Err(ProxyError::ShortBuffer("ipv6 address".into()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[offset..end]);
            Ok((format_ipv6(&octets), end))
        }
        AddressType::Domain => {
            let Some(&len) = buf.get(offset) else {
                return Err(ProxyError::ShortBuffer("domain length".into()));
            };
            let start = offset + 1;
            let end = start + len as usize;
            if buf.len() < end {
                return Err(ProxyError::ShortBuffer("domain".into()));
            }
            if len == 0 {
                return Err(ProxyError::InvalidAddressType("empty domain".into()));
            }
            let domain = std::str::from_utf8(&buf[start..end])
                .map_err(|_| ProxyError::Protocol("domain is not valid utf-8".into()))?;
            Ok((domain.to_string(), end))
        }
    }
}

/// 读取大端 2 字节端口
pub fn decode_port(buf: &[u8], offset: usize) -> Result<(u16, usize), ProxyError> {
    if buf.len() < offset + 2 {
        return Err(ProxyError::ShortBuffer("port".into()));
    }
    Ok((u16::from_be_bytes([buf[offset], buf[offset + 1]]), offset + 2))
}

/// 8 组十六进制，不补零也不压缩
pub fn format_ipv6(octets: &[u8; 16]) -> String {
    let groups: Vec<String> = octets
        .chunks_exact(2)
        .map(|pair| format!("{:x}", u16::from_be_bytes([pair[0], pair[1]])))
        .collect();
    groups.join(":")
}

/// `host:port`，IPv6 字面量加方括号
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// 代理目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// 由主机字符串构造：能解析为 IP 的走 `Ip`，否则当作域名
    pub fn from_host(host: &str, port: u16) -> Self {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 编码为 SOCKS5 地址格式 [ATYP][ADDR][PORT]
    pub fn encode_socks5(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(0x04);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                buf.put_u8(0x03);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
