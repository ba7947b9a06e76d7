//! 入站头部解析器
//!
//! 每个协议把一段已缓冲的字节（外加该协议需要的凭据）解析成统一的
//! [`TargetDescriptor`]。解析器从不修改输入，payload 是输入 `Bytes`
//! 的零拷贝切片（Mandala 除外：它的 payload 指向解密后的缓冲区）。

pub mod mandala;
pub mod shadowsocks;
pub mod socks5;
pub mod trojan;
pub mod vless;

use std::fmt;

use bytes::Bytes;

use crate::common::addr::format_host_port;
use crate::common::{Address, AddressType, ProxyError};

/// 可探测的入站协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vless,
    Trojan,
    Mandala,
    Socks5,
    Shadowsocks,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Vless,
        Protocol::Trojan,
        Protocol::Mandala,
        Protocol::Socks5,
        Protocol::Shadowsocks,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Mandala => "mandala",
            Protocol::Socks5 => "socks5",
            Protocol::Shadowsocks => "ss",
        }
    }

    /// 接受规范名和别名（`shadowsocks`、`socks`）
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "vless" => Some(Protocol::Vless),
            "trojan" => Some(Protocol::Trojan),
            "mandala" => Some(Protocol::Mandala),
            "socks5" | "socks" => Some(Protocol::Socks5),
            "ss" | "shadowsocks" => Some(Protocol::Shadowsocks),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 每个解析器需要的凭据形态
#[derive(Debug, Clone, Copy)]
pub enum CredentialMaterial<'a> {
    /// VLESS: 主/副标识符
    Identifiers(&'a [&'a str]),
    /// Trojan / Mandala: 共享密钥
    Secret(&'a str),
    /// Shadowsocks / SOCKS5
    None,
}

/// 成功探测的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub protocol: Protocol,
    pub address_type: AddressType,
    /// IPv6 不带方括号
    pub address: String,
    pub port: u16,
    /// 仅 VLESS 的 DNS (53) 请求为 true
    pub is_udp: bool,
    /// 已缓冲、属于目的地的字节
    pub payload: Bytes,
    /// 首个回包前需要且只需要发送一次的前导字节
    pub response_header: Option<Bytes>,
}

impl TargetDescriptor {
    pub fn to_address(&self) -> Address {
        Address::from_host(&self.address, self.port)
    }

    /// `host:port`，IPv6 加方括号
    pub fn host_port(&self) -> String {
        format_host_port(&self.address, self.port)
    }
}

/// 头部解析器
pub trait HeaderParser: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn parse(&self, buf: &Bytes, creds: CredentialMaterial<'_>) -> Result<TargetDescriptor, ProxyError>;
}

/// 固定的探测顺序：先尝试有强校验的格式，最后才是几乎无校验的 Shadowsocks
pub static REGISTRY: [&(dyn HeaderParser); 5] = [
    &vless::VlessParser,
    &trojan::TrojanParser,
    &mandala::MandalaParser,
    &socks5::Socks5Parser,
    &shadowsocks::ShadowsocksParser,
];

/// 读取固定下标的字节，越界视为数据不足
pub(crate) fn byte_at(buf: &[u8], idx: usize, what: &str) -> Result<u8, ProxyError> {
    buf.get(idx)
        .copied()
        .ok_or_else(|| ProxyError::ShortBuffer(what.to_string()))
}

/// 解码 SOCKS 风格的 [ATYP][ADDR][PORT]，返回 (类型, 地址, 端口, 下一个偏移)
pub(crate) fn decode_socks_target(
    buf: &[u8],
    offset: usize,
) -> Result<(AddressType, String, u16, usize), ProxyError> {
    let atyp = AddressType::from_socks(byte_at(buf, offset, "address type")?)?;
    let (address, next) = crate::common::addr::decode_address(buf, offset + 1, atyp)?;
    let (port, next) = crate::common::addr::decode_port(buf, next)?;
    Ok((atyp, address, port, next))
}

#[cfg(test)]
pub(crate) mod test_util {
    use bytes::{BufMut, BytesMut};

    use crate::common::credential::password_hash;

    pub const UUID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";
    pub const SECRET: &str = "correct horse battery staple";

    /// 构造 VLESS 请求头
    pub fn vless_header(uuid: &str, cmd: u8, port: u16, atyp: u8, addr: &[u8], payload: &[u8]) -> BytesMut {
        let id = uuid::Uuid::parse_str(uuid).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_slice(id.as_bytes());
        buf.put_u8(0);
        buf.put_u8(cmd);
        buf.put_u16(port);
        buf.put_u8(atyp);
        buf.put_slice(addr);
        buf.put_slice(payload);
        buf
    }

    /// SOCKS 风格的 ATYP + ADDR + PORT
    pub fn socks_target(atyp: u8, addr: &[u8], port: u16) -> Vec<u8> {
        let mut v = vec![atyp];
        v.extend_from_slice(addr);
        v.extend_from_slice(&port.to_be_bytes());
        v
    }

    /// 构造 Trojan 请求头
    pub fn trojan_header(secret: &str, target: &[u8], payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(password_hash(secret).as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_u8(1);
        buf.put_slice(target);
        buf.put_slice(b"\r\n");
        buf.put_slice(payload);
        buf
    }

    /// 构造明文 Mandala 头（加盐前）
    pub fn mandala_plain(secret: &str, padding: &[u8], target: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(password_hash(secret).as_bytes());
        v.push(padding.len() as u8);
        v.extend_from_slice(padding);
        v.push(1);
        v.extend_from_slice(target);
        v.extend_from_slice(b"\r\n");
        v.extend_from_slice(payload);
        v
    }

    pub fn domain(name: &str) -> Vec<u8> {
        let mut v = vec![name.len() as u8];
        v.extend_from_slice(name.as_bytes());
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_order_is_fixed() {
        let names: Vec<&str> = REGISTRY.iter().map(|p| p.protocol().name()).collect();
        assert_eq!(names, vec!["vless", "trojan", "mandala", "socks5", "ss"]);
    }

    #[test]
    fn protocol_name_aliases() {
        assert_eq!(Protocol::from_name("Shadowsocks"), Some(Protocol::Shadowsocks));
        assert_eq!(Protocol::from_name("socks"), Some(Protocol::Socks5));
        assert_eq!(Protocol::from_name("xhttp"), None);
        for p in Protocol::ALL {
            assert_eq!(Protocol::from_name(p.name()), Some(p));
        }
    }

    #[test]
    fn descriptor_host_port_brackets_ipv6() {
        let target = TargetDescriptor {
            protocol: Protocol::Vless,
            address_type: AddressType::Ipv6,
            address: "2001:db8:0:0:0:0:0:1".into(),
            port: 443,
            is_udp: false,
            payload: Bytes::new(),
            response_header: None,
        };
        assert_eq!(target.host_port(), "[2001:db8:0:0:0:0:0:1]:443");
        assert_eq!(target.to_address().port(), 443);
    }
}
