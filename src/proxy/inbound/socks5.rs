use bytes::Bytes;

use super::{decode_socks_target, CredentialMaterial, HeaderParser, Protocol, TargetDescriptor};
use crate::common::ProxyError;

const SOCKS5_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 CONNECT 请求（握手和认证已在会话层完成）
///
/// [VER=5] [CMD=1] [RSV=0] [ATYP + ADDR + PORT] [payload]
pub struct Socks5Parser;

impl HeaderParser for Socks5Parser {
    fn protocol(&self) -> Protocol {
        Protocol::Socks5
    }

    fn parse(&self, buf: &Bytes, _creds: CredentialMaterial<'_>) -> Result<TargetDescriptor, ProxyError> {
        if buf.len() < 4 {
            return Err(ProxyError::ShortBuffer("socks5 request".into()));
        }
        if buf[0] != SOCKS5_VERSION {
            return Err(ProxyError::Protocol(format!("socks version {}", buf[0])));
        }
        if buf[1] != CMD_CONNECT {
            return Err(ProxyError::UnsupportedCommand(format!("socks5 command {}", buf[1])));
        }
        if buf[2] != 0x00 {
            return Err(ProxyError::Protocol("socks5 reserved byte must be zero".into()));
        }

        let (address_type, address, port, next) = decode_socks_target(buf, 3)?;

        Ok(TargetDescriptor {
            protocol: Protocol::Socks5,
            address_type,
            address,
            port,
            is_udp: false,
            payload: buf.slice(next..),
            response_header: None,
        })
    }
}
