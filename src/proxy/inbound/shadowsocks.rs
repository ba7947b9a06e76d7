use bytes::Bytes;

use super::{decode_socks_target, CredentialMaterial, HeaderParser, Protocol, TargetDescriptor};
use crate::common::ProxyError;

/// 无加密的 Shadowsocks 目的地头：[ATYP + ADDR + PORT] [payload]
///
/// 几乎没有校验，所以总是最后一个被尝试。
pub struct ShadowsocksParser;

impl HeaderParser for ShadowsocksParser {
    fn protocol(&self) -> Protocol {
        Protocol::Shadowsocks
    }

    fn parse(&self, buf: &Bytes, _creds: CredentialMaterial<'_>) -> Result<TargetDescriptor, ProxyError> {
        if buf.len() < 4 {
            return Err(ProxyError::ShortBuffer("shadowsocks header".into()));
        }

        let (address_type, address, port, next) = decode_socks_target(buf, 0)?;

        Ok(TargetDescriptor {
            protocol: Protocol::Shadowsocks,
            address_type,
            address,
            port,
            is_udp: false,
            payload: buf.slice(next..),
            response_header: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{AddressType, ProxyErrorKind};
    use crate::proxy::inbound::test_util::{domain, socks_target};

    fn parse(buf: Vec<u8>) -> Result<TargetDescriptor, ProxyError> {
        ShadowsocksParser.parse(&Bytes::from(buf), CredentialMaterial::None)
    }

    #[test]
    fn parses_each_address_type() {
        let mut v = socks_target(1, &[127, 0, 0, 1], 22);
        v.extend_from_slice(b"SSH-2.0");
        let target = parse(v).unwrap();
        assert_eq!(target.address, "127.0.0.1");
        assert_eq!(target.port, 22);
        assert_eq!(&target.payload[..], b"SSH-2.0");

        let target = parse(socks_target(3, &domain("a.example"), 443)).unwrap();
        assert_eq!(target.address_type, AddressType::Domain);
        assert_eq!(target.address, "a.example");

        let mut v6 = [0u8; 16];
        v6[0] = 0x20;
        v6[1] = 0x01;
        v6[2] = 0x0d;
        v6[3] = 0xb8;
        v6[15] = 0x01;
        let target = parse(socks_target(4, &v6, 853)).unwrap();
        assert_eq!(target.address, "2001:db8:0:0:0:0:0:1");
    }

    #[test]
    fn unknown_address_type() {
        assert_eq!(
            parse(vec![0x16, 0x03, 0x01, 0x00, 0x10]).unwrap_err().kind(),
            ProxyErrorKind::InvalidAddressType
        );
    }

    #[test]
    fn short_input() {
        assert_eq!(parse(vec![1, 2, 3]).unwrap_err().kind(), ProxyErrorKind::ShortBuffer);
        // ipv4 address without port
        assert_eq!(
            parse(vec![1, 10, 0, 0, 1]).unwrap_err().kind(),
            ProxyErrorKind::ShortBuffer
        );
        // domain length larger than the buffer
        assert_eq!(
            parse(vec![3, 20, b'a', b'b']).unwrap_err().kind(),
            ProxyErrorKind::ShortBuffer
        );
    }
}
