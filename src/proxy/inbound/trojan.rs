use bytes::Bytes;

use super::{byte_at, decode_socks_target, CredentialMaterial, HeaderParser, Protocol, TargetDescriptor};
use crate::common::credential::password_hash;
use crate::common::ProxyError;

/// hex(SHA224) 长度
const HASH_LEN: usize = 56;
const MIN_HEADER_LEN: usize = HASH_LEN + 2;
const CMD_CONNECT: u8 = 0x01;

/// Trojan 请求头
///
/// 格式:
/// [hex(SHA224(password)): 56 bytes ASCII]
/// [CRLF]
/// [CMD: 1 byte]
/// [ATYP + ADDR + PORT]
/// [CRLF]
/// [payload]
pub struct TrojanParser;

impl HeaderParser for TrojanParser {
    fn protocol(&self) -> Protocol {
        Protocol::Trojan
    }

    fn parse(&self, buf: &Bytes, creds: CredentialMaterial<'_>) -> Result<TargetDescriptor, ProxyError> {
        let CredentialMaterial::Secret(secret) = creds else {
            return Err(ProxyError::Config("trojan requires a secret".into()));
        };
        if buf.len() < MIN_HEADER_LEN {
            return Err(ProxyError::ShortBuffer("trojan header".into()));
        }

        if &buf[..HASH_LEN] != password_hash(secret).as_bytes() {
            return Err(ProxyError::AuthenticationFailed("invalid trojan password".into()));
        }
        if &buf[HASH_LEN..MIN_HEADER_LEN] != b"\r\n" {
            return Err(ProxyError::Protocol("trojan header missing CRLF".into()));
        }

        // CMD + ATYP + 至少 2 字节
        if buf.len() < MIN_HEADER_LEN + 4 {
            return Err(ProxyError::ShortBuffer("trojan request".into()));
        }
        let command = buf[MIN_HEADER_LEN];
        if command != CMD_CONNECT {
            return Err(ProxyError::UnsupportedCommand(format!("trojan command {}", command)));
        }

        let (address_type, address, port, next) = decode_socks_target(buf, MIN_HEADER_LEN + 1)?;
        expect_crlf(buf, next, "trojan")?;

        Ok(TargetDescriptor {
            protocol: Protocol::Trojan,
            address_type,
            address,
            port,
            is_udp: false,
            payload: buf.slice(next + 2..),
            response_header: None,
        })
    }
}

/// 请求尾部必须是 CRLF：不够两字节是数据不足，内容不对是格式错误
pub(crate) fn expect_crlf(buf: &[u8], at: usize, what: &str) -> Result<(), ProxyError> {
    let cr = byte_at(buf, at, what)?;
    let lf = byte_at(buf, at + 1, what)?;
    if cr != b'\r' || lf != b'\n' {
        return Err(ProxyError::Protocol(format!("{} request missing CRLF", what)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{AddressType, ProxyErrorKind};
    use crate::proxy::inbound::test_util::{domain, socks_target, trojan_header, SECRET};

    fn parse(buf: &[u8]) -> Result<TargetDescriptor, ProxyError> {
        TrojanParser.parse(&Bytes::copy_from_slice(buf), CredentialMaterial::Secret(SECRET))
    }

    #[test]
    fn parses_domain_request() {
        let buf = trojan_header(SECRET, &socks_target(3, &domain("example.com"), 443), b"hello");
        let target = parse(&buf).unwrap();
        assert_eq!(target.protocol, Protocol::Trojan);
        assert_eq!(target.address_type, AddressType::Domain);
        assert_eq!(target.address, "example.com");
        assert_eq!(target.port, 443);
        assert_eq!(&target.payload[..], b"hello");
        assert!(target.response_header.is_none());
    }

    #[test]
    fn parses_ipv4_and_ipv6() {
        let buf = trojan_header(SECRET, &socks_target(1, &[93, 184, 216, 34], 80), b"");
        let target = parse(&buf).unwrap();
        assert_eq!(target.address, "93.184.216.34");
        assert!(target.payload.is_empty());

        let mut v6 = [0u8; 16];
        v6[0] = 0xfe;
        v6[1] = 0x80;
        v6[15] = 0x02;
        let buf = trojan_header(SECRET, &socks_target(4, &v6, 443), b"");
        let target = parse(&buf).unwrap();
        assert_eq!(target.address, "fe80:0:0:0:0:0:0:2");
        assert_eq!(target.address_type, AddressType::Ipv6);
    }

    #[test]
    fn wrong_password_is_auth_failure_not_short() {
        let buf = trojan_header("other secret", &socks_target(3, &domain("example.com"), 443), b"");
        assert_eq!(parse(&buf).unwrap_err().kind(), ProxyErrorKind::AuthenticationFailed);
        // exactly 58 bytes of garbage
        assert_eq!(
            parse(&[b'z'; 58]).unwrap_err().kind(),
            ProxyErrorKind::AuthenticationFailed
        );
    }

    #[test]
    fn short_buffers() {
        let buf = trojan_header(SECRET, &socks_target(3, &domain("example.com"), 443), b"");
        assert_eq!(parse(&buf[..57]).unwrap_err().kind(), ProxyErrorKind::ShortBuffer);
        assert_eq!(parse(&buf[..60]).unwrap_err().kind(), ProxyErrorKind::ShortBuffer);
        // trailing CRLF cut off
        assert_eq!(
            parse(&buf[..buf.len() - 1]).unwrap_err().kind(),
            ProxyErrorKind::ShortBuffer
        );
    }

    #[test]
    fn bad_trailer_and_command() {
        let mut buf = trojan_header(SECRET, &socks_target(1, &[1, 1, 1, 1], 443), b"");
        let n = buf.len();
        buf[n - 1] = b'x';
        assert_eq!(parse(&buf).unwrap_err().kind(), ProxyErrorKind::Protocol);

        let mut buf = trojan_header(SECRET, &socks_target(1, &[1, 1, 1, 1], 443), b"");
        buf[58] = 3;
        assert_eq!(parse(&buf).unwrap_err().kind(), ProxyErrorKind::UnsupportedCommand);

        let mut buf = trojan_header(SECRET, &socks_target(1, &[1, 1, 1, 1], 443), b"");
        buf[56] = b'\n';
        assert_eq!(parse(&buf).unwrap_err().kind(), ProxyErrorKind::Protocol);
    }
}
