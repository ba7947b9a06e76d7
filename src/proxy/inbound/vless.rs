use bytes::Bytes;

use super::{byte_at, CredentialMaterial, HeaderParser, Protocol, TargetDescriptor};
use crate::common::addr::{decode_address, decode_port};
use crate::common::{AddressType, ProxyError};

const MIN_HEADER_LEN: usize = 24;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;

/// VLESS 请求头
///
/// [Version: 1B] [UUID: 16B] [AddonsLen: 1B] [Addons: N] [Cmd: 1B] [Port: 2B] [AddrType: 1B] [Addr: N]
pub struct VlessParser;

impl HeaderParser for VlessParser {
    fn protocol(&self) -> Protocol {
        Protocol::Vless
    }

    fn parse(&self, buf: &Bytes, creds: CredentialMaterial<'_>) -> Result<TargetDescriptor, ProxyError> {
        let CredentialMaterial::Identifiers(ids) = creds else {
            return Err(ProxyError::Config("vless requires identifiers".into()));
        };
        if buf.len() < MIN_HEADER_LEN {
            return Err(ProxyError::ShortBuffer("vless header".into()));
        }

        let version = buf[0];
        if version != 0x00 {
            return Err(ProxyError::Protocol(format!("invalid vless version: {}", version)));
        }

        let id = uuid::Uuid::from_slice(&buf[1..17])
            .map_err(|e| ProxyError::Protocol(format!("vless id: {}", e)))?;
        let mut id_buf = uuid::Uuid::encode_buffer();
        let id = id.hyphenated().encode_lower(&mut id_buf);
        if !ids.iter().any(|expected| expected.eq_ignore_ascii_case(id)) {
            return Err(ProxyError::AuthenticationFailed("invalid vless user".into()));
        }

        let addons_len = buf[17] as usize;
        let command = byte_at(buf, 18 + addons_len, "vless command")?;
        let is_udp = match command {
            CMD_TCP => false,
            CMD_UDP => true,
            other => {
                return Err(ProxyError::UnsupportedCommand(format!("vless command {}", other)));
            }
        };

        let (port, next) = decode_port(buf, 19 + addons_len)?;
        let address_type = AddressType::from_vless(byte_at(buf, next, "vless address type")?)?;
        let (address, payload_start) = decode_address(buf, next + 1, address_type)?;

        if is_udp && port != 53 {
            return Err(ProxyError::UnsupportedCommand("udp is only relayed for dns (53)".into()));
        }

        Ok(TargetDescriptor {
            protocol: Protocol::Vless,
            address_type,
            address,
            port,
            is_udp,
            payload: buf.slice(payload_start..),
            response_header: Some(Bytes::from(vec![version, 0x00])),
        })
    }
}
