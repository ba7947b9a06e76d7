use bytes::Bytes;

use super::trojan::expect_crlf;
use super::{byte_at, decode_socks_target, CredentialMaterial, HeaderParser, Protocol, TargetDescriptor};
use crate::common::credential::password_hash;
use crate::common::ProxyError;

const SALT_LEN: usize = 4;
const HASH_LEN: usize = 56;
/// Salt(4) + Hash(56) + PadLen(1) + Cmd(1) + Atyp(1) + Port(2) + CRLF(2)
const MIN_RAW_LEN: usize = 67;
const CMD_CONNECT: u8 = 0x01;

/// Mandala 请求头
///
/// 前 4 字节为随机盐，其后所有字节按位置循环异或盐值。解密后：
/// [hex(SHA224(password)): 56B] [PadLen: 1B] [Padding: N] [Cmd: 1B] [ATYP + ADDR + PORT] [CRLF] [payload]
pub struct MandalaParser;

/// `out[i] = raw[i + 4] ^ salt[i & 3]`，加密与解密是同一个变换
pub fn xor_with_salt(raw: &[u8]) -> Vec<u8> {
    let (salt, body) = raw.split_at(SALT_LEN.min(raw.len()));
    if salt.len() < SALT_LEN {
        return Vec::new();
    }
    body.iter()
        .enumerate()
        .map(|(i, b)| b ^ salt[i & 3])
        .collect()
}

impl HeaderParser for MandalaParser {
    fn protocol(&self) -> Protocol {
        Protocol::Mandala
    }

    fn parse(&self, buf: &Bytes, creds: CredentialMaterial<'_>) -> Result<TargetDescriptor, ProxyError> {
        let CredentialMaterial::Secret(secret) = creds else {
            return Err(ProxyError::Config("mandala requires a secret".into()));
        };
        if buf.len() < MIN_RAW_LEN {
            return Err(ProxyError::ShortBuffer("mandala header".into()));
        }

        let decrypted = xor_with_salt(buf);
        if &decrypted[..HASH_LEN] != password_hash(secret).as_bytes() {
            return Err(ProxyError::AuthenticationFailed("invalid mandala auth".into()));
        }

        let padding = decrypted[HASH_LEN] as usize;
        let cursor = HASH_LEN + 1 + padding;
        let command = byte_at(&decrypted, cursor, "mandala command")?;
        if command != CMD_CONNECT {
            return Err(ProxyError::UnsupportedCommand(format!("mandala command {}", command)));
        }

        let (address_type, address, port, next) = decode_socks_target(&decrypted, cursor + 1)?;
        expect_crlf(&decrypted, next, "mandala")?;

        let decrypted = Bytes::from(decrypted);
        Ok(TargetDescriptor {
            protocol: Protocol::Mandala,
            address_type,
            address,
            port,
            is_udp: false,
            payload: decrypted.slice(next + 2..),
            response_header: None,
        })
    }
}
