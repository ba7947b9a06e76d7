/// 协议探测：按固定顺序逐个尝试解析器，返回第一个成功的结果。
///
/// 探测本身不决定"继续等待"还是"放弃"，只报告失败是否全部是数据不足，
/// 由会话层结合缓冲长度套用 [`should_wait`]。
use std::fmt;

use bytes::Bytes;
use tracing::trace;

use super::inbound::{CredentialMaterial, Protocol, TargetDescriptor, REGISTRY};
use crate::common::{Credentials, ProxyError};

/// 缓冲区低于这个长度时，即使有解析器报告格式错误也继续等待
pub const MIN_DECISIVE_LEN: usize = 512;

/// 所有解析器都失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionFailure {
    /// 每个解析器都只是数据不足
    pub all_short: bool,
    pub message: String,
}

impl fmt::Display for DetectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol detection failed: {}", self.message)
    }
}

impl std::error::Error for DetectionFailure {}

impl From<DetectionFailure> for ProxyError {
    fn from(failure: DetectionFailure) -> Self {
        if failure.all_short {
            ProxyError::ShortBuffer(failure.message)
        } else {
            ProxyError::Protocol(failure.message)
        }
    }
}

/// 为每个协议准备它需要的凭据形态
fn material_for<'a>(protocol: Protocol, ids: &'a [&'a str], creds: &'a Credentials) -> CredentialMaterial<'a> {
    match protocol {
        Protocol::Vless => CredentialMaterial::Identifiers(ids),
        Protocol::Trojan | Protocol::Mandala => CredentialMaterial::Secret(&creds.secret),
        Protocol::Socks5 | Protocol::Shadowsocks => CredentialMaterial::None,
    }
}

/// 对已缓冲的字节做一次完整探测
pub fn detect(buf: &Bytes, creds: &Credentials) -> Result<TargetDescriptor, DetectionFailure> {
    let ids = creds.identifiers();
    let mut all_short = true;
    let mut errors = Vec::with_capacity(REGISTRY.len());

    for parser in REGISTRY.iter() {
        let protocol = parser.protocol();
        match parser.parse(buf, material_for(protocol, &ids, creds)) {
            Ok(target) => {
                trace!(protocol = %protocol, len = buf.len(), "header parsed");
                return Ok(target);
            }
            Err(e) => {
                all_short &= e.is_retryable();
                errors.push(format!("{}: {}", protocol, e));
            }
        }
    }

    Err(DetectionFailure {
        all_short,
        message: errors.join("; "),
    })
}

/// 探测失败后是否继续等待更多字节
///
/// 超过上限一律放弃；否则只要全部是数据不足，或者缓冲还很小，就继续等。
pub fn should_wait(len: usize, all_short: bool, ceiling: usize) -> bool {
    len < ceiling && (all_short || len < MIN_DECISIVE_LEN)
}
