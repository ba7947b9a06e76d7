//! 内嵌的 SOCKS5 交互握手（RFC 1928 方法协商 + RFC 1929 用户名/密码认证）
//!
//! 只有首字节是 0x05 的会话才会进入这里。握手是纯函数式的：
//! 每次给出当前已缓冲的字节，返回"还需要更多数据"、"回复并前进"或"拒绝"。

use bytes::Bytes;

use crate::common::{Credentials, ProxyError};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// 握手阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    AwaitGreeting,
    AwaitAuth,
}

/// 握手完成后的下一阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Auth,
    Detect,
}

#[derive(Debug)]
pub enum Step {
    NeedMore,
    /// 回复 `reply`，从缓冲中丢弃 `consumed` 字节
    Reply {
        consumed: usize,
        reply: Bytes,
        next: Next,
    },
    /// 可选地回复后关闭
    Reject {
        reply: Option<Bytes>,
        error: ProxyError,
    },
}

/// 在给定阶段处理一次缓冲
pub fn step(stage: HandshakeStage, buf: &[u8], creds: &Credentials) -> Step {
    match stage {
        HandshakeStage::AwaitGreeting => greeting(buf),
        HandshakeStage::AwaitAuth => auth(buf, creds),
    }
}

/// [VER] [NMETHODS] [METHODS...]
fn greeting(buf: &[u8]) -> Step {
    if buf.len() < 2 {
        return Step::NeedMore;
    }
    if buf[0] != SOCKS5_VERSION {
        return Step::Reject {
            reply: None,
            error: ProxyError::Protocol(format!("socks version {}", buf[0])),
        };
    }
    let n_methods = buf[1] as usize;
    if buf.len() < 2 + n_methods {
        return Step::NeedMore;
    }

    if buf[2..2 + n_methods].contains(&METHOD_USER_PASS) {
        Step::Reply {
            consumed: 2 + n_methods,
            reply: Bytes::from_static(&[SOCKS5_VERSION, METHOD_USER_PASS]),
            next: Next::Auth,
        }
    } else {
        Step::Reject {
            reply: Some(Bytes::from_static(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])),
            error: ProxyError::AuthenticationFailed("no acceptable socks5 auth method".into()),
        }
    }
}

/// [VER=1] [ULEN] [UNAME] [PLEN] [PASSWD]
fn auth(buf: &[u8], creds: &Credentials) -> Step {
    if buf.len() < 3 {
        return Step::NeedMore;
    }
    if buf[0] != AUTH_VERSION {
        return Step::Reject {
            reply: None,
            error: ProxyError::Protocol(format!("socks5 auth version {}", buf[0])),
        };
    }

    let ulen = buf[1] as usize;
    let plen_at = 2 + ulen;
    let Some(&plen) = buf.get(plen_at) else {
        return Step::NeedMore;
    };
    let end = plen_at + 1 + plen as usize;
    if buf.len() < end {
        return Step::NeedMore;
    }

    let username = String::from_utf8_lossy(&buf[2..plen_at]);
    let password = String::from_utf8_lossy(&buf[plen_at + 1..end]);

    if accepts(creds, &username, &password) {
        Step::Reply {
            consumed: end,
            reply: Bytes::from_static(&[AUTH_VERSION, 0x00]),
            next: Next::Detect,
        }
    } else {
        Step::Reject {
            reply: Some(Bytes::from_static(&[AUTH_VERSION, 0x01])),
            error: ProxyError::AuthenticationFailed("socks5 username/password rejected".into()),
        }
    }
}

/// 用户名、密码各自可以是主标识符或共享密钥
fn accepts(creds: &Credentials, username: &str, password: &str) -> bool {
    let known = |s: &str| s == creds.primary || s == creds.secret;
    known(username) && known(password)
}
