use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 缓冲区数据不足，等待更多入站字节后重试
    #[error("short buffer: {0}")]
    ShortBuffer(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("invalid address type: {0}")]
    InvalidAddressType(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("protocol disabled: {0}")]
    ProtocolDisabled(String),

    #[error("banned destination: {0}")]
    BannedDestination(String),

    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("all connection attempts failed for {0}")]
    AllAttemptsFailed(String),

    #[error("idle timeout after {0} ms")]
    IdleTimeout(u64),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    /// Whether waiting for more inbound bytes may turn this failure into a success.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether the outbound connector should move on to the next candidate.
    pub fn should_fallback(&self) -> bool {
        self.kind().should_fallback()
    }

    /// Get the kind/category of this error.
    pub fn kind(&self) -> ProxyErrorKind {
        match self {
            ProxyError::Io(_) => ProxyErrorKind::Io,
            ProxyError::ShortBuffer(_) => ProxyErrorKind::ShortBuffer,
            ProxyError::AuthenticationFailed(_) => ProxyErrorKind::AuthenticationFailed,
            ProxyError::UnsupportedCommand(_) => ProxyErrorKind::UnsupportedCommand,
            ProxyError::InvalidAddressType(_) => ProxyErrorKind::InvalidAddressType,
            ProxyError::Protocol(_) => ProxyErrorKind::Protocol,
            ProxyError::ProtocolDisabled(_) => ProxyErrorKind::ProtocolDisabled,
            ProxyError::BannedDestination(_) => ProxyErrorKind::BannedDestination,
            ProxyError::ConnectionTimeout(_) => ProxyErrorKind::ConnectionTimeout,
            ProxyError::AllAttemptsFailed(_) => ProxyErrorKind::AllAttemptsFailed,
            ProxyError::IdleTimeout(_) => ProxyErrorKind::IdleTimeout,
            ProxyError::Config(_) => ProxyErrorKind::Config,
            ProxyError::Other(_) => ProxyErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    Io,
    ShortBuffer,
    AuthenticationFailed,
    UnsupportedCommand,
    InvalidAddressType,
    Protocol,
    ProtocolDisabled,
    BannedDestination,
    ConnectionTimeout,
    AllAttemptsFailed,
    IdleTimeout,
    Config,
    Other,
}

impl ProxyErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ProxyErrorKind::ShortBuffer)
    }

    /// 只影响单个候选地址的失败：拨号、超时、上游代理握手被拒
    pub fn should_fallback(self) -> bool {
        matches!(
            self,
            ProxyErrorKind::Io
                | ProxyErrorKind::ConnectionTimeout
                | ProxyErrorKind::Other
                | ProxyErrorKind::Protocol
                | ProxyErrorKind::AuthenticationFailed
                | ProxyErrorKind::UnsupportedCommand
                | ProxyErrorKind::InvalidAddressType
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyErrorKind::Io => "IO",
            ProxyErrorKind::ShortBuffer => "SHORT_BUFFER",
            ProxyErrorKind::AuthenticationFailed => "AUTH_FAILED",
            ProxyErrorKind::UnsupportedCommand => "UNSUPPORTED_CMD",
            ProxyErrorKind::InvalidAddressType => "INVALID_ATYP",
            ProxyErrorKind::Protocol => "PROTOCOL",
            ProxyErrorKind::ProtocolDisabled => "PROTOCOL_DISABLED",
            ProxyErrorKind::BannedDestination => "BANNED",
            ProxyErrorKind::ConnectionTimeout => "CONN_TIMEOUT",
            ProxyErrorKind::AllAttemptsFailed => "ALL_ATTEMPTS_FAILED",
            ProxyErrorKind::IdleTimeout => "IDLE_TIMEOUT",
            ProxyErrorKind::Config => "CONFIG",
            ProxyErrorKind::Other => "OTHER",
        }
    }
}

impl From<ProxyError> for std::io::Error {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Io(io) => io,
            other => std::io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_short_buffer_is_retryable() {
        assert!(ProxyError::ShortBuffer("x".into()).is_retryable());
        assert!(!ProxyError::AuthenticationFailed("x".into()).is_retryable());
        assert!(!ProxyError::Protocol("x".into()).is_retryable());
    }

    #[test]
    fn candidate_failures_drive_fallback() {
        assert!(ProxyError::ConnectionTimeout("500ms".into()).should_fallback());
        assert!(ProxyError::Io(std::io::ErrorKind::ConnectionRefused.into()).should_fallback());
        // upstream socks5 rejections only concern that candidate
        assert!(ProxyError::AuthenticationFailed("upstream".into()).should_fallback());

        assert!(!ProxyError::Config("bad bind".into()).should_fallback());
        assert!(!ProxyError::AllAttemptsFailed("x".into()).should_fallback());
        assert!(!ProxyError::BannedDestination("x".into()).should_fallback());
    }

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ProxyErrorKind::BannedDestination.as_str(), "BANNED");
        assert_eq!(
            ProxyError::ProtocolDisabled("vless".into()).kind().as_str(),
            "PROTOCOL_DISABLED"
        );
    }
}
