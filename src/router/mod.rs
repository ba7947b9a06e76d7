pub mod rules;

use tracing::debug;

use crate::common::ProxyError;
pub use rules::{HostRule, HostRuleSet};

/// 未配置时走上游代理的默认域名模式
pub const DEFAULT_UPSTREAM_PATTERNS: &[&str] = &[
    "*ttvnw.net",
    "*tapecontent.net",
    "*cloudatacdn.com",
    "*.loadshare.org",
];

/// 目的地策略：封禁列表 + 上游代理匹配
#[derive(Debug, Clone, Default)]
pub struct Router {
    banned: HostRuleSet,
    upstream: HostRuleSet,
}

impl Router {
    pub fn new<S: AsRef<str>>(banned: &[S], upstream: &[S]) -> Result<Self, ProxyError> {
        let upstream = if upstream.is_empty() {
            HostRuleSet::new(DEFAULT_UPSTREAM_PATTERNS)?
        } else {
            HostRuleSet::new(upstream)?
        };
        Ok(Self {
            banned: HostRuleSet::new(banned)?,
            upstream,
        })
    }

    /// 封禁检查，命中返回 `BannedDestination`
    pub fn check_banned(&self, host: &str) -> Result<(), ProxyError> {
        match self.banned.find(host) {
            Some(rule) => {
                debug!(host = host, rule = %rule, "destination banned");
                Err(ProxyError::BannedDestination(host.to_string()))
            }
            None => Ok(()),
        }
    }

    /// 目的地是否应经由上游 SOCKS5 代理
    pub fn use_upstream(&self, host: &str) -> bool {
        self.upstream.matches(host)
    }
}
