use std::fmt;

use regex::Regex;

use crate::common::ProxyError;

/// 主机匹配规则（大小写不敏感，`*` 通配任意字符）
#[derive(Debug, Clone)]
pub enum HostRule {
    /// `*` 或 `all in`：匹配所有主机
    Any,
    /// 不含通配符的完整匹配
    Exact(String),
    /// 含 `*` 的通配模式
    Glob { pattern: String, regex: Regex },
}

impl HostRule {
    pub fn parse(pattern: &str) -> Result<Self, ProxyError> {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == "*" || pattern == "all in" {
            return Ok(HostRule::Any);
        }
        if !pattern.contains('*') {
            return Ok(HostRule::Exact(pattern));
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("(?i)^{}$", body))
            .map_err(|e| ProxyError::Config(format!("invalid host pattern '{}': {}", pattern, e)))?;
        Ok(HostRule::Glob { pattern, regex })
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostRule::Any => true,
            HostRule::Exact(expected) => host.eq_ignore_ascii_case(expected),
            HostRule::Glob { regex, .. } => regex.is_match(host),
        }
    }
}

impl fmt::Display for HostRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRule::Any => write!(f, "*"),
            HostRule::Exact(host) => write!(f, "{}", host),
            HostRule::Glob { pattern, .. } => write!(f, "{}", pattern),
        }
    }
}

/// 一组主机规则，任一命中即命中
#[derive(Debug, Clone, Default)]
pub struct HostRuleSet {
    rules: Vec<HostRule>,
}

impl HostRuleSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ProxyError> {
        let rules = patterns
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| !p.trim().is_empty())
            .map(HostRule::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.rules.iter().any(|rule| rule.matches(host))
    }

    /// 命中的第一条规则，用于日志
    pub fn find(&self, host: &str) -> Option<&HostRule> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.rules.iter().find(|rule| rule.matches(host))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}
