use anyhow::Result;
use serde::{Deserialize, Deserializer};

use super::enhance::{normalize_protocol_name, split_list};
use crate::common::dialer::DialerConfig;
use crate::dns::nat64::Nat64Prefix;
use crate::proxy::inbound::Protocol;
use crate::proxy::outbound::socks5::UpstreamProxy;

/// 可在 `disabled_protocols` 中出现、但不属于头部探测的名字
pub const STREAM_TRANSPORT_NAME: &str = "xhttp";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub ban: BanConfig,
    #[serde(default, deserialize_with = "string_or_list")]
    pub disabled_protocols: Vec<String>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub dialer: DialerConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.credentials.uuid.trim().is_empty() {
            anyhow::bail!("credentials.uuid is required");
        }
        if let Some(ref addr) = self.upstream.address {
            UpstreamProxy::parse(addr)
                .map_err(|e| anyhow::anyhow!("upstream.address '{}': {}", addr, e))?;
        }
        if let Some(ref prefix) = self.translation.prefix {
            prefix
                .parse::<Nat64Prefix>()
                .map_err(|e| anyhow::anyhow!("translation.prefix '{}': {}", prefix, e))?;
        }
        for name in &self.disabled_protocols {
            let name = normalize_protocol_name(name);
            if name != STREAM_TRANSPORT_NAME && Protocol::from_name(&name).is_none() {
                anyhow::bail!("unknown protocol '{}' in disabled_protocols", name);
            }
        }
        if self.limits.max_header_bytes == 0 {
            anyhow::bail!("limits.max_header_bytes must be positive");
        }
        Ok(())
    }

    /// 归一化后的禁用协议（不含 `xhttp`）
    pub fn disabled_header_protocols(&self) -> Vec<Protocol> {
        self.disabled_protocols
            .iter()
            .filter_map(|name| Protocol::from_name(&normalize_protocol_name(name)))
            .collect()
    }

    /// `xhttp` 未被禁用且 server.stream_transport 打开
    pub fn stream_transport_enabled(&self) -> bool {
        self.server.stream_transport
            && !self
                .disabled_protocols
                .iter()
                .any(|name| normalize_protocol_name(name) == STREAM_TRANSPORT_NAME)
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 分块 HTTP 隧道开关
    #[serde(default = "default_true")]
    pub stream_transport: bool,
    /// `/` 的伪装跳转地址，留空时返回欢迎页
    #[serde(default)]
    pub redirect: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            stream_transport: true,
            redirect: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub uuid: String,
    /// 设置后按周期派生标识符
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_rotation_days")]
    pub rotation_days: u32,
    #[serde(default)]
    pub rotation_hour: u32,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            key: None,
            rotation_days: default_rotation_days(),
            rotation_hour: 0,
        }
    }
}

fn default_rotation_days() -> u32 {
    99_999
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default, deserialize_with = "string_or_list")]
    pub pool: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpstreamConfig {
    /// `[scheme://][user:pass@]host:port`
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub patterns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TranslationConfig {
    /// DNS64 DoH 端点（JSON API）
    #[serde(default)]
    pub doh: Option<String>,
    /// IPv4 字面量嵌入的 NAT64 前缀，默认 64:ff9b::/96
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BanConfig {
    #[serde(default, deserialize_with = "string_or_list")]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_detection_timeout_ms")]
    pub detection_timeout_ms: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            detection_timeout_ms: default_detection_timeout_ms(),
            max_header_bytes: default_max_header_bytes(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_detection_timeout_ms() -> u64 {
    10_000
}

fn default_max_header_bytes() -> usize {
    4096
}

fn default_idle_timeout_ms() -> u64 {
    45_000
}

/// 列表字段既可以写成 YAML 序列，也可以写成一个分隔字符串
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::One(s)) => split_list(&s),
        Some(Raw::Many(items)) => items.iter().flat_map(|s| split_list(s)).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_sections_missing() {
        let config: Config = serde_yml::from_str("credentials:\n  uuid: abc\n").unwrap();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.server.port, 8080);
        assert!(config.server.stream_transport);
        assert_eq!(config.credentials.rotation_days, 99_999);
        assert_eq!(config.limits.detection_timeout_ms, 10_000);
        assert_eq!(config.limits.max_header_bytes, 4096);
        assert_eq!(config.limits.idle_timeout_ms, 45_000);
        assert!(config.relay.pool.is_empty());
    }

    #[test]
    fn list_fields_accept_strings() {
        let yaml = r#"
credentials:
  uuid: abc
relay:
  pool: "1.1.1.1:443, relay.example\n[2001:db8::1]:8443"
ban:
  hosts:
    - "*.bad.com,evil.org"
disabled_protocols: "Shadowsocks，socks"
"#;
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(
            config.relay.pool,
            vec!["1.1.1.1:443", "relay.example", "[2001:db8::1]:8443"]
        );
        assert_eq!(config.ban.hosts, vec!["*.bad.com", "evil.org"]);
        assert_eq!(
            config.disabled_header_protocols(),
            vec![Protocol::Shadowsocks, Protocol::Socks5]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn xhttp_in_disabled_list_turns_off_stream_transport() {
        let config: Config =
            serde_yml::from_str("credentials:\n  uuid: abc\ndisabled_protocols: [xhttp]\n").unwrap();
        assert!(!config.stream_transport_enabled());
        assert!(config.disabled_header_protocols().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_input() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let config: Config =
            serde_yml::from_str("credentials:\n  uuid: abc\ndisabled_protocols: [quic]\n").unwrap();
        assert!(config.validate().is_err());

        let config: Config =
            serde_yml::from_str("credentials:\n  uuid: abc\nupstream:\n  address: no-port\n").unwrap();
        assert!(config.validate().is_err());

        let config: Config =
            serde_yml::from_str("credentials:\n  uuid: abc\ntranslation:\n  prefix: 10.0.0.0/8\n").unwrap();
        assert!(config.validate().is_err());
    }
}
