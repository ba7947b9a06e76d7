//! NAT64 地址合成
//!
//! 目的地直连和中继都失败时，把它换成一个 IPv6 地址再试一次：
//! - IPv4 字面量直接嵌入 /96 前缀
//! - 域名向 DNS64 DoH 端点查询 AAAA（`application/dns-json`），没有端点就不转换

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::common::ProxyError;

const CACHE_TTL: Duration = Duration::from_secs(60);
const CACHE_MAX_ENTRIES: usize = 1000;
const DOH_TIMEOUT: Duration = Duration::from_secs(5);
const AAAA: u16 = 28;

/// 地址族转换
#[async_trait]
pub trait AddressTranslator: Send + Sync {
    /// 返回一个不带方括号的 IPv6 地址
    async fn translate(&self, host: &str) -> Result<String, ProxyError>;
}

/// NAT64 /96 前缀
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat64Prefix([u8; 12]);

impl Default for Nat64Prefix {
    /// RFC 6052 well-known prefix `64:ff9b::/96`
    fn default() -> Self {
        Self([0x00, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0])
    }
}

impl Nat64Prefix {
    pub fn embed(&self, v4: Ipv4Addr) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[..12].copy_from_slice(&self.0);
        octets[12..].copy_from_slice(&v4.octets());
        Ipv6Addr::from(octets)
    }
}

impl FromStr for Nat64Prefix {
    type Err = ProxyError;

    /// 接受 `addr/96` 或不带长度的 `addr`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (addr, len),
            None => (s, "96"),
        };
        if len.trim() != "96" {
            return Err(ProxyError::Config(format!("nat64 prefix must be /96, got /{}", len)));
        }
        let addr: Ipv6Addr = addr
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid nat64 prefix '{}': {}", addr, e)))?;
        let mut prefix = [0u8; 12];
        prefix.copy_from_slice(&addr.octets()[..12]);
        Ok(Self(prefix))
    }
}

impl fmt::Display for Nat64Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/96", self.embed(Ipv4Addr::UNSPECIFIED))
    }
}

/// 翻译结果缓存：固定 TTL，超过上限整体清空
pub struct TranslationCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new(CACHE_TTL, CACHE_MAX_ENTRIES)
    }
}

impl TranslationCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(_, expires)| Instant::now() < *expires)
            .map(|(addr, _)| addr.clone())
    }

    pub fn insert(&self, key: String, addr: String) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, (addr, Instant::now() + self.ttl));
            if entries.len() > self.max_entries {
                entries.clear();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    #[serde(default)]
    data: String,
}

impl DohResponse {
    /// 第一条有效的 AAAA 记录
    fn first_aaaa(&self) -> Option<Ipv6Addr> {
        if self.status != 0 {
            return None;
        }
        self.answer
            .iter()
            .filter(|rec| rec.record_type == AAAA)
            .find_map(|rec| rec.data.trim().parse().ok())
    }
}

/// 基于 DNS64 DoH 端点和 NAT64 前缀的转换器
pub struct DohTranslator {
    client: reqwest::Client,
    endpoint: Option<String>,
    prefix: Nat64Prefix,
    cache: TranslationCache,
}

impl DohTranslator {
    pub fn new(endpoint: Option<String>, prefix: Nat64Prefix) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Config(format!("doh client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
            prefix,
            cache: TranslationCache::default(),
        })
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    async fn query_aaaa(&self, endpoint: &str, host: &str) -> Result<Option<Ipv6Addr>, ProxyError> {
        let resp = self
            .client
            .get(endpoint)
            .query(&[("name", host), ("type", "AAAA")])
            .header(http::header::ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| ProxyError::Other(anyhow::anyhow!("doh query for {}: {}", host, e)))?;
        if !resp.status().is_success() {
            debug!(host = host, status = %resp.status(), "doh query rejected");
            return Ok(None);
        }
        let body: DohResponse = resp
            .json()
            .await
            .map_err(|e| ProxyError::Other(anyhow::anyhow!("doh response for {}: {}", host, e)))?;
        Ok(body.first_aaaa())
    }
}

#[async_trait]
impl AddressTranslator for DohTranslator {
    async fn translate(&self, host: &str) -> Result<String, ProxyError> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => return Ok(v6.to_string()),
            Ok(IpAddr::V4(v4)) => return Ok(self.prefix.embed(v4).to_string()),
            Err(_) => {}
        }

        // 域名只经 DNS64 端点转换
        let Some(endpoint) = self.endpoint.as_deref() else {
            debug!(host = bare, "no dns64 endpoint, domain not translated");
            return Err(ProxyError::Other(anyhow::anyhow!("no dns64 endpoint to translate {}", bare)));
        };

        let key = format!("{}|{}", bare, endpoint);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let resolved = self.query_aaaa(endpoint, bare).await?;

        match resolved {
            Some(v6) => {
                let addr = v6.to_string();
                debug!(host = bare, translated = %addr, "nat64 address synthesized");
                self.cache.insert(key, addr.clone());
                Ok(addr)
            }
            None => {
                warn!(host = bare, "no nat64 address available");
                Err(ProxyError::Other(anyhow::anyhow!("no AAAA record for {}", bare)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{extract::Query, Json, Router};

    #[test]
    fn prefix_parse_and_embed() {
        let prefix: Nat64Prefix = "64:ff9b::/96".parse().unwrap();
        assert_eq!(prefix, Nat64Prefix::default());
        assert_eq!(
            prefix.embed(Ipv4Addr::new(192, 0, 2, 33)),
            "64:ff9b::c000:221".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(prefix.to_string(), "64:ff9b::/96");

        let custom: Nat64Prefix = "2001:db8:64::".parse().unwrap();
        assert_eq!(
            custom.embed(Ipv4Addr::new(10, 0, 0, 1)),
            "2001:db8:64::a00:1".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn prefix_rejects_bad_input() {
        assert!("64:ff9b::/64".parse::<Nat64Prefix>().is_err());
        assert!("10.0.0.0/8".parse::<Nat64Prefix>().is_err());
        assert!("not-an-address".parse::<Nat64Prefix>().is_err());
    }

    #[test]
    fn doh_answer_selection() {
        let body: DohResponse = serde_json::from_str(
            r#"{"Status":0,"Answer":[
                {"name":"example.com","type":5,"data":"alias.example.com."},
                {"name":"alias.example.com","type":28,"data":"64:ff9b::5db8:d822"}]}"#,
        )
        .unwrap();
        assert_eq!(body.first_aaaa(), Some("64:ff9b::5db8:d822".parse().unwrap()));

        let nx: DohResponse = serde_json::from_str(r#"{"Status":3}"#).unwrap();
        assert_eq!(nx.first_aaaa(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_expires_and_clears_past_ceiling() {
        let cache = TranslationCache::new(Duration::from_secs(60), 2);
        cache.insert("a|x".into(), "::1".into());
        assert_eq!(cache.get("a|x").as_deref(), Some("::1"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("a|x"), None);

        cache.insert("b|x".into(), "::2".into());
        assert_eq!(cache.len(), 2);
        cache.insert("c|x".into(), "::3".into());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn literals_skip_lookup() {
        let t = DohTranslator::new(None, Nat64Prefix::default()).unwrap();
        assert_eq!(t.translate("1.2.3.4").await.unwrap(), "64:ff9b::102:304");
        assert_eq!(t.translate("[2001:db8::1]").await.unwrap(), "2001:db8::1");
        assert!(t.cache().is_empty());
    }

    #[tokio::test]
    async fn domains_need_a_dns64_endpoint() {
        let t = DohTranslator::new(None, Nat64Prefix::default()).unwrap();
        let err = t.translate("localhost").await.unwrap_err();
        assert!(err.should_fallback());
        assert!(t.cache().is_empty());
    }

    #[tokio::test]
    async fn doh_endpoint_is_queried_once_then_cached() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/dns-query",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(q.get("type").map(String::as_str), Some("AAAA"));
                    let data = if q.get("name").map(String::as_str) == Some("v6.example") {
                        "2001:db8::64"
                    } else {
                        ""
                    };
                    Json(serde_json::json!({
                        "Status": 0,
                        "Answer": [{"name": "v6.example", "type": 28, "data": data}]
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let t = DohTranslator::new(Some(format!("http://{}/dns-query", addr)), Nat64Prefix::default()).unwrap();
        assert_eq!(t.translate("v6.example").await.unwrap(), "2001:db8::64");
        assert_eq!(t.translate("v6.example").await.unwrap(), "2001:db8::64");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(t.translate("missing.example").await.is_err());
    }
}
