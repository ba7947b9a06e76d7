//! 出站连接：分阶段超时 + 多级回退
//!
//! 1. 主路径：直连目的地，或命中模式时经上游 SOCKS5 代理
//! 2. 中继回退：默认中继 + 中继池随机两个，去重后依次直连
//! 3. NAT64：未经上游代理且配置了转换器时，合成 IPv6 地址直连
//!
//! 超时按整个会话的全局尝试序号递增：500 / 1500 / 2500 ms。

pub mod fallback;
pub mod socks5;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::common::addr::format_host_port;
use crate::common::dialer::TcpDial;
use crate::common::{Address, ProxyError, ProxyStream};
use crate::dns::AddressTranslator;
use crate::router::Router;

pub use fallback::parse_relay_address;
pub use socks5::UpstreamProxy;

/// 第 1 次、第 2 次、第 3 次及以后的超时
pub const STAGED_TIMEOUTS_MS: [u64; 3] = [500, 1500, 2500];

/// 既没有默认中继也没有中继池时使用
pub const DEFAULT_RELAY_HOST: &str = "xio.hpc.tw";

/// 每次从中继池随机抽取的次数
const RELAY_PICKS: usize = 2;

pub fn staged_timeout(attempt: usize) -> Duration {
    let idx = attempt.min(STAGED_TIMEOUTS_MS.len() - 1);
    Duration::from_millis(STAGED_TIMEOUTS_MS[idx])
}

/// 一次出站尝试
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAttempt {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub via_upstream_proxy: bool,
}

/// 一个会话内的尝试计划：全局计数器 + 已尝试的 (host, port)
///
/// 初次连接和之后的无数据重试共用同一个计划，所以重试不会重复拨号，
/// 超时也从当前阶梯继续。
#[derive(Debug, Default)]
pub struct AttemptPlan {
    counter: usize,
    attempted: HashSet<(String, u16)>,
    history: Vec<OutboundAttempt>,
}

impl AttemptPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一次尝试；重复的 (host, port) 返回 `None`
    fn claim(&mut self, host: &str, port: u16, via_upstream_proxy: bool) -> Option<OutboundAttempt> {
        let key = (host.to_ascii_lowercase(), port);
        if !self.attempted.insert(key) {
            debug!(host = host, port = port, "skipping duplicate outbound candidate");
            return None;
        }
        let attempt = OutboundAttempt {
            host: host.to_string(),
            port,
            timeout: staged_timeout(self.counter),
            via_upstream_proxy,
        };
        self.counter += 1;
        self.history.push(attempt.clone());
        Some(attempt)
    }

    pub fn attempts(&self) -> usize {
        self.counter
    }

    /// 按顺序记录的所有尝试
    pub fn history(&self) -> &[OutboundAttempt] {
        &self.history
    }
}

/// 从中继池中选一个下标
pub trait RelayPicker: Send + Sync {
    fn pick(&self, len: usize) -> usize;
}

/// 均匀随机
#[derive(Debug, Default)]
pub struct RandomPicker;

impl RelayPicker for RandomPicker {
    fn pick(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

/// 出站连接器
#[derive(Clone)]
pub struct OutboundConnector {
    dialer: Arc<dyn TcpDial>,
    router: Arc<Router>,
    relay_pool: Arc<Vec<String>>,
    default_relay: Option<String>,
    fallback: Option<String>,
    upstream: Option<Arc<UpstreamProxy>>,
    translator: Option<Arc<dyn AddressTranslator>>,
    picker: Arc<dyn RelayPicker>,
}

impl OutboundConnector {
    pub fn new(dialer: Arc<dyn TcpDial>, router: Arc<Router>) -> Self {
        Self {
            dialer,
            router,
            relay_pool: Arc::new(Vec::new()),
            default_relay: None,
            fallback: None,
            upstream: None,
            translator: None,
            picker: Arc::new(RandomPicker),
        }
    }

    /// 中继池；未配置默认中继时随机取池中一个作为默认
    pub fn with_relays(mut self, pool: Vec<String>, default_relay: Option<String>) -> Self {
        let pool: Vec<String> = pool.into_iter().filter(|s| !s.trim().is_empty()).collect();
        self.default_relay = default_relay
            .filter(|s| !s.trim().is_empty())
            .or_else(|| (!pool.is_empty()).then(|| pool[self.picker.pick(pool.len())].clone()));
        self.relay_pool = Arc::new(pool);
        self
    }

    /// 显式回退地址：设置后中继阶段只尝试它
    pub fn with_fallback(mut self, fallback: Option<String>) -> Self {
        self.fallback = fallback.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_upstream(mut self, upstream: Option<Arc<UpstreamProxy>>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_translator(mut self, translator: Option<Arc<dyn AddressTranslator>>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_picker(mut self, picker: Arc<dyn RelayPicker>) -> Self {
        self.picker = picker;
        self
    }

    /// 单个请求的覆盖（查询参数 `proxyip` / `socks5`）
    pub fn with_overrides(&self, default_relay: Option<String>, upstream: Option<Arc<UpstreamProxy>>) -> Self {
        let mut connector = self.clone();
        if let Some(relay) = default_relay.filter(|s| !s.trim().is_empty()) {
            connector.default_relay = Some(relay);
        }
        if upstream.is_some() {
            connector.upstream = upstream;
        }
        connector
    }

    pub fn default_relay(&self) -> Option<&str> {
        self.default_relay.as_deref()
    }

    /// 目的地是否经由上游代理
    pub fn uses_upstream(&self, host: &str) -> bool {
        self.upstream.is_some() && self.router.use_upstream(host)
    }

    /// NAT64 阶段是否可用
    pub fn can_translate(&self, target: &Address) -> bool {
        self.translator.is_some() && !self.uses_upstream(&target.host())
    }

    /// 中继候选：显式回退地址独占；否则默认中继（或硬编码默认）+ 池中随机两个，去重
    pub fn relay_candidates(&self) -> Vec<String> {
        if let Some(fallback) = &self.fallback {
            return vec![fallback.clone()];
        }

        let mut candidates = vec![self
            .default_relay
            .clone()
            .unwrap_or_else(|| DEFAULT_RELAY_HOST.to_string())];
        if !self.relay_pool.is_empty() {
            for _ in 0..RELAY_PICKS {
                let pick = &self.relay_pool[self.picker.pick(self.relay_pool.len())];
                if !candidates.contains(pick) {
                    candidates.push(pick.clone());
                }
            }
        }
        candidates
    }

    /// 依次尝试三个阶段，成功后把 `payload` 作为第一次写入
    pub async fn connect(
        &self,
        target: &Address,
        plan: &mut AttemptPlan,
        payload: &[u8],
    ) -> Result<ProxyStream, ProxyError> {
        let host = target.host();
        let port = target.port();
        let via_upstream = self.uses_upstream(&host);

        if let Some(attempt) = plan.claim(&host, port, via_upstream) {
            match self.try_attempt(&attempt, target, payload).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.should_fallback() => {
                    debug!(target = %target, error = %e, "primary path failed")
                }
                Err(e) => return Err(e),
            }
        }

        match self.connect_relay(target, plan, payload).await {
            Ok(stream) => return Ok(stream),
            Err(ProxyError::AllAttemptsFailed(_)) => debug!(target = %target, "relay fallback exhausted"),
            Err(e) => return Err(e),
        }

        if self.can_translate(target) {
            match self.connect_translated(target, plan, payload).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.should_fallback() => {
                    debug!(target = %target, error = %e, "nat64 fallback failed")
                }
                Err(e) => return Err(e),
            }
        }

        warn!(target = %target, attempts = plan.attempts(), "all outbound attempts failed");
        Err(ProxyError::AllAttemptsFailed(target.to_string()))
    }

    /// 中继阶段
    pub async fn connect_relay(
        &self,
        target: &Address,
        plan: &mut AttemptPlan,
        payload: &[u8],
    ) -> Result<ProxyStream, ProxyError> {
        for candidate in self.relay_candidates() {
            let (host, port) = parse_relay_address(&candidate, target.port());
            let Some(attempt) = plan.claim(&host, port, false) else {
                continue;
            };
            match self.try_attempt(&attempt, target, payload).await {
                Ok(stream) => {
                    info!(target = %target, relay = %format_host_port(&host, port), "connected via relay");
                    return Ok(stream);
                }
                Err(e) if e.should_fallback() => {
                    debug!(relay = %candidate, error = %e, "relay candidate failed")
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProxyError::AllAttemptsFailed(format!("{} via relays", target)))
    }

    /// NAT64 阶段
    pub async fn connect_translated(
        &self,
        target: &Address,
        plan: &mut AttemptPlan,
        payload: &[u8],
    ) -> Result<ProxyStream, ProxyError> {
        let translator = self
            .translator
            .as_ref()
            .ok_or_else(|| ProxyError::Config("no address translator configured".into()))?;
        let translated = translator.translate(&target.host()).await?;
        let attempt = plan
            .claim(&translated, target.port(), false)
            .ok_or_else(|| ProxyError::AllAttemptsFailed(format!("{} already attempted", translated)))?;
        let stream = self.try_attempt(&attempt, target, payload).await?;
        info!(target = %target, translated = %translated, "connected via nat64");
        Ok(stream)
    }

    /// 在阶梯超时内完成拨号（或上游握手）和首次写入
    async fn try_attempt(
        &self,
        attempt: &OutboundAttempt,
        target: &Address,
        payload: &[u8],
    ) -> Result<ProxyStream, ProxyError> {
        debug!(
            host = %attempt.host,
            port = attempt.port,
            timeout_ms = attempt.timeout.as_millis() as u64,
            via_upstream = attempt.via_upstream_proxy,
            "outbound attempt"
        );

        let dial = async {
            match (&self.upstream, attempt.via_upstream_proxy) {
                (Some(upstream), true) => upstream.connect(self.dialer.as_ref(), target).await,
                _ => self.dialer.dial(&attempt.host, attempt.port).await,
            }
        };
        let mut stream = tokio::time::timeout(attempt.timeout, dial).await.map_err(|_| {
            ProxyError::ConnectionTimeout(format!(
                "{} after {} ms",
                format_host_port(&attempt.host, attempt.port),
                attempt.timeout.as_millis()
            ))
        })??;

        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        Ok(stream)
    }
}
