//! 入站会话状态机
//!
//! ```text
//! (首字节 0x05) AwaitGreeting -> AwaitAuth ┐
//!                                          ├-> Detecting -> Connected -> Closed
//! (其他)                                   ┘
//! ```
//!
//! 每个会话一个任务：先缓冲并探测协议（受探测截止时间约束），
//! 然后准入检查、建立出站连接，最后交给 [`DuplexRelay`]。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use super::detect::{detect, should_wait, DetectionFailure};
use super::handshake::{self, HandshakeStage, Next, Step};
use super::inbound::{Protocol, TargetDescriptor};
use super::outbound::{AttemptPlan, OutboundConnector};
use super::relay::{DuplexRelay, NoDataRetry, RelayStats};
use super::transport::{ChunkSink, ChunkSource};
use crate::common::{Address, Credentials, ProxyError, ProxyErrorKind, ProxyStream};
use crate::config::LimitsConfig;
use crate::router::Router;

/// SOCKS5 CONNECT 成功应答，BND 全零
const SOCKS5_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    SESSION_IDS.fetch_add(1, Ordering::Relaxed)
}

/// 会话共享的只读上下文
#[derive(Clone)]
pub struct SessionContext {
    pub credentials: Arc<Credentials>,
    pub router: Arc<Router>,
    pub connector: OutboundConnector,
    pub disabled: Arc<[Protocol]>,
    pub limits: LimitsConfig,
}

impl SessionContext {
    pub fn new(credentials: Arc<Credentials>, router: Arc<Router>, connector: OutboundConnector) -> Self {
        Self {
            credentials,
            router,
            connector,
            disabled: Arc::from(Vec::new()),
            limits: LimitsConfig::default(),
        }
    }

    pub fn with_disabled(mut self, disabled: Vec<Protocol>) -> Self {
        self.disabled = Arc::from(disabled);
        self
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    /// 替换出站连接器（单个请求的覆盖参数）
    pub fn with_connector(mut self, connector: OutboundConnector) -> Self {
        self.connector = connector;
        self
    }

    pub fn is_disabled(&self, protocol: Protocol) -> bool {
        self.disabled.contains(&protocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitGreeting,
    AwaitAuth,
    Detecting,
    Connected,
    Closed,
}

pub struct InboundSession {
    id: u64,
    transport: &'static str,
    ctx: SessionContext,
    state: SessionState,
    /// 完成了内嵌 SOCKS5 握手，之后只接受 SOCKS5 请求
    handshake_done: bool,
}

impl InboundSession {
    pub fn new(ctx: SessionContext, transport: &'static str) -> Self {
        Self {
            id: next_session_id(),
            transport,
            ctx,
            state: SessionState::Detecting,
            handshake_done: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 驱动整个会话直到结束
    pub async fn run(mut self, source: ChunkSource, sink: ChunkSink) -> Result<RelayStats, ProxyError> {
        let span = tracing::info_span!("session", id = self.id, transport = self.transport);
        async move {
            let started = Instant::now();
            let result = self.drive(source, sink).await;
            self.state = SessionState::Closed;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(stats) => info!(
                    up = stats.uploaded,
                    down = stats.downloaded,
                    retries = stats.retries,
                    duration_ms = elapsed_ms,
                    "session finished"
                ),
                Err(e) => log_failure(e, elapsed_ms),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self, mut source: ChunkSource, mut sink: ChunkSink) -> Result<RelayStats, ProxyError> {
        let deadline = Duration::from_millis(self.ctx.limits.detection_timeout_ms);
        let detection = tokio::time::timeout(deadline, self.detect_target(&mut source, &mut sink)).await;
        let detected = match detection {
            Ok(result) => result.and_then(|target| self.admit(&target).map(|_| target)),
            Err(_) => Err(ProxyError::ConnectionTimeout(format!(
                "protocol detection exceeded {} ms",
                deadline.as_millis()
            ))),
        };
        let target = match detected {
            Ok(target) => target,
            Err(e) => {
                let _ = sink.close().await;
                return Err(e);
            }
        };

        if target.protocol == Protocol::Socks5 {
            sink.send(Bytes::from_static(&SOCKS5_SUCCESS)).await?;
        }

        let address = target.to_address();
        let mut plan = AttemptPlan::new();
        let outbound = match self.ctx.connector.connect(&address, &mut plan, &target.payload).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = sink.close().await;
                return Err(e);
            }
        };
        self.state = SessionState::Connected;
        debug!(dest = %address, attempts = plan.attempts(), "outbound connected");

        let retry = SessionRetry {
            connector: self.ctx.connector.clone(),
            target: address,
            plan,
            payload: target.payload.clone(),
            translated: false,
        };
        DuplexRelay::new(target.response_header.clone())
            .with_retry(Box::new(retry))
            .run(source, sink, outbound)
            .await
    }

    /// 缓冲入站字节，处理可选握手，直到探测出目标
    async fn detect_target(
        &mut self,
        source: &mut ChunkSource,
        sink: &mut ChunkSink,
    ) -> Result<TargetDescriptor, ProxyError> {
        let mut buf = BytesMut::new();
        let mut first = true;

        loop {
            let chunk = match source.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ProxyError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "client closed before a header was detected",
                    )))
                }
            };
            if chunk.is_empty() {
                continue;
            }
            buf.extend_from_slice(&chunk);

            if first {
                first = false;
                if buf[0] == 0x05 {
                    self.state = SessionState::AwaitGreeting;
                }
            }

            if !self.advance_handshake(&mut buf, sink).await? {
                continue;
            }
            if buf.is_empty() {
                continue;
            }

            match detect_buffered(&mut buf, &self.ctx.credentials) {
                Ok(target) => {
                    info!(
                        protocol = %target.protocol,
                        dest = %target.host_port(),
                        udp = target.is_udp,
                        payload = target.payload.len(),
                        "protocol detected"
                    );
                    return Ok(target);
                }
                Err(failure) => {
                    if should_wait(buf.len(), failure.all_short, self.ctx.limits.max_header_bytes) {
                        trace!(buffered = buf.len(), all_short = failure.all_short, "waiting for more header bytes");
                        continue;
                    }
                    debug!(buffered = buf.len(), error = %failure, "detection failed");
                    return Err(failure.into());
                }
            }
        }
    }

    /// 推进内嵌握手；返回是否已进入探测阶段
    async fn advance_handshake(&mut self, buf: &mut BytesMut, sink: &mut ChunkSink) -> Result<bool, ProxyError> {
        loop {
            let stage = match self.state {
                SessionState::AwaitGreeting => HandshakeStage::AwaitGreeting,
                SessionState::AwaitAuth => HandshakeStage::AwaitAuth,
                _ => return Ok(true),
            };
            match handshake::step(stage, buf, &self.ctx.credentials) {
                Step::NeedMore => return Ok(false),
                Step::Reply { consumed, reply, next } => {
                    sink.send(reply).await?;
                    buf.advance(consumed);
                    self.state = match next {
                        Next::Auth => SessionState::AwaitAuth,
                        Next::Detect => {
                            debug!("socks5 handshake authenticated");
                            self.handshake_done = true;
                            SessionState::Detecting
                        }
                    };
                }
                Step::Reject { reply, error } => {
                    if let Some(reply) = reply {
                        let _ = sink.send(reply).await;
                    }
                    return Err(error);
                }
            }
        }
    }

    /// 准入：握手后协议一致性、协议开关、封禁列表
    fn admit(&self, target: &TargetDescriptor) -> Result<(), ProxyError> {
        if self.handshake_done && target.protocol != Protocol::Socks5 {
            return Err(ProxyError::Protocol(format!(
                "protocol mismatch after socks5 handshake: {}",
                target.protocol
            )));
        }
        if self.ctx.is_disabled(target.protocol) {
            return Err(ProxyError::ProtocolDisabled(target.protocol.name().to_string()));
        }
        self.ctx.router.check_banned(&target.address)
    }
}

/// 在累积缓冲上原地探测：冻结后交给解析器，载荷是同一块内存的切片；
/// 失败时解析器已释放引用，缓冲原样取回继续追加
fn detect_buffered(buf: &mut BytesMut, creds: &Credentials) -> Result<TargetDescriptor, DetectionFailure> {
    let frozen = std::mem::take(buf).freeze();
    let result = detect(&frozen, creds);
    if result.is_err() {
        *buf = frozen
            .try_into_mut()
            .unwrap_or_else(|shared| BytesMut::from(&shared[..]));
    }
    result
}

fn log_failure(e: &ProxyError, duration_ms: u64) {
    let code = e.kind().as_str();
    match e.kind() {
        ProxyErrorKind::AllAttemptsFailed | ProxyErrorKind::IdleTimeout => {
            warn!(error_code = code, error = %e, duration_ms, "session failed")
        }
        ProxyErrorKind::BannedDestination | ProxyErrorKind::ProtocolDisabled => {
            info!(error_code = code, error = %e, "session rejected")
        }
        _ => debug!(error_code = code, error = %e, duration_ms, "session closed"),
    }
}

/// 无数据重试：先走中继链，再走 NAT64，各一次
struct SessionRetry {
    connector: OutboundConnector,
    target: Address,
    plan: AttemptPlan,
    payload: Bytes,
    translated: bool,
}

#[async_trait]
impl NoDataRetry for SessionRetry {
    async fn retry(&mut self, stage: u32) -> Option<ProxyStream> {
        if stage == 0 {
            match self.connector.connect_relay(&self.target, &mut self.plan, &self.payload).await {
                Ok(stream) => return Some(stream),
                Err(e) => debug!(error = %e, "relay retry failed"),
            }
        }
        if self.translated || !self.connector.can_translate(&self.target) {
            return None;
        }
        self.translated = true;
        match self
            .connector
            .connect_translated(&self.target, &mut self.plan, &self.payload)
            .await
        {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!(error = %e, "nat64 retry failed");
                None
            }
        }
    }
}

/// 接收一个入站会话；会话自行管理生命周期并记录结果
pub fn accept_inbound_session(
    ctx: SessionContext,
    source: ChunkSource,
    sink: ChunkSink,
    transport: &'static str,
) -> JoinHandle<()> {
    let session = InboundSession::new(ctx, transport);
    tokio::spawn(async move {
        let _ = session.run(source, sink).await;
    })
}
