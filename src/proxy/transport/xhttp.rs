//! 分块 HTTP 隧道 (xhttp)
//!
//! 请求体是单向上传流，响应体是单向下载流。请求头与 VLESS 的身份和地址字段同形：
//!
//! ```text
//! [Version: 1B] [UUID: 16B] [AddonsLen: 1B] [Addons: N] [Cmd: 1B] [Port: 2B] [AddrType: 1B] [Addr: N] [Data...]
//! ```
//!
//! 头部按最少字节数读取；解析完成后上传泵与下载泵并发运行，任一结束即全部拆除。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::ChunkSource;
use crate::common::addr::{decode_address, decode_port};
use crate::common::{Address, AddressType, Credentials, ProxyError, ProxyStream};
use crate::proxy::outbound::AttemptPlan;
use crate::proxy::relay::RelayStats;
use crate::proxy::session::{next_session_id, SessionContext};

const CMD_TCP: u8 = 0x01;
const DOWNLOAD_BUF_SIZE: usize = 16 * 1024;
const RESPONSE_QUEUE: usize = 8;

/// 流式请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u8,
    pub address_type: AddressType,
    pub address: String,
    pub port: u16,
    /// 与头部同批到达的数据
    pub payload: Bytes,
}

impl StreamHeader {
    /// 下载方向的一次性前导
    pub fn preamble(&self) -> Bytes {
        Bytes::from(vec![self.version, 0x00])
    }
}

/// 按最少字节数读取的缓冲读取器
struct MinReader {
    source: ChunkSource,
    buf: BytesMut,
}

impl MinReader {
    fn new(source: ChunkSource) -> Self {
        Self {
            source,
            buf: BytesMut::new(),
        }
    }

    /// 读到至少 `len` 字节；流提前结束返回 false
    async fn fill_to(&mut self, len: usize) -> Result<bool, ProxyError> {
        while self.buf.len() < len {
            match self.source.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => return Ok(false),
            }
        }
        Ok(true)
    }
}

fn id_matches(id: &[u8], credentials: &Credentials) -> bool {
    credentials
        .identifiers()
        .into_iter()
        .filter_map(|s| uuid::Uuid::parse_str(s).ok())
        .any(|expected| expected.as_bytes()[..] == *id)
}

/// 读取并校验请求头；不认识的头返回 `Ok(None)`
async fn read_stream_header(
    reader: &mut MinReader,
    credentials: &Credentials,
) -> Result<Option<StreamHeader>, ProxyError> {
    if !reader.fill_to(18).await? {
        return Ok(None);
    }
    let version = reader.buf[0];
    if !id_matches(&reader.buf[1..17], credentials) {
        debug!("stream header: unknown identifier");
        return Ok(None);
    }

    let addons_len = reader.buf[17] as usize;
    let cmd_at = 18 + addons_len;
    let addr_at = cmd_at + 4;
    if !reader.fill_to(addr_at + 1).await? {
        return Ok(None);
    }
    if reader.buf[cmd_at] != CMD_TCP {
        debug!(command = reader.buf[cmd_at], "stream header: unsupported command");
        return Ok(None);
    }

    let (port, _) = decode_port(&reader.buf, cmd_at + 1)?;
    let Ok(address_type) = AddressType::from_vless(reader.buf[addr_at - 1]) else {
        debug!(atyp = reader.buf[addr_at - 1], "stream header: bad address type");
        return Ok(None);
    };
    let header_len = match address_type {
        AddressType::Ipv4 => addr_at + 4,
        AddressType::Ipv6 => addr_at + 16,
        AddressType::Domain => addr_at + 1 + reader.buf[addr_at] as usize,
    };
    if !reader.fill_to(header_len).await? {
        return Ok(None);
    }
    let address = match decode_address(&reader.buf, addr_at, address_type) {
        Ok((address, _)) => address,
        Err(e) => {
            debug!(error = %e, "stream header: bad address");
            return Ok(None);
        }
    };

    let payload = reader.buf.split_off(header_len).freeze();
    Ok(Some(StreamHeader {
        version,
        address_type,
        address,
        port,
        payload,
    }))
}

/// 已建立的流式隧道
pub struct StreamTunnel {
    pub header: StreamHeader,
    /// 响应体：前导 + 目的地回传的数据；空闲超时以错误结束
    pub response: ChunkSource,
    /// 两个泵之一结束时完成
    pub completion: JoinHandle<Result<RelayStats, ProxyError>>,
}

/// 处理一个流式请求
///
/// - `Ok(None)`: 请求体不是可识别的头（调用方按普通 HTTP 处理）
/// - `Err(BannedDestination)` / `Err(AllAttemptsFailed)`: 建立隧道前失败
pub async fn handle_stream_request(
    body: ChunkSource,
    ctx: &SessionContext,
) -> Result<Option<StreamTunnel>, ProxyError> {
    let span = tracing::info_span!("session", id = next_session_id(), transport = "xhttp");
    let setup = async {
        let deadline = Duration::from_millis(ctx.limits.detection_timeout_ms);
        let mut reader = MinReader::new(body);
        let header = match tokio::time::timeout(deadline, read_stream_header(&mut reader, &ctx.credentials)).await {
            Ok(Ok(Some(header))) => header,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => {
                debug!(error = %e, "stream header read failed");
                return Ok(None);
            }
            Err(_) => {
                debug!(timeout_ms = deadline.as_millis() as u64, "stream header timed out");
                return Ok(None);
            }
        };
        ctx.router.check_banned(&header.address)?;

        let address = Address::from_host(&header.address, header.port);
        info!(dest = %address, payload = header.payload.len(), "stream header parsed");
        let mut plan = AttemptPlan::new();
        let outbound = ctx.connector.connect(&address, &mut plan, &header.payload).await?;
        Ok::<_, ProxyError>(Some((header, reader.source, outbound)))
    };

    let Some((header, remaining, outbound)) = setup.instrument(span.clone()).await? else {
        return Ok(None);
    };

    let (tx, rx) = mpsc::channel(RESPONSE_QUEUE);
    let idle = Duration::from_millis(ctx.limits.idle_timeout_ms);
    let preamble = header.preamble();
    let completion = tokio::spawn(run_pumps(remaining, outbound, tx, preamble, idle).instrument(span));

    let response = futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed();
    Ok(Some(StreamTunnel {
        header,
        response,
        completion,
    }))
}

async fn run_pumps(
    body: ChunkSource,
    outbound: ProxyStream,
    tx: mpsc::Sender<Result<Bytes, ProxyError>>,
    preamble: Bytes,
    idle: Duration,
) -> Result<RelayStats, ProxyError> {
    let uploaded = AtomicU64::new(0);
    let downloaded = AtomicU64::new(0);
    let (reader, writer) = tokio::io::split(outbound);

    let result = tokio::select! {
        r = upload(body, writer, &uploaded) => r,
        r = download(reader, tx, preamble, idle, &downloaded) => r,
    };

    let stats = RelayStats {
        uploaded: uploaded.load(Ordering::Relaxed),
        downloaded: downloaded.load(Ordering::Relaxed),
        retries: 0,
    };
    match &result {
        Ok(()) => info!(up = stats.uploaded, down = stats.downloaded, "stream tunnel finished"),
        Err(e) => warn!(error_code = e.kind().as_str(), error = %e, "stream tunnel aborted"),
    }
    result.map(|_| stats)
}

async fn upload(
    mut body: ChunkSource,
    mut writer: WriteHalf<ProxyStream>,
    uploaded: &AtomicU64,
) -> Result<(), ProxyError> {
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        writer.write_all(&chunk).await?;
        uploaded.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn download(
    mut reader: ReadHalf<ProxyStream>,
    tx: mpsc::Sender<Result<Bytes, ProxyError>>,
    preamble: Bytes,
    idle: Duration,
    downloaded: &AtomicU64,
) -> Result<(), ProxyError> {
    if tx.send(Ok(preamble)).await.is_err() {
        return Ok(());
    }
    let mut buf = BytesMut::with_capacity(DOWNLOAD_BUF_SIZE);
    loop {
        buf.reserve(DOWNLOAD_BUF_SIZE);
        let n = match tokio::time::timeout(idle, reader.read_buf(&mut buf)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                let ms = idle.as_millis() as u64;
                let _ = tx.send(Err(ProxyError::IdleTimeout(ms))).await;
                return Err(ProxyError::IdleTimeout(ms));
            }
        };
        downloaded.fetch_add(n as u64, Ordering::Relaxed);
        if tx.send(Ok(buf.split().freeze())).await.is_err() {
            // 客户端已断开
            return Ok(());
        }
    }
}
