//! 入站传输与出站连接之间的双向转发
//!
//! 下行（目的地 -> 客户端）负责一次性前导字节和"无数据重试"；
//! 上行（客户端 -> 目的地）持有当前代次的写端，代次切换时释放旧写端、
//! 换上新写端，切换期间写失败的块按顺序暂存，换代后先行写出。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::transport::{ChunkSink, ChunkSource};
use crate::common::{ProxyError, ProxyStream};

const RELAY_BUF_SIZE: usize = 16 * 1024;

/// 转发统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub retries: u32,
}

/// 目的地一个字节都没回就关闭时调用
///
/// `stage` 从 0 开始，每调用一次加一；返回 `None` 表示没有更多回退路径。
/// 实现方负责在返回的新连接上写好需要重放的首包。
#[async_trait]
pub trait NoDataRetry: Send {
    async fn retry(&mut self, stage: u32) -> Option<ProxyStream>;
}

/// 一代出站连接的写端
struct Generation {
    id: u64,
    writer: WriteHalf<ProxyStream>,
}

pub struct DuplexRelay {
    response_header: Option<Bytes>,
    retry: Option<Box<dyn NoDataRetry>>,
}

impl DuplexRelay {
    pub fn new(response_header: Option<Bytes>) -> Self {
        Self {
            response_header: response_header.filter(|h| !h.is_empty()),
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: Box<dyn NoDataRetry>) -> Self {
        self.retry = Some(retry);
        self
    }

    /// 转发直到任意一侧结束
    pub async fn run(self, source: ChunkSource, sink: ChunkSink, outbound: ProxyStream) -> Result<RelayStats, ProxyError> {
        let uploaded = AtomicU64::new(0);
        let downloaded = AtomicU64::new(0);
        let retries = AtomicU32::new(0);

        let (reader, writer) = tokio::io::split(outbound);
        let (gen_tx, gen_rx) = mpsc::channel(1);

        let up = uplink(source, Generation { id: 0, writer }, gen_rx, &uploaded);
        let down = self.downlink(sink, reader, gen_tx, &downloaded, &retries);

        let result = tokio::select! {
            r = up => {
                debug!("client side finished");
                r
            }
            r = down => {
                debug!("destination side finished");
                r
            }
        };

        let stats = RelayStats {
            uploaded: uploaded.load(Ordering::Relaxed),
            downloaded: downloaded.load(Ordering::Relaxed),
            retries: retries.load(Ordering::Relaxed),
        };
        result.map(|_| stats)
    }

    async fn downlink(
        mut self,
        mut sink: ChunkSink,
        mut reader: ReadHalf<ProxyStream>,
        generations: mpsc::Sender<Generation>,
        downloaded: &AtomicU64,
        retries: &AtomicU32,
    ) -> Result<(), ProxyError> {
        let mut header = self.response_header.take();
        let mut generation = 0u64;
        let mut stage = 0u32;

        loop {
            let received = pump_down(&mut reader, &mut sink, &mut header, downloaded).await?;
            if received > 0 {
                break;
            }
            let Some(retry) = self.retry.as_mut() else {
                break;
            };

            info!(generation, stage, "destination closed without data, retrying");
            let Some(stream) = retry.retry(stage).await else {
                debug!(stage, "no fallback left after empty response");
                break;
            };
            stage += 1;
            generation += 1;
            retries.fetch_add(1, Ordering::Relaxed);

            let (r, w) = tokio::io::split(stream);
            reader = r;
            if generations.send(Generation { id: generation, writer: w }).await.is_err() {
                break;
            }
        }

        let _ = sink.close().await;
        Ok(())
    }
}

/// 把当前代次的下行字节送给客户端，返回本代次收到的字节数
async fn pump_down(
    reader: &mut ReadHalf<ProxyStream>,
    sink: &mut ChunkSink,
    header: &mut Option<Bytes>,
    downloaded: &AtomicU64,
) -> Result<u64, ProxyError> {
    let mut received = 0u64;
    let mut buf = BytesMut::with_capacity(RELAY_BUF_SIZE);

    loop {
        buf.reserve(RELAY_BUF_SIZE);
        let n = match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "outbound read failed");
                break;
            }
        };
        received += n as u64;
        downloaded.fetch_add(n as u64, Ordering::Relaxed);

        let data = buf.split().freeze();
        let chunk = match header.take() {
            Some(h) => {
                let mut joined = BytesMut::with_capacity(h.len() + data.len());
                joined.extend_from_slice(&h);
                joined.extend_from_slice(&data);
                joined.freeze()
            }
            None => data,
        };
        sink.send(chunk).await?;
    }

    Ok(received)
}

async fn uplink(
    mut source: ChunkSource,
    first: Generation,
    mut generations: mpsc::Receiver<Generation>,
    uploaded: &AtomicU64,
) -> Result<(), ProxyError> {
    let mut current = Some(first);
    let mut pending: VecDeque<Bytes> = VecDeque::new();

    loop {
        tokio::select! {
            Some(next) = generations.recv() => {
                debug!(generation = next.id, pending = pending.len(), "outbound generation switched");
                // 旧写端在这里被释放
                current = Some(next);
                flush_pending(&mut current, &mut pending).await;
            }
            chunk = source.next() => match chunk {
                None => {
                    if let Some(gen) = current.as_mut() {
                        let _ = gen.writer.shutdown().await;
                    }
                    return Ok(());
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    uploaded.fetch_add(data.len() as u64, Ordering::Relaxed);
                    pending.push_back(data);
                    flush_pending(&mut current, &mut pending).await;
                }
            }
        }
    }
}

/// 按顺序写出暂存块；写失败时丢弃当前写端，剩余块留给下一代
async fn flush_pending(current: &mut Option<Generation>, pending: &mut VecDeque<Bytes>) {
    let Some(gen) = current.as_mut() else {
        return;
    };
    while let Some(chunk) = pending.front() {
        if let Err(e) = gen.writer.write_all(chunk).await {
            debug!(generation = gen.id, error = %e, "outbound write failed, holding chunks");
            *current = None;
            return;
        }
        pending.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use tokio::io::{duplex, DuplexStream};

    use crate::proxy::transport::{channel_sink, channel_source};

    /// 按顺序交出预先准备的连接，并先写入重放的首包
    struct ScriptedRetry {
        stages: Arc<Mutex<Vec<u32>>>,
        streams: VecDeque<DuplexStream>,
        replay: &'static [u8],
    }

    #[async_trait]
    impl NoDataRetry for ScriptedRetry {
        async fn retry(&mut self, stage: u32) -> Option<ProxyStream> {
            self.stages.lock().unwrap().push(stage);
            let mut stream = self.streams.pop_front()?;
            stream.write_all(self.replay).await.ok()?;
            Some(Box::new(stream))
        }
    }

    #[tokio::test]
    async fn header_prepended_once() {
        let (_src_tx, src_rx) = mpsc::channel(8);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        let (a, mut b) = duplex(1024);

        let relay = DuplexRelay::new(Some(Bytes::from_static(&[0, 0])));
        let task = tokio::spawn(relay.run(channel_source(src_rx), channel_sink(sink_tx), Box::new(a)));

        b.write_all(b"ab").await.unwrap();
        assert_eq!(&sink_rx.recv().await.unwrap()[..], &[0, 0, b'a', b'b']);
        b.write_all(b"cd").await.unwrap();
        assert_eq!(&sink_rx.recv().await.unwrap()[..], b"cd");
        drop(b);

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.downloaded, 4);
        assert_eq!(stats.retries, 0);
        assert!(sink_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn uplink_forwards_in_order() {
        let (src_tx, src_rx) = mpsc::channel(8);
        let (sink_tx, _sink_rx) = mpsc::channel(8);
        let (a, mut b) = duplex(1024);

        let task = tokio::spawn(DuplexRelay::new(None).run(channel_source(src_rx), channel_sink(sink_tx), Box::new(a)));
        for part in [&b"one "[..], b"two ", b"three"] {
            src_tx.send(Bytes::copy_from_slice(part)).await.unwrap();
        }
        let mut buf = [0u8; 13];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one two three");

        drop(src_tx);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.uploaded, 13);
    }

    #[tokio::test]
    async fn empty_close_retries_once_and_replays_payload_first() {
        let stages = Arc::new(Mutex::new(Vec::new()));
        let (src_tx, src_rx) = mpsc::channel(8);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        let (a1, mut b1) = duplex(1024);
        let (a2, mut b2) = duplex(1024);

        let relay = DuplexRelay::new(Some(Bytes::from_static(&[0, 0]))).with_retry(Box::new(ScriptedRetry {
            stages: stages.clone(),
            streams: VecDeque::from(vec![a2]),
            replay: b"payload",
        }));
        let task = tokio::spawn(relay.run(channel_source(src_rx), channel_sink(sink_tx), Box::new(a1)));

        src_tx.send(Bytes::from_static(b"x")).await.unwrap();
        let mut one = [0u8; 1];
        b1.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"x");
        // destination accepted and closed without replying
        drop(b1);

        let mut replay = [0u8; 7];
        b2.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay, b"payload");

        src_tx.send(Bytes::from_static(b"y")).await.unwrap();
        b2.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"y");

        b2.write_all(b"pong").await.unwrap();
        assert_eq!(&sink_rx.recv().await.unwrap()[..], &[0, 0, b'p', b'o', b'n', b'g']);
        drop(b2);

        let stats = task.await.unwrap().unwrap();
        assert_eq!(*stages.lock().unwrap(), vec![0]);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.uploaded, 2);
        assert_eq!(stats.downloaded, 4);
    }

    #[tokio::test]
    async fn escalates_through_stages_then_closes() {
        let stages = Arc::new(Mutex::new(Vec::new()));
        let (_src_tx, src_rx) = mpsc::channel(8);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);

        let (a1, b1) = duplex(64);
        let (a2, b2) = duplex(64);
        let (a3, b3) = duplex(64);
        drop((b1, b2, b3));

        let relay = DuplexRelay::new(Some(Bytes::from_static(&[0, 0]))).with_retry(Box::new(ScriptedRetry {
            stages: stages.clone(),
            streams: VecDeque::from(vec![a2, a3]),
            replay: b"",
        }));
        let stats = relay
            .run(channel_source(src_rx), channel_sink(sink_tx), Box::new(a1))
            .await
            .unwrap();

        assert_eq!(*stages.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.downloaded, 0);
        // header never sent, sink closed
        assert!(sink_rx.recv().await.is_none());
    }
}
