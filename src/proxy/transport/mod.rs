//! 入站传输
//!
//! 会话层只看到两样东西：一个按块产出客户端字节的 [`ChunkSource`]，
//! 以及一个把字节块送回客户端的 [`ChunkSink`]。WebSocket 和分块 HTTP
//! 各自把底层连接适配成这两种形态。

pub mod ws;
pub mod xhttp;

use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Sink, StreamExt};
use tokio::sync::mpsc;

use crate::common::ProxyError;

/// 客户端 -> 网关
pub type ChunkSource = BoxStream<'static, Result<Bytes, ProxyError>>;

/// 网关 -> 客户端
pub type ChunkSink = Pin<Box<dyn Sink<Bytes, Error = ProxyError> + Send>>;

/// 由 channel 驱动的数据源，发送端关闭即 EOF
pub fn channel_source(rx: mpsc::Receiver<Bytes>) -> ChunkSource {
    futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (Ok(chunk), rx)) }).boxed()
}

/// 写入 channel 的回写端，接收端关闭后发送失败
pub fn channel_sink(tx: mpsc::Sender<Bytes>) -> ChunkSink {
    Box::pin(futures_util::sink::unfold(tx, |tx, chunk: Bytes| async move {
        tx.send(chunk)
            .await
            .map_err(|_| ProxyError::Io(std::io::ErrorKind::BrokenPipe.into()))?;
        Ok::<_, ProxyError>(tx)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;

    #[tokio::test]
    async fn channel_adapters() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = channel_source(rx);
        tx.send(Bytes::from_static(b"abc")).await.unwrap();
        drop(tx);
        assert_eq!(source.next().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(source.next().await.is_none());

        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = channel_sink(tx);
        sink.send(Bytes::from_static(b"xyz")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"xyz"));
        drop(rx);
        assert!(sink.send(Bytes::from_static(b"late")).await.is_err());
    }
}
