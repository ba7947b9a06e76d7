//! WebSocket 入站适配
//!
//! 二进制帧与文本帧都按原始字节交给会话；Ping/Pong 由 axum 处理，这里跳过；
//! Close 帧结束数据源。

use std::future::ready;

use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use futures_util::{stream, Sink, SinkExt, Stream, StreamExt};

use super::{ChunkSink, ChunkSource};
use crate::common::ProxyError;

/// 携带 0-RTT 数据的握手头
pub const EARLY_DATA_HEADER: &str = "sec-websocket-protocol";

enum Frame {
    Data(Bytes),
    Skip,
    Close,
    Failed(ProxyError),
}

fn classify<E>(msg: Result<Message, E>) -> Frame
where
    E: std::error::Error + Send + Sync + 'static,
{
    match msg {
        Ok(Message::Binary(data)) => Frame::Data(data),
        Ok(Message::Text(text)) => Frame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
        Ok(Message::Close(_)) => Frame::Close,
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Frame::Skip,
        Err(e) => Frame::Failed(ProxyError::Io(std::io::Error::other(e))),
    }
}

/// 解码 early data（base64url，允许省略填充）
///
/// 头不存在或为空时返回 `None`；内容不是合法 base64 时会话应当中止。
pub fn decode_early_data(header: Option<&str>) -> Result<Option<Bytes>, ProxyError> {
    let raw = match header.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };
    let normalized: String = raw
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    let decoded = STANDARD_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| ProxyError::Protocol(format!("invalid early data: {}", e)))?;
    if decoded.is_empty() {
        return Ok(None);
    }
    Ok(Some(Bytes::from(decoded)))
}

/// 把 WebSocket 帧流转换为会话数据源，early data 排在最前
pub fn frame_source<S, E>(frames: S, early_data: Option<Bytes>) -> ChunkSource
where
    S: Stream<Item = Result<Message, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let frames = frames
        .map(classify)
        .take_while(|f| ready(!matches!(f, Frame::Close)))
        .filter_map(|f| {
            ready(match f {
                Frame::Data(data) => Some(Ok(data)),
                Frame::Failed(e) => Some(Err(e)),
                Frame::Skip | Frame::Close => None,
            })
        });
    stream::iter(early_data.map(Ok)).chain(frames).boxed()
}

/// 回写端：每个字节块作为一个二进制帧发送
pub fn frame_sink<S, E>(sink: S) -> ChunkSink
where
    S: Sink<Message, Error = E> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    Box::pin(
        sink.sink_map_err(|e| ProxyError::Io(std::io::Error::other(e)))
            .with(|chunk: Bytes| ready(Ok::<_, ProxyError>(Message::Binary(chunk)))),
    )
}

/// 拆分已升级的 WebSocket
pub fn split_socket(socket: WebSocket, early_data: Option<Bytes>) -> (ChunkSource, ChunkSink) {
    let (tx, rx) = socket.split();
    (frame_source(rx, early_data), frame_sink(tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn early_data_variants() {
        assert_eq!(decode_early_data(None).unwrap(), None);
        assert_eq!(decode_early_data(Some("  ")).unwrap(), None);
        // "hello?>" -> aGVsbG8_Pg in url-safe form
        assert_eq!(
            decode_early_data(Some("aGVsbG8_Pg")).unwrap().unwrap(),
            Bytes::from_static(b"hello?>")
        );
        assert_eq!(
            decode_early_data(Some("aGVsbG8_Pg==")).unwrap().unwrap(),
            Bytes::from_static(b"hello?>")
        );
        assert_eq!(decode_early_data(Some("+/8")).unwrap().unwrap(), Bytes::from_static(&[0xfb, 0xff]));
    }

    #[test]
    fn invalid_early_data_is_protocol_error() {
        let err = decode_early_data(Some("not base64!")).unwrap_err();
        assert_eq!(err.kind(), crate::common::ProxyErrorKind::Protocol);
    }

    #[tokio::test]
    async fn source_orders_early_data_and_stops_at_close() {
        let frames = stream::iter(vec![
            Ok::<_, io::Error>(Message::Binary(Bytes::from_static(b"one"))),
            Ok(Message::Ping(Bytes::new())),
            Ok(Message::Text("two".to_string().into())),
            Ok(Message::Close(None)),
            Ok(Message::Binary(Bytes::from_static(b"after close"))),
        ]);
        let collected: Vec<Bytes> = frame_source(frames, Some(Bytes::from_static(b"zero")))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            collected,
            vec![
                Bytes::from_static(b"zero"),
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
            ]
        );
    }

    #[tokio::test]
    async fn source_surfaces_transport_errors() {
        let frames = stream::iter(vec![Err::<Message, _>(io::Error::from(io::ErrorKind::ConnectionReset))]);
        let mut source = frame_source(frames, None);
        assert!(source.next().await.unwrap().is_err());
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn sink_sends_binary_frames() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let frames = futures_util::sink::unfold(tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok::<_, io::Error>(tx)
        });
        let mut sink = frame_sink(frames);
        sink.send(Bytes::from_static(b"payload")).await.unwrap();
        match rx.recv().await.unwrap() {
            Message::Binary(b) => assert_eq!(b, Bytes::from_static(b"payload")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
