use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::common::{ProxyError, ProxyErrorKind};
use crate::proxy::outbound::socks5::UpstreamProxy;
use crate::proxy::transport::ws::{decode_early_data, split_socket};
use crate::proxy::transport::xhttp::{handle_stream_request, StreamTunnel};
use crate::proxy::{accept_inbound_session, SessionContext};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

const WELCOME_PAGE: &str = "<!DOCTYPE html><html><head><title>Welcome to nginx!</title>\
<style>body{width:35em;margin:0 auto;font-family:Tahoma,Verdana,Arial,sans-serif;}</style></head>\
<body><h1>Welcome to nginx!</h1><p>If you see this page, the nginx web server is successfully installed and working. \
Further configuration is required.</p><p>For online documentation and support please refer to \
<a href=\"http://nginx.org/\">nginx.org</a>.<br/>Commercial support is available at \
<a href=\"http://nginx.com/\">nginx.com</a>.</p><p><em>Thank you for using nginx.</em></p></body></html>";

#[derive(Clone)]
pub struct AppState {
    pub session: SessionContext,
    /// 分块 HTTP 隧道是否启用
    pub stream_transport: bool,
    /// `/` + uuid 前 8 位
    pub stream_path: Arc<str>,
    pub redirect: Option<Arc<str>>,
}

impl AppState {
    /// 应用单个请求的 `proxyip` / `socks5` 覆盖参数
    pub fn session_for(&self, params: &HashMap<String, String>) -> SessionContext {
        let relay = params
            .get("proxyip")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let upstream = params.get("socks5").and_then(|s| match UpstreamProxy::parse(s) {
            Ok(proxy) => Some(Arc::new(proxy)),
            Err(e) => {
                debug!(error = %e, "ignoring socks5 override");
                None
            }
        });
        if relay.is_none() && upstream.is_none() {
            return self.session.clone();
        }
        let connector = self.session.connector.with_overrides(relay, upstream);
        self.session.clone().with_connector(connector)
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// 所有路径共用的入口
pub async fn gateway(State(state): State<AppState>, req: Request) -> Response {
    let (mut parts, body) = req.into_parts();
    let params = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|q| q.0)
        .unwrap_or_default();
    let path = parts.uri.path().to_string();

    if is_websocket_upgrade(&parts.headers) {
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => websocket(ws, &parts.headers, state.session_for(&params)),
            Err(rejection) => rejection.into_response(),
        };
    }

    if parts.method == Method::POST && path != "/" {
        if state.stream_transport {
            return stream(state.session_for(&params), &parts.headers, body).await;
        }
        if path == *state.stream_path || content_type(&parts.headers) == "application/grpc" {
            return (StatusCode::FORBIDDEN, "stream transport is disabled").into_response();
        }
    }

    if path == "/" {
        if let Some(url) = state.redirect.as_deref() {
            return (StatusCode::FOUND, [(header::LOCATION, url)]).into_response();
        }
        return Html(WELCOME_PAGE).into_response();
    }

    (StatusCode::NOT_FOUND, "404 Not Found").into_response()
}

fn websocket(ws: WebSocketUpgrade, headers: &HeaderMap, ctx: SessionContext) -> Response {
    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let early = decode_early_data(protocol.as_deref());
    // 客户端要求回显子协议
    let ws = match protocol {
        Some(p) => ws.protocols([p]),
        None => ws,
    };

    ws.on_upgrade(move |socket| async move {
        match early {
            Ok(early) => {
                let (source, sink) = split_socket(socket, early);
                let _ = accept_inbound_session(ctx, source, sink, "ws");
            }
            Err(e) => debug!(error = %e, "dropping upgrade with malformed early data"),
        }
    })
}

async fn stream(ctx: SessionContext, headers: &HeaderMap, body: Body) -> Response {
    let source = body
        .into_data_stream()
        .map_err(|e| ProxyError::Io(std::io::Error::other(e)))
        .boxed();

    match handle_stream_request(source, &ctx).await {
        Ok(Some(StreamTunnel { response, header: target, .. })) => {
            info!(dest = %target.address, port = target.port, "stream tunnel established");
            (
                [
                    (header::CONTENT_TYPE, "application/grpc"),
                    (header::CACHE_CONTROL, "no-store"),
                    (X_ACCEL_BUFFERING, "no"),
                ],
                Body::from_stream(response),
            )
                .into_response()
        }
        Ok(None) => {
            let ct = content_type(headers);
            if ct.contains("application/x-www-form-urlencoded") || ct.contains("multipart/form-data") {
                (StatusCode::BAD_REQUEST, "form submission on a stream path").into_response()
            } else {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
        Err(e) if e.kind() == ProxyErrorKind::BannedDestination => StatusCode::FORBIDDEN.into_response(),
        Err(e) => {
            debug!(error_code = e.kind().as_str(), error = %e, "stream tunnel failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
