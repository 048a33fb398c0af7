//! WebSocket 桥接
//!
//! 在网关前面接管 `Upgrade: websocket` 请求：握手后把客户端消息逐条写成
//! 以换行结尾的请求体，再把响应体按行拆开，每行作为一条文本消息发回。
//! 普通请求原样交给被包装的处理器。

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{
    CONNECTION, HeaderMap, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::server::body::{self, Body};
use crate::server::router::{HandlerFuture, HttpHandler, SharedHandler};
use crate::utils::logger::Logger;

/// 改写桥接后发往内层处理器的请求
pub type RequestMutator = Arc<dyn Fn(&mut Request<Body>) + Send + Sync>;

/// 把方法统一改写为 POST
pub fn force_post() -> RequestMutator {
    Arc::new(|request: &mut Request<Body>| *request.method_mut() = Method::POST)
}

fn header_has_token(headers: &HeaderMap, name: hyper::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case(token))
}

/// 是否是 WebSocket 升级请求
pub fn is_websocket_upgrade<B>(request: &Request<B>) -> bool {
    header_has_token(request.headers(), CONNECTION, "upgrade")
        && header_has_token(request.headers(), UPGRADE, "websocket")
}

/// WebSocket 升级代理
pub struct WebsocketProxy {
    inner: SharedHandler,
    mutator: Option<RequestMutator>,
    logger: Logger,
}

impl WebsocketProxy {
    pub fn new(inner: SharedHandler, logger: Logger) -> Self {
        Self {
            inner,
            mutator: None,
            logger,
        }
    }

    pub fn with_request_mutator(mut self, mutator: RequestMutator) -> Self {
        self.mutator = Some(mutator);
        self
    }
}

impl HttpHandler for WebsocketProxy {
    fn call(&self, mut request: Request<Body>) -> HandlerFuture {
        if !is_websocket_upgrade(&request) {
            return self.inner.call(request);
        }
        let Some(key) = request.headers().get(SEC_WEBSOCKET_KEY).cloned() else {
            return Box::pin(async {
                body::text_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key")
            });
        };
        let accept = derive_accept_key(key.as_bytes());

        let on_upgrade = hyper::upgrade::on(&mut request);
        let (parts, _) = request.into_parts();
        let inner = self.inner.clone();
        let mutator = self.mutator.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let socket =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                    bridge(socket, parts, inner, mutator, logger).await;
                }
                Err(e) => logger.debug(format!("❌ WebSocket 升级失败: {}", e)),
            }
        });

        Box::pin(async move {
            let mut response = Response::new(body::empty());
            *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
            let headers = response.headers_mut();
            headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
            headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
            if let Ok(value) = HeaderValue::from_str(&accept) {
                headers.insert(SEC_WEBSOCKET_ACCEPT, value);
            }
            response
        })
    }
}

async fn bridge<S>(
    socket: WebSocketStream<S>,
    mut parts: hyper::http::request::Parts,
    inner: SharedHandler,
    mutator: Option<RequestMutator>,
    logger: Logger,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = socket.split();
    for name in [
        CONNECTION,
        UPGRADE,
        SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_VERSION,
        SEC_WEBSOCKET_EXTENSIONS,
        SEC_WEBSOCKET_PROTOCOL,
    ] {
        parts.headers.remove(name);
    }

    let client_gone = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(16);
    {
        let client_gone = client_gone.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let payload = match message {
                    Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        logger.debug(format!("🔌 WebSocket 读取结束: {}", e));
                        break;
                    }
                };
                let mut chunk = BytesMut::with_capacity(payload.len() + 1);
                chunk.extend_from_slice(&payload);
                chunk.put_u8(b'\n');
                if tx.send(Ok(Frame::data(chunk.freeze()))).await.is_err() {
                    break;
                }
            }
            client_gone.cancel();
        });
    }

    let mut request = Request::from_parts(parts, StreamBody::new(ReceiverStream::new(rx)).boxed_unsync());
    if let Some(mutator) = &mutator {
        mutator(&mut request);
    }
    logger.debug(format!("🔀 WebSocket 桥接请求: {} {}", request.method(), request.uri().path()));

    let response = inner.call(request).await;
    let mut data = response.into_body().into_data_stream();
    let mut pending = BytesMut::new();
    loop {
        let chunk = tokio::select! {
            _ = client_gone.cancelled() => break,
            chunk = data.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => {
                pending.extend_from_slice(&chunk);
                for line in body::take_lines(&mut pending) {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if sink.send(Message::text(text)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                logger.debug(format!("❌ 网关响应中断: {}", e));
                break;
            }
            None => break,
        }
    }
    let rest = String::from_utf8_lossy(&pending).trim().to_string();
    if !rest.is_empty() {
        let _ = sink.send(Message::text(rest)).await;
    }
    let _ = sink.close().await;
}
