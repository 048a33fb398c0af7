//! HTTP/JSON -> RPC 网关
//!
//! 网关自己就是本节点的 RPC 客户端：通过回环通道把 REST 请求翻译成 RPC 调用。
//! 每个 API 分组注册一张路由表（见 [`api`]），路径 -> (RPC 方法, 调用形态)。

pub mod api;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ServeError, ServeResult};
use crate::server::body::{self, Body};
use crate::server::router::{HandlerFuture, HttpHandler};
use crate::server::rpc::{Code, DialCredentials, MessageStream, RpcChannel, RpcStatus};
use crate::utils::logger::Logger;

/// 调用形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ServerStream,
    Bidi,
}

/// 一条网关路由
#[derive(Debug, Clone)]
pub struct Route {
    /// RPC 方法路径，例如 `/etcdserverpb.KV/Range`
    pub method: String,
    pub kind: CallKind,
}

/// JSON <-> RPC 消息的编解码能力
pub trait Marshaler: Send + Sync {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    /// 请求 JSON -> RPC 消息
    fn unmarshal(&self, json: &[u8]) -> Result<Bytes, RpcStatus>;

    /// RPC 消息 -> 响应 JSON
    fn marshal(&self, message: &[u8]) -> Result<Bytes, RpcStatus>;
}

/// 默认编解码：RPC 消息本身就是 JSON，只做校验与规整
#[derive(Debug, Clone, Default)]
pub struct JsonPassthrough {
    pub indent: bool,
}

impl JsonPassthrough {
    fn normalize(&self, raw: &[u8]) -> Result<Bytes, serde_json::Error> {
        let value: Value = serde_json::from_slice(raw)?;
        let encoded = if self.indent {
            serde_json::to_vec_pretty(&value)?
        } else {
            serde_json::to_vec(&value)?
        };
        Ok(Bytes::from(encoded))
    }
}

impl Marshaler for JsonPassthrough {
    fn unmarshal(&self, json: &[u8]) -> Result<Bytes, RpcStatus> {
        self.normalize(json)
            .map_err(|e| RpcStatus::invalid_argument(format!("invalid JSON request: {}", e)))
    }

    fn marshal(&self, message: &[u8]) -> Result<Bytes, RpcStatus> {
        self.normalize(message)
            .map_err(|e| RpcStatus::internal(format!("reply is not JSON: {}", e)))
    }
}

struct GatewayInner {
    channel: Arc<RpcChannel>,
    marshaler: Arc<dyn Marshaler>,
    logger: Logger,
}

/// 网关路由器
pub struct GatewayMux {
    routes: BTreeMap<String, Route>,
    inner: Arc<GatewayInner>,
}

impl GatewayMux {
    pub fn new(channel: Arc<RpcChannel>, marshaler: Arc<dyn Marshaler>, logger: Logger) -> Self {
        Self {
            routes: BTreeMap::new(),
            inner: Arc::new(GatewayInner {
                channel,
                marshaler,
                logger,
            }),
        }
    }

    /// 注册路由；同一路径重复注册返回错误
    pub fn handle(&mut self, path: &str, method: &str, kind: CallKind) -> ServeResult<()> {
        if self.routes.contains_key(path) {
            return Err(ServeError::RegistrationError(format!(
                "gateway route {} registered twice",
                path
            )));
        }
        self.routes.insert(
            path.to_string(),
            Route {
                method: method.to_string(),
                kind,
            },
        );
        Ok(())
    }

    pub fn route(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn channel(&self) -> &Arc<RpcChannel> {
        &self.inner.channel
    }
}

impl HttpHandler for GatewayMux {
    fn call(&self, request: Request<Body>) -> HandlerFuture {
        let Some(route) = self.route(request.uri().path()).cloned() else {
            let status = RpcStatus::not_found(format!("no route for {}", request.uri().path()));
            return Box::pin(async move { error_response(&status) });
        };

        let allowed = match route.kind {
            CallKind::Unary => request.method() == Method::POST || request.method() == Method::GET,
            CallKind::ServerStream | CallKind::Bidi => request.method() == Method::POST,
        };
        if !allowed {
            let status = RpcStatus::unimplemented(format!("method {} not allowed", request.method()));
            return Box::pin(async move {
                let mut response = error_response(&status);
                *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                response
            });
        }

        let inner = self.inner.clone();
        Box::pin(async move {
            inner
                .logger
                .debug(format!("🌉 网关转发 {} -> {}", request.uri().path(), route.method));
            match route.kind {
                CallKind::Unary => inner.unary(&route, request).await,
                CallKind::ServerStream | CallKind::Bidi => inner.streaming(&route, request).await,
            }
        })
    }
}

impl GatewayInner {
    async fn unary(&self, route: &Route, request: Request<Body>) -> Response<Body> {
        let payload = match read_document(request.into_body()).await {
            Ok(payload) => payload,
            Err(status) => return error_response(&status),
        };
        let message = match self.marshaler.unmarshal(&payload) {
            Ok(message) => message,
            Err(status) => return error_response(&status),
        };
        let reply = match self.channel.unary(&route.method, message).await {
            Ok(reply) => reply,
            Err(status) => return error_response(&status),
        };
        match self.marshaler.marshal(&reply) {
            Ok(json) => {
                let mut response = Response::new(body::full(json));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(self.marshaler.content_type()));
                response
            }
            Err(status) => error_response(&status),
        }
    }

    async fn streaming(&self, route: &Route, request: Request<Body>) -> Response<Body> {
        let requests: MessageStream = match route.kind {
            CallKind::Bidi => request_lines(request.into_body(), self.marshaler.clone()),
            _ => {
                let payload = match read_document(request.into_body()).await {
                    Ok(payload) => payload,
                    Err(status) => return error_response(&status),
                };
                match self.marshaler.unmarshal(&payload) {
                    Ok(message) => Box::pin(futures_util::stream::once(async move { Ok(message) })),
                    Err(status) => return error_response(&status),
                }
            }
        };

        let replies = match self.channel.call(&route.method, requests).await {
            Ok(replies) => replies,
            Err(status) => return error_response(&status),
        };
        let marshaler = self.marshaler.clone();
        let frames = replies.map(move |reply| {
            let line = match reply.and_then(|message| marshaler.marshal(&message)) {
                Ok(json) => result_line(&json),
                Err(status) => stream_error_line(&status),
            };
            Ok::<_, BoxError>(Frame::data(line))
        });

        let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(self.marshaler.content_type()));
        response
    }
}

/// 读取整个请求体；空请求体视为 `{}`
async fn read_document(incoming: Body) -> Result<Bytes, RpcStatus> {
    let payload = body::collect_bytes(incoming)
        .await
        .map_err(|e| RpcStatus::invalid_argument(format!("unable to read request body: {}", e)))?;
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Bytes::from_static(b"{}"));
    }
    Ok(payload)
}

/// 按行把请求体拆成请求消息
fn request_lines(incoming: Body, marshaler: Arc<dyn Marshaler>) -> MessageStream {
    Box::pin(async_stream::stream! {
        let mut data = incoming.into_data_stream();
        let mut pending = BytesMut::new();
        while let Some(chunk) = data.next().await {
            match chunk {
                Ok(chunk) => {
                    pending.extend_from_slice(&chunk);
                    for line in body::take_lines(&mut pending) {
                        yield marshaler.unmarshal(&line);
                    }
                }
                Err(e) => {
                    yield Err(RpcStatus::cancelled(format!("request body aborted: {}", e)));
                    return;
                }
            }
        }
        let rest = pending.split().freeze();
        if rest.iter().any(|b| !b.is_ascii_whitespace()) {
            yield marshaler.unmarshal(&rest);
        }
    })
}

fn result_line(json: &[u8]) -> Bytes {
    let mut line = BytesMut::with_capacity(json.len() + 12);
    line.extend_from_slice(b"{\"result\":");
    line.extend_from_slice(json);
    line.extend_from_slice(b"}\n");
    line.freeze()
}

fn stream_error_line(status: &RpcStatus) -> Bytes {
    let http_status = status.code().http_status();
    let value = json!({
        "error": {
            "grpc_code": status.code().as_i32(),
            "http_code": http_status.as_u16(),
            "message": status.message(),
            "http_status": http_status.canonical_reason().unwrap_or_default(),
        }
    });
    let mut line = value.to_string().into_bytes();
    line.push(b'\n');
    Bytes::from(line)
}

/// RPC 状态 -> HTTP 错误响应
pub fn error_response(status: &RpcStatus) -> Response<Body> {
    let code = if status.code() == Code::Ok {
        Code::Unknown
    } else {
        status.code()
    };
    body::json_response(
        code.http_status(),
        &json!({
            "error": status.message(),
            "code": code.as_i32(),
            "message": status.message(),
        }),
    )
}

/// 建立回环通道并注册所有 API 分组；生命周期结束时关闭通道
pub fn register_gateway(
    addr: SocketAddr,
    credentials: DialCredentials,
    lifecycle: CancellationToken,
    marshaler: Arc<dyn Marshaler>,
    logger: Logger,
) -> ServeResult<GatewayMux> {
    let channel = Arc::new(RpcChannel::new(addr, credentials, logger.scoped("loopback")));
    let mut mux = GatewayMux::new(channel.clone(), marshaler, logger.clone());
    for register in api::HANDLERS {
        register(&mut mux)?;
    }
    logger.debug(format!("🌉 网关已注册 {} 条路由，回连 {}", mux.len(), addr));

    tokio::spawn(async move {
        lifecycle.cancelled().await;
        if let Err(e) = channel.close().await {
            logger.warn(format!("⚠️ 关闭到 {} 的回环连接失败: {}", addr, e));
        }
    });
    Ok(mux)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux() -> GatewayMux {
        // 指向一个不会有人监听的地址，拨号是惰性的
        let channel = Arc::new(RpcChannel::new(
            "127.0.0.1:1".parse().unwrap(),
            DialCredentials::Insecure,
            Logger::discard(),
        ));
        GatewayMux::new(channel, Arc::new(JsonPassthrough::default()), Logger::discard())
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = body::collect_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn passthrough_validates_json() {
        let marshaler = JsonPassthrough::default();
        assert_eq!(marshaler.unmarshal(b" {\"key\": \"Zm9v\"} ").unwrap(), Bytes::from_static(b"{\"key\":\"Zm9v\"}"));
        assert_eq!(marshaler.unmarshal(b"{oops").unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(marshaler.marshal(b"\x00\x01").unwrap_err().code(), Code::Internal);
    }

    #[test]
    fn duplicate_route_is_rejected() {
        let mut mux = mux();
        mux.handle("/v3beta/kv/range", "/etcdserverpb.KV/Range", CallKind::Unary).unwrap();
        let err = mux.handle("/v3beta/kv/range", "/etcdserverpb.KV/Range", CallKind::Unary);
        assert!(matches!(err, Err(ServeError::RegistrationError(_))));
    }

    #[test]
    fn stream_lines_are_newline_delimited() {
        assert_eq!(&result_line(b"{\"a\":1}")[..], b"{\"result\":{\"a\":1}}\n");
        let line = stream_error_line(&RpcStatus::not_found("gone"));
        let value: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["error"]["grpc_code"], 5);
        assert_eq!(value["error"]["http_code"], 404);
        assert!(line.ends_with(b"\n"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let request = Request::builder().uri("/v3beta/nope").body(body::empty()).unwrap();
        let response = mux().call(request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], 5);
    }

    #[tokio::test]
    async fn streaming_route_requires_post() {
        let mut mux = mux();
        mux.handle("/v3beta/watch", "/etcdserverpb.Watch/Watch", CallKind::Bidi).unwrap();
        let request = Request::builder().uri("/v3beta/watch").body(body::empty()).unwrap();
        assert_eq!(mux.call(request).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unreachable_node_maps_to_503() {
        let mut mux = mux();
        mux.handle("/v3beta/kv/range", "/etcdserverpb.KV/Range", CallKind::Unary).unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v3beta/kv/range")
            .body(body::full("{\"key\":\"Zm9v\"}"))
            .unwrap();
        let response = mux.call(request).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["code"], 14);
    }

    #[tokio::test]
    async fn bad_json_is_400() {
        let mut mux = mux();
        mux.handle("/v3beta/kv/put", "/etcdserverpb.KV/Put", CallKind::Unary).unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v3beta/kv/put")
            .body(body::full("{not json"))
            .unwrap();
        assert_eq!(mux.call(request).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn registers_every_group_and_closes_on_cancel() {
        let lifecycle = CancellationToken::new();
        let (logger, logs) = Logger::capturing("gateway");
        let mux = register_gateway(
            "127.0.0.1:1".parse().unwrap(),
            DialCredentials::Insecure,
            lifecycle.clone(),
            Arc::new(JsonPassthrough::default()),
            logger,
        )
        .unwrap();
        assert!(mux.route("/v3beta/kv/range").is_some());
        assert_eq!(mux.route("/v3beta/watch").unwrap().kind, CallKind::Bidi);
        assert!(mux.route("/v3beta/lock/lock").is_some());
        assert!(mux.route("/v3beta/election/observe").is_some());

        let channel = mux.channel().clone();
        lifecycle.cancel();
        for _ in 0..100 {
            if channel.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(channel.is_closed());
        assert!(logs.lock().unwrap().iter().all(|(_, line)| !line.contains("失败")));
    }
}
