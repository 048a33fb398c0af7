//! RPC 服务器
//!
//! 两种传输：
//! - `serve`：在子监听器上直接跑 h2（明文模式）
//! - `serve_http`：作为 HTTP 处理器挂在 hyper 服务器里（TLS 模式）
//!
//! `graceful_stop` 停止接收新连接并等待在途流结束；`stop` 立即中止所有连接与流。

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::poll_fn;
use futures_util::{Stream, StreamExt};
use h2::{RecvStream, SendStream};
use h2::server::SendResponse;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{BoxError, ServeError, ServeResult};
use crate::server::body::{self, Body};
use crate::server::cmux::SubListener;
use crate::utils::logger::Logger;

use super::codec::{MessageDecoder, RPC_CONTENT_TYPE, encode_message};
use super::registry::{MessageStream, RpcHandler, RpcReply, RpcRequest, ServiceRegistry};
use super::status::RpcStatus;

/// RPC 引擎参数
#[derive(Debug, Clone)]
pub struct RpcServerOptions {
    pub max_recv_message_bytes: usize,
    pub max_concurrent_streams: u32,
    pub max_frame_size: u32,
}

impl Default for RpcServerOptions {
    fn default() -> Self {
        Self {
            max_recv_message_bytes: 4 * 1024 * 1024,
            max_concurrent_streams: 1_000,
            max_frame_size: 1024 * 1024,
        }
    }
}

/// 响应方向的输出单元
enum Outgoing {
    Message(Bytes),
    Trailers(HeaderMap),
}

struct Inner {
    registry: ServiceRegistry,
    options: RpcServerOptions,
    logger: Logger,
    /// 停止接收新连接
    quit: CancellationToken,
    /// 通知已有连接优雅退出（GOAWAY）
    drain: CancellationToken,
    /// 立即中止所有连接与流
    force: CancellationToken,
    /// 连接与流任务
    tracker: TaskTracker,
}

/// RPC 服务器句柄，克隆共享同一实例
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

impl RpcServer {
    pub fn new(registry: ServiceRegistry, options: RpcServerOptions, logger: Logger) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                options,
                logger,
                quit: CancellationToken::new(),
                drain: CancellationToken::new(),
                force: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.quit.is_cancelled()
    }

    /// 在子监听器上接受连接，直到服务器停止（`Ok`）或子监听器关闭（`ListenerClosed`）
    pub async fn serve(&self, mut listener: SubListener) -> ServeResult<()> {
        if self.is_stopped() {
            return Err(ServeError::ServerStopped);
        }
        let inner = &self.inner;
        inner.logger.info(format!("🚀 RPC 服务器开始服务: {}", listener.local_addr()));

        loop {
            let conn = tokio::select! {
                _ = inner.quit.cancelled() => return Ok(()),
                conn = listener.accept() => conn,
            };
            let conn = conn?;
            let server = self.clone();
            inner.tracker.spawn(async move {
                server.serve_connection(conn.stream, conn.remote_addr).await;
            });
        }
    }

    async fn serve_connection<IO>(&self, io: IO, remote_addr: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = &self.inner;
        let mut builder = h2::server::Builder::new();
        builder
            .max_frame_size(inner.options.max_frame_size)
            .max_concurrent_streams(inner.options.max_concurrent_streams);

        let mut connection = tokio::select! {
            _ = inner.force.cancelled() => return,
            handshake = builder.handshake::<_, Bytes>(io) => match handshake {
                Ok(connection) => connection,
                Err(e) => {
                    inner.logger.debug(format!("❌ HTTP/2 握手失败 {}: {}", remote_addr, e));
                    return;
                }
            },
        };
        inner.logger.debug(format!("✅ RPC 连接已建立: {}", remote_addr));

        let mut draining = false;
        loop {
            tokio::select! {
                _ = inner.force.cancelled() => {
                    inner.logger.debug(format!("🛑 强制关闭 RPC 连接: {}", remote_addr));
                    return;
                }
                _ = inner.drain.cancelled(), if !draining => {
                    connection.graceful_shutdown();
                    draining = true;
                }
                next = connection.accept() => match next {
                    Some(Ok((request, respond))) => {
                        let server = self.clone();
                        inner.tracker.spawn(async move {
                            server.serve_h2_stream(request, respond).await;
                        });
                    }
                    Some(Err(e)) => {
                        let message = e.to_string();
                        if ServeError::is_benign_disconnect(&message) || e.is_go_away() || e.is_io() {
                            inner.logger.debug(format!("🔌 RPC 连接断开 {}: {}", remote_addr, message));
                        } else {
                            inner.logger.warn(format!("⚠️ RPC 连接错误 {}: {}", remote_addr, message));
                        }
                        return;
                    }
                    None => break,
                },
            }
        }
        inner.logger.debug(format!("🔌 RPC 连接关闭: {}", remote_addr));
    }

    async fn serve_h2_stream(&self, request: Request<RecvStream>, mut respond: SendResponse<Bytes>) {
        let inner = &self.inner;
        if !is_rpc_content_type(request.headers()) {
            let mut response = Response::new(());
            *response.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
            let _ = respond.send_response(response, true);
            return;
        }

        let (parts, recv) = request.into_parts();
        let method = parts.uri.path().to_string();
        let messages = h2_messages(recv, inner.options.max_recv_message_bytes);
        let handler = inner.registry.lookup(&method);
        let frames = response_frames(handler, RpcRequest::new(method, parts.headers, messages));
        futures_util::pin_mut!(frames);

        let mut response = Response::new(());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
        let mut send = match respond.send_response(response, false) {
            Ok(send) => send,
            Err(e) => {
                inner.logger.debug(format!("❌ 发送 RPC 响应头失败: {}", e));
                return;
            }
        };

        loop {
            let next = tokio::select! {
                _ = inner.force.cancelled() => {
                    send.send_reset(h2::Reason::CANCEL);
                    return;
                }
                next = frames.next() => next,
            };
            let data = match next {
                Some(Outgoing::Message(data)) => data,
                Some(Outgoing::Trailers(trailers)) => {
                    let _ = send.send_trailers(trailers);
                    return;
                }
                None => return,
            };
            // 对端不读时在这里等窗口，处理器的流随之停住
            let sent = tokio::select! {
                _ = inner.force.cancelled() => None,
                sent = send_flow_controlled(&mut send, data) => Some(sent),
            };
            match sent {
                None => {
                    send.send_reset(h2::Reason::CANCEL);
                    return;
                }
                Some(Err(e)) => {
                    inner.logger.debug(format!("🔌 RPC 流被对端关闭: {}", e));
                    return;
                }
                Some(Ok(())) => {}
            }
        }
    }

    /// HTTP 处理器传输：请求来自 hyper 服务器
    pub async fn serve_http(&self, request: Request<Body>) -> Response<Body> {
        let inner = &self.inner;
        if inner.force.is_cancelled() {
            return trailers_only(RpcStatus::unavailable("rpc server is stopped"));
        }
        if !is_rpc_content_type(request.headers()) {
            return body::text_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, "invalid rpc content-type");
        }

        let (parts, incoming) = request.into_parts();
        let method = parts.uri.path().to_string();
        let messages = http_messages(incoming, inner.options.max_recv_message_bytes);
        let handler = inner.registry.lookup(&method);
        let frames = response_frames(handler, RpcRequest::new(method, parts.headers, messages))
            .map(|out| {
                Ok::<_, BoxError>(match out {
                    Outgoing::Message(data) => Frame::data(data),
                    Outgoing::Trailers(trailers) => Frame::trailers(trailers),
                })
            })
            .take_until(inner.force.clone().cancelled_owned());

        let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
        response
    }

    /// 停止接收新连接，通知现有连接退出并等待所有流结束
    pub async fn graceful_stop(&self) {
        let inner = &self.inner;
        inner.logger.info("🛑 RPC 服务器优雅停止中");
        inner.quit.cancel();
        inner.drain.cancel();
        inner.tracker.close();
        inner.tracker.wait().await;
        inner.logger.info("✅ RPC 服务器已优雅停止");
    }

    /// 立即关闭所有连接并中止在途流
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.force.is_cancelled() {
            inner.logger.info("🛑 RPC 服务器强制停止");
        }
        inner.quit.cancel();
        inner.drain.cancel();
        inner.force.cancel();
        inner.tracker.close();
    }

    /// 等待所有连接与流任务退出
    pub async fn wait(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

fn is_rpc_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with(RPC_CONTENT_TYPE))
        .unwrap_or(false)
}

/// 调用处理器并把结果展开成消息帧 + trailers
fn response_frames(
    handler: Option<Arc<dyn RpcHandler>>,
    request: RpcRequest,
) -> impl Stream<Item = Outgoing> + Send {
    async_stream::stream! {
        let status = match handler {
            None => RpcStatus::unimplemented(format!("unknown method {}", request.method)),
            Some(handler) => match handler.call(request).await {
                Ok(RpcReply::Unary(message)) => {
                    yield Outgoing::Message(encode_message(&message));
                    RpcStatus::ok()
                }
                Ok(RpcReply::Stream(mut replies)) => {
                    let mut status = RpcStatus::ok();
                    while let Some(reply) = replies.next().await {
                        match reply {
                            Ok(message) => yield Outgoing::Message(encode_message(&message)),
                            Err(e) => {
                                status = e;
                                break;
                            }
                        }
                    }
                    status
                }
                Err(status) => status,
            },
        };
        yield Outgoing::Trailers(status.to_header_map());
    }
}

/// 按流控窗口发送数据：先申请容量，拿到多少发多少，直到发完
pub(super) async fn send_flow_controlled(send: &mut SendStream<Bytes>, mut data: Bytes) -> Result<(), h2::Error> {
    while !data.is_empty() {
        send.reserve_capacity(data.len());
        let granted = match poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(Ok(granted)) => granted,
            Some(Err(e)) => return Err(e),
            None => return Err(h2::Error::from(h2::Reason::CANCEL)),
        };
        if granted == 0 {
            continue;
        }
        let chunk = data.split_to(granted.min(data.len()));
        send.send_data(chunk, false)?;
    }
    Ok(())
}

/// trailers-only 响应
fn trailers_only(status: RpcStatus) -> Response<Body> {
    let mut response = Response::new(body::empty());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
    response.headers_mut().extend(status.to_header_map());
    response
}

/// 把分片数据流解码为消息流
pub(crate) fn decode_messages<S>(chunks: S, max_message_bytes: usize) -> MessageStream
where
    S: Stream<Item = Result<Bytes, RpcStatus>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut decoder = MessageDecoder::new(max_message_bytes);
        futures_util::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    decoder.push(&chunk);
                    loop {
                        match decoder.next_message() {
                            Ok(Some(message)) => yield Ok(message),
                            Ok(None) => break,
                            Err(status) => {
                                yield Err(status);
                                return;
                            }
                        }
                    }
                }
                Err(status) => {
                    yield Err(status);
                    return;
                }
            }
        }
        if !decoder.is_empty() {
            yield Err(RpcStatus::internal("stream ended in the middle of a message"));
        }
    })
}

/// h2 请求体 -> 消息流（同时归还流控窗口）
pub(crate) fn h2_chunks(recv: RecvStream) -> impl Stream<Item = Result<Bytes, RpcStatus>> + Send {
    futures_util::stream::unfold(recv, |mut recv| async move {
        match recv.data().await? {
            Ok(chunk) => {
                let _ = recv.flow_control().release_capacity(chunk.len());
                Some((Ok(chunk), recv))
            }
            Err(e) => Some((Err(RpcStatus::cancelled(e.to_string())), recv)),
        }
    })
}

fn h2_messages(recv: RecvStream, max_message_bytes: usize) -> MessageStream {
    decode_messages(h2_chunks(recv), max_message_bytes)
}

fn http_messages(body: Body, max_message_bytes: usize) -> MessageStream {
    let chunks = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|e| RpcStatus::cancelled(e.to_string())));
    decode_messages(chunks, max_message_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::rpc::status::Code;
    use http_body_util::BodyExt;

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry
            .register("test.Echo", "Unary", |request: RpcRequest| async move {
                let message = request.into_message().await?;
                Ok::<_, RpcStatus>(RpcReply::Unary(message))
            })
            .unwrap();
        registry
            .register("test.Echo", "Fail", |_request: RpcRequest| async move {
                Err::<RpcReply, _>(RpcStatus::not_found("nothing here"))
            })
            .unwrap();
        registry
    }

    fn rpc_request(path: &str, payload: &[u8]) -> Request<Body> {
        let mut request = Request::new(body::full(encode_message(payload)));
        *request.method_mut() = hyper::Method::POST;
        *request.uri_mut() = path.parse().unwrap();
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
        request
    }

    async fn read_reply(response: Response<Body>) -> (Vec<Bytes>, RpcStatus) {
        let collected = response.into_body().collect().await.unwrap();
        let trailers = collected.trailers().cloned().unwrap_or_default();
        let status = RpcStatus::from_header_map(&trailers).unwrap();
        let mut decoder = MessageDecoder::new(1024);
        decoder.push(&collected.to_bytes());
        let mut messages = Vec::new();
        while let Some(message) = decoder.next_message().unwrap() {
            messages.push(message);
        }
        (messages, status)
    }

    #[tokio::test]
    async fn http_transport_round_trip() {
        let server = RpcServer::new(registry(), RpcServerOptions::default(), Logger::discard());
        let response = server.serve_http(rpc_request("/test.Echo/Unary", b"ping")).await;
        let (messages, status) = read_reply(response).await;
        assert!(status.is_ok());
        assert_eq!(messages, vec![Bytes::from_static(b"ping")]);
    }

    #[tokio::test]
    async fn http_transport_reports_status() {
        let server = RpcServer::new(registry(), RpcServerOptions::default(), Logger::discard());
        let (messages, status) = read_reply(server.serve_http(rpc_request("/test.Echo/Fail", b"")).await).await;
        assert!(messages.is_empty());
        assert_eq!(status.code(), Code::NotFound);

        let (_, status) = read_reply(server.serve_http(rpc_request("/test.Echo/Nope", b"")).await).await;
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn stopped_server_refuses_work() {
        let server = RpcServer::new(registry(), RpcServerOptions::default(), Logger::discard());
        server.stop();
        server.stop();
        let response = server.serve_http(rpc_request("/test.Echo/Unary", b"ping")).await;
        let status = RpcStatus::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::Unavailable);
        // 没有任何在途任务时优雅停止立即返回
        tokio::time::timeout(std::time::Duration::from_secs(1), server.graceful_stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stalled_reader_pauses_reply_stream() {
        use crate::server::cmux::{ConnMux, Matcher, MuxOptions};
        use crate::server::rpc::{DialCredentials, RpcChannel};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        const FLOOD: usize = 200;
        let produced = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        {
            let produced = produced.clone();
            registry
                .register("test.Echo", "Flood", move |_request: RpcRequest| {
                    let produced = produced.clone();
                    async move {
                        let replies = futures_util::stream::iter(0..FLOOD).map(move |_| {
                            produced.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, RpcStatus>(Bytes::from(vec![7u8; 64 * 1024]))
                        });
                        Ok::<_, RpcStatus>(RpcReply::stream(replies))
                    }
                })
                .unwrap();
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut mux = ConnMux::new(listener, MuxOptions::default(), Logger::discard()).unwrap();
        let addr = mux.local_addr();
        let sub = mux.match_with(Matcher::Http2);
        let shutdown = CancellationToken::new();
        tokio::spawn(mux.serve(shutdown.clone()));
        let server = RpcServer::new(registry, RpcServerOptions::default(), Logger::discard());
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve(sub).await });
        }

        let channel = RpcChannel::new(addr, DialCredentials::Insecure, Logger::discard());
        let request: MessageStream = Box::pin(futures_util::stream::once(async {
            Ok::<_, RpcStatus>(Bytes::from_static(b"{}"))
        }));
        let mut replies = channel.call("/test.Echo/Flood", request).await.unwrap();

        // 客户端一条都不读，处理器只能产出窗口容得下的那几条
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stalled = produced.load(Ordering::SeqCst);
        assert!(stalled < FLOOD / 4, "handler produced {} of {} while nobody read", stalled, FLOOD);

        let mut received = 0;
        while let Some(message) = replies.next().await {
            assert_eq!(message.unwrap().len(), 64 * 1024);
            received += 1;
        }
        assert_eq!(received, FLOOD);

        server.stop();
        shutdown.cancel();
    }
}
