//! RPC 客户端通道
//!
//! 网关用它回连本节点。拨号是惰性的：创建时不建立连接，
//! 首次调用时才连接，连接断开后下一次调用会重新拨号。

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::StreamExt;
use h2::client::SendRequest;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Method, Request, StatusCode};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{ServeError, ServeResult};
use crate::utils::logger::Logger;

use super::codec::{MessageDecoder, RPC_CONTENT_TYPE, encode_message};
use super::registry::MessageStream;
use super::server::send_flow_controlled;
use super::status::{Code, RpcStatus};

/// 拨号凭据
#[derive(Clone)]
pub enum DialCredentials {
    Insecure,
    Tls(Arc<ClientConfig>),
}

impl DialCredentials {
    fn scheme(&self) -> &'static str {
        match self {
            DialCredentials::Insecure => "http",
            DialCredentials::Tls(_) => "https",
        }
    }
}

/// 到单个目标地址的 RPC 通道
pub struct RpcChannel {
    target: SocketAddr,
    credentials: DialCredentials,
    sender: Mutex<Option<SendRequest<Bytes>>>,
    closed: AtomicBool,
    /// 通道关闭时结束后台连接任务
    shutdown: CancellationToken,
    max_message_bytes: usize,
    logger: Logger,
}

impl RpcChannel {
    pub fn new(target: SocketAddr, credentials: DialCredentials, logger: Logger) -> Self {
        Self {
            target,
            credentials,
            sender: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            max_message_bytes: 4 * 1024 * 1024,
            logger,
        }
    }

    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 关闭通道；重复关闭返回 `ChannelClosed`
    pub async fn close(&self) -> ServeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ServeError::ChannelClosed);
        }
        self.shutdown.cancel();
        self.sender.lock().await.take();
        self.logger.debug(format!("🔌 RPC 通道已关闭: {}", self.target));
        Ok(())
    }

    async fn ready_sender(&self) -> ServeResult<SendRequest<Bytes>> {
        if self.is_closed() {
            return Err(ServeError::ChannelClosed);
        }
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.as_ref() {
            match sender.clone().ready().await {
                Ok(sender) => return Ok(sender),
                Err(e) => {
                    self.logger.debug(format!("🔄 RPC 连接已失效，重新拨号: {}", e));
                    guard.take();
                }
            }
        }
        let sender = self.dial().await?;
        *guard = Some(sender.clone());
        Ok(sender)
    }

    async fn dial(&self) -> ServeResult<SendRequest<Bytes>> {
        let tcp = TcpStream::connect(self.target)
            .await
            .map_err(|e| ServeError::DialError(format!("{}: {}", self.target, e)))?;
        let _ = tcp.set_nodelay(true);

        match &self.credentials {
            DialCredentials::Insecure => self.handshake(tcp).await,
            DialCredentials::Tls(config) => {
                let connector = tokio_rustls::TlsConnector::from(config.clone());
                let server_name = ServerName::IpAddress(self.target.ip().into());
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ServeError::DialError(format!("TLS {}: {}", self.target, e)))?;
                self.handshake(tls).await
            }
        }
    }

    async fn handshake<IO>(&self, io: IO) -> ServeResult<SendRequest<Bytes>>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = h2::client::handshake(io)
            .await
            .map_err(|e| ServeError::DialError(format!("HTTP/2 {}: {}", self.target, e)))?;

        let shutdown = self.shutdown.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = connection => {
                    if let Err(e) = result {
                        logger.debug(format!("🔌 RPC 客户端连接结束: {}", e));
                    }
                }
            }
        });
        self.logger.debug(format!("✅ RPC 通道已连接: {}", self.target));
        Ok(sender)
    }

    /// 发起流式调用：请求消息来自 `messages`，返回响应消息流。
    /// 最终状态非 OK 时作为流的最后一项错误给出。
    pub async fn call(&self, method: &str, mut messages: MessageStream) -> Result<MessageStream, RpcStatus> {
        let mut sender = self
            .ready_sender()
            .await
            .map_err(|e| RpcStatus::unavailable(e.to_string()))?;

        let uri = format!("{}://{}{}", self.credentials.scheme(), self.target, method);
        let mut request = Request::new(());
        *request.method_mut() = Method::POST;
        *request.uri_mut() = uri
            .parse()
            .map_err(|e| RpcStatus::internal(format!("invalid method path {}: {}", method, e)))?;
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
        request.headers_mut().insert("te", HeaderValue::from_static("trailers"));

        let (response, mut send) = sender
            .send_request(request, false)
            .map_err(|e| RpcStatus::unavailable(e.to_string()))?;

        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                match message {
                    Ok(message) => {
                        if send_flow_controlled(&mut send, encode_message(&message)).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        send.send_reset(h2::Reason::CANCEL);
                        return;
                    }
                }
            }
            let _ = send.send_data(Bytes::new(), true);
        });

        let response = response
            .await
            .map_err(|e| RpcStatus::unavailable(e.to_string()))?;
        let (parts, recv) = response.into_parts();
        if parts.status != StatusCode::OK {
            return Err(RpcStatus::new(
                Code::from_http_status(parts.status),
                format!("unexpected HTTP status {}", parts.status),
            ));
        }
        if let Some(status) = RpcStatus::from_header_map(&parts.headers) {
            // trailers-only 响应
            return if status.is_ok() {
                Ok(Box::pin(futures_util::stream::empty()))
            } else {
                Err(status)
            };
        }

        let max_message_bytes = self.max_message_bytes;
        Ok(Box::pin(async_stream::stream! {
            let mut recv = recv;
            let mut decoder = MessageDecoder::new(max_message_bytes);
            while let Some(chunk) = recv.data().await {
                match chunk {
                    Ok(chunk) => {
                        let _ = recv.flow_control().release_capacity(chunk.len());
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
                    Err(e) => {
                        yield Err(RpcStatus::unavailable(e.to_string()));
                        return;
                    }
                }
            }
            if !decoder.is_empty() {
                yield Err(RpcStatus::internal("stream ended in the middle of a message"));
                return;
            }
            match recv.trailers().await {
                Ok(Some(trailers)) => match RpcStatus::from_header_map(&trailers) {
                    Some(status) if status.is_ok() => {}
                    Some(status) => yield Err(status),
                    None => yield Err(RpcStatus::internal("trailers carry no grpc-status")),
                },
                Ok(None) => yield Err(RpcStatus::internal("server closed the stream without sending trailers")),
                Err(e) => yield Err(RpcStatus::unavailable(e.to_string())),
            }
        }))
    }

    /// 一元调用
    pub async fn unary(&self, method: &str, payload: Bytes) -> Result<Bytes, RpcStatus> {
        let request: MessageStream = Box::pin(futures_util::stream::once(async move { Ok(payload) }));
        let mut replies = self.call(method, request).await?;
        let mut reply = None;
        while let Some(message) = replies.next().await {
            let message = message?;
            if reply.is_none() {
                reply = Some(message);
            }
        }
        reply.ok_or_else(|| RpcStatus::internal(format!("{}: server sent no reply message", method)))
    }
}
