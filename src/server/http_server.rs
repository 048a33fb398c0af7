//! HTTP 服务器
//!
//! 基于 hyper-util 的 auto builder（HTTP/1.1 + HTTP/2，支持协议升级），
//! 绑定到一个子监听器；TLS 模式下握手在连接任务里完成。
//! 单个连接上的错误只写入静默日志，不外泄用户错误。

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{ServeError, ServeResult};
use crate::server::body;
use crate::server::cmux::SubListener;
use crate::server::router::SharedHandler;
use crate::server::tls::TlsListener;
use crate::utils::logger::Logger;

struct Inner {
    handler: SharedHandler,
    logger: Logger,
    /// 单连接错误用的静默日志
    conn_logger: Logger,
    quit: CancellationToken,
    drain: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
}

/// HTTP 服务器句柄，克隆共享同一实例
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

impl HttpServer {
    pub fn new(handler: SharedHandler, logger: Logger) -> Self {
        let conn_logger = logger.muted();
        Self {
            inner: Arc::new(Inner {
                handler,
                logger,
                conn_logger,
                quit: CancellationToken::new(),
                drain: CancellationToken::new(),
                force: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.quit.is_cancelled()
    }

    /// 明文服务，直到停止（`Ok`）或子监听器关闭（`ListenerClosed`）
    pub async fn serve(&self, mut listener: SubListener) -> ServeResult<()> {
        if self.is_stopped() {
            return Err(ServeError::ServerStopped);
        }
        let inner = &self.inner;
        inner.logger.info(format!("🌐 HTTP 服务器开始服务: {}", listener.local_addr()));
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

    /// TLS 服务
    pub async fn serve_tls(&self, mut listener: TlsListener) -> ServeResult<()> {
        if self.is_stopped() {
            return Err(ServeError::ServerStopped);
        }
        let inner = &self.inner;
        inner.logger.info(format!("🔐 HTTPS 服务器开始服务: {}", listener.local_addr()));
        loop {
            let pending = tokio::select! {
                _ = inner.quit.cancelled() => return Ok(()),
                pending = listener.accept() => pending,
            };
            let pending = pending?;
            let server = self.clone();
            inner.tracker.spawn(async move {
                let remote_addr = pending.remote_addr();
                let handshake = tokio::select! {
                    _ = server.inner.force.cancelled() => return,
                    handshake = pending.handshake() => handshake,
                };
                match handshake {
                    Ok(stream) => server.serve_connection(stream, remote_addr).await,
                    Err(e) => server.inner.conn_logger.debug(format!("❌ TLS 握手失败: {}", e)),
                }
            });
        }
    }

    async fn serve_connection<IO>(&self, io: IO, remote_addr: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = &self.inner;
        let handler = inner.handler.clone();
        let service = hyper::service::service_fn(move |request: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.call(request.map(body::boxed)).await) }
        });

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder.http2().enable_connect_protocol();
        let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
        tokio::pin!(conn);

        let mut draining = false;
        loop {
            tokio::select! {
                _ = inner.force.cancelled() => {
                    inner.conn_logger.debug(format!("🛑 强制关闭 HTTP 连接: {}", remote_addr));
                    return;
                }
                _ = inner.drain.cancelled(), if !draining => {
                    conn.as_mut().graceful_shutdown();
                    draining = true;
                }
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        let message = e.to_string();
                        if ServeError::is_benign_disconnect(&message) {
                            inner.conn_logger.debug(format!("🔌 客户端断开连接: {} ({})", remote_addr, message));
                        } else {
                            inner.conn_logger.warn(format!("⚠️ HTTP 连接处理失败: {} ({})", remote_addr, message));
                        }
                    }
                    return;
                }
            }
        }
    }

    /// 停止接收新连接并等待在途请求，最多等 `timeout`；超时后强制关闭剩余连接并返回 `DrainTimeout`
    pub async fn shutdown(&self, timeout: Duration) -> ServeResult<()> {
        let inner = &self.inner;
        inner.quit.cancel();
        inner.drain.cancel();
        inner.tracker.close();
        match tokio::time::timeout(timeout, inner.tracker.wait()).await {
            Ok(()) => {
                inner.logger.info("✅ HTTP 服务器已优雅关闭");
                Ok(())
            }
            Err(_) => {
                inner.force.cancel();
                inner.tracker.wait().await;
                inner.logger.warn(format!("⏰ HTTP 服务器 {:?} 内未能排空，已强制关闭", timeout));
                Err(ServeError::DrainTimeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::body::text_response;
    use crate::server::cmux::{ConnMux, Matcher, MuxOptions};
    use crate::server::router::handler_fn;
    use hyper::StatusCode;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Notify;

    async fn start(handler: SharedHandler) -> (HttpServer, SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut mux = ConnMux::new(listener, MuxOptions::default(), Logger::discard()).unwrap();
        let addr = mux.local_addr();
        let sub = mux.match_with(Matcher::Http1);
        let shutdown = CancellationToken::new();
        tokio::spawn(mux.serve(shutdown.clone()));
        let server = HttpServer::new(handler, Logger::discard());
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(sub).await });
        (server, addr, shutdown)
    }

    async fn raw_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        // 被强制关闭的连接可能以 reset 结束
        let _ = stream.read_to_string(&mut response).await;
        response
    }

    #[tokio::test]
    async fn serves_and_shuts_down_quickly_when_idle() {
        let handler = handler_fn(|request: Request<body::Body>| async move {
            text_response(StatusCode::OK, format!("hello {}", request.uri().path()))
        });
        let (server, addr, mux_shutdown) = start(handler).await;

        let response = raw_get(addr, "/world").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello /world"));

        let started = Instant::now();
        server.shutdown(Duration::from_secs(2)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(server.is_stopped());
        mux_shutdown.cancel();
    }

    #[tokio::test]
    async fn drain_timeout_forces_close() {
        let entered = Arc::new(Notify::new());
        let signal = entered.clone();
        let handler = handler_fn(move |_request| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                tokio::time::sleep(Duration::from_secs(30)).await;
                text_response(StatusCode::OK, "late")
            }
        });
        let (server, addr, mux_shutdown) = start(handler).await;

        let client = tokio::spawn(async move { raw_get(addr, "/slow").await });
        entered.notified().await;

        let started = Instant::now();
        let result = server.shutdown(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ServeError::DrainTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));

        // 连接被强制关闭，客户端读到 EOF
        let response = tokio::time::timeout(Duration::from_secs(5), client).await.unwrap().unwrap();
        assert!(!response.contains("late"));
        mux_shutdown.cancel();
    }

    #[tokio::test]
    async fn serve_after_shutdown_is_refused() {
        let server = HttpServer::new(handler_fn(|_| async { text_response(StatusCode::OK, "") }), Logger::discard());
        server.shutdown(Duration::from_millis(10)).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut mux = ConnMux::new(listener, MuxOptions::default(), Logger::discard()).unwrap();
        let sub = mux.match_with(Matcher::Any);
        assert!(matches!(server.serve(sub).await, Err(ServeError::ServerStopped)));
    }
}
