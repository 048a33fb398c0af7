//! 连接多路分发器
//!
//! 在一个监听套接字上接受连接，按注册顺序用协议特征匹配首部字节，
//! 把连接交给对应的子监听器。嗅探时读到的字节会在交付后原样重放。

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorHandler, ServeError, ServeResult};
use crate::utils::logger::Logger;

/// HTTP/2 客户端连接前言
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// HTTP 方法名的最大长度
const MAX_METHOD_LEN: usize = 16;

/// 子监听器的排队深度
const SUB_LISTENER_BACKLOG: usize = 128;

/// 可恢复 accept 错误后的退避
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 单个匹配器对当前已读字节的判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Match,
    NoMatch,
    NeedMore,
}

/// 协议特征匹配器
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// 不读任何字节直接匹配
    Any,
    /// TLS 握手记录头
    Tls,
    /// HTTP/2 连接前言
    Http2,
    /// HTTP/1.x 请求行
    Http1,
    /// 任意固定前缀
    Prefix(Vec<u8>),
}

impl Matcher {
    pub fn matches(&self, buf: &[u8]) -> MatchResult {
        match self {
            Matcher::Any => MatchResult::Match,
            Matcher::Tls => match_tls(buf),
            Matcher::Http2 => match_prefix(HTTP2_PREFACE, buf),
            Matcher::Http1 => match_http1(buf),
            Matcher::Prefix(prefix) => match_prefix(prefix, buf),
        }
    }
}

fn match_prefix(prefix: &[u8], buf: &[u8]) -> MatchResult {
    if buf.len() >= prefix.len() {
        if &buf[..prefix.len()] == prefix {
            MatchResult::Match
        } else {
            MatchResult::NoMatch
        }
    } else if prefix.starts_with(buf) {
        MatchResult::NeedMore
    } else {
        MatchResult::NoMatch
    }
}

fn match_tls(buf: &[u8]) -> MatchResult {
    // record type 0x16 (handshake), 版本主号 0x03，次号 0x00..=0x04
    match buf {
        [] => MatchResult::NeedMore,
        [0x16] | [0x16, 0x03] => MatchResult::NeedMore,
        [0x16, 0x03, minor, ..] if *minor <= 0x04 => MatchResult::Match,
        _ => MatchResult::NoMatch,
    }
}

fn match_http1(buf: &[u8]) -> MatchResult {
    let line_end = buf.iter().position(|&b| b == b'\n');
    let line = match line_end {
        Some(end) => &buf[..end],
        None => buf,
    };
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let method_end = line.iter().position(|&b| b == b' ');
    let method = &line[..method_end.unwrap_or(line.len())];
    if method.len() > MAX_METHOD_LEN || !method.iter().all(|b| b.is_ascii_uppercase()) {
        return MatchResult::NoMatch;
    }
    if line_end.is_none() {
        return MatchResult::NeedMore;
    }

    let mut parts = line.split(|&b| b == b' ');
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if method.is_empty() || target.is_empty() || parts.next().is_some() {
        return MatchResult::NoMatch;
    }
    if version.len() == 8 && version.starts_with(b"HTTP/1.") && version[7].is_ascii_digit() {
        MatchResult::Match
    } else {
        MatchResult::NoMatch
    }
}

/// 预读字节重放流
///
/// 先吐出嗅探阶段读到的字节，再透传到底层流；写方向直接透传。
pub struct ReplayStream<S> {
    inner: S,
    prefix: BytesMut,
}

impl<S> ReplayStream<S> {
    pub fn new(inner: S, prefix: BytesMut) -> Self {
        Self { inner, prefix }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let to_copy = std::cmp::min(self.prefix.len(), buf.remaining());
            buf.put_slice(&self.prefix[..to_copy]);
            self.prefix.advance(to_copy);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// 分发给子监听器的连接
pub struct MuxConn {
    pub stream: ReplayStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// 只接收匹配连接的虚拟监听器
pub struct SubListener {
    matcher: Matcher,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<MuxConn>,
}

impl SubListener {
    /// 等待下一个匹配的连接；分发器退出后返回 `ListenerClosed`
    pub async fn accept(&mut self) -> ServeResult<MuxConn> {
        self.rx.recv().await.ok_or(ServeError::ListenerClosed)
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// 分发器参数
#[derive(Debug, Clone)]
pub struct MuxOptions {
    pub sniff_timeout: Duration,
    pub max_sniff_bytes: usize,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            sniff_timeout: Duration::from_secs(1),
            max_sniff_bytes: 4096,
        }
    }
}

struct Route {
    matcher: Matcher,
    tx: mpsc::Sender<MuxConn>,
}

/// 连接多路分发器
pub struct ConnMux {
    listener: TcpListener,
    local_addr: SocketAddr,
    routes: Vec<Route>,
    options: MuxOptions,
    logger: Logger,
    on_error: Option<ErrorHandler>,
}

impl ConnMux {
    pub fn new(listener: TcpListener, options: MuxOptions, logger: Logger) -> ServeResult<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            routes: Vec::new(),
            options,
            logger,
            on_error: None,
        })
    }

    /// 设置非致命错误（无法识别、嗅探超时、可恢复 accept 错误）的上报回调
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.on_error = Some(handler);
    }

    /// 注册匹配器并返回对应的子监听器；先注册者优先
    pub fn match_with(&mut self, matcher: Matcher) -> SubListener {
        let (tx, rx) = mpsc::channel(SUB_LISTENER_BACKLOG);
        self.routes.push(Route { matcher: matcher.clone(), tx });
        SubListener {
            matcher,
            local_addr: self.local_addr,
            rx,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 运行 accept 循环，直到 `shutdown` 被取消（返回 `Ok`）或出现不可恢复的错误。
    /// 返回时所有子监听器随之关闭。
    pub async fn serve(self, shutdown: CancellationToken) -> ServeResult<()> {
        let routes: Arc<Vec<Route>> = Arc::new(self.routes);
        self.logger.info(format!("🚀 连接分发器开始监听: {}", self.local_addr));

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.logger.info(format!("🛑 连接分发器停止: {}", self.local_addr));
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let routes = routes.clone();
                    let options = self.options.clone();
                    let logger = self.logger.clone();
                    let on_error = self.on_error.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let dispatched = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            dispatched = dispatch(stream, remote_addr, &routes, &options) => dispatched,
                        };
                        match dispatched {
                            Ok(()) => {}
                            Err(err) => {
                                logger.debug(format!("🔌 丢弃连接 {}: {}", remote_addr, err));
                                if let Some(on_error) = on_error {
                                    on_error(err);
                                }
                            }
                        }
                    });
                }
                Err(err) if ServeError::is_transient_accept(&err) => {
                    self.logger.warn(format!("⚠️ accept 暂时失败，稍后重试: {}", err));
                    if let Some(on_error) = &self.on_error {
                        on_error(ServeError::IoError(err));
                    }
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(err) => {
                    self.logger.error(format!("❌ accept 失败，连接分发器退出: {}", err));
                    return Err(err.into());
                }
            }
        }
    }
}

/// 嗅探并投递单个连接
async fn dispatch(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    routes: &[Route],
    options: &MuxOptions,
) -> ServeResult<()> {
    let deadline = tokio::time::Instant::now() + options.sniff_timeout;
    let mut buf = BytesMut::with_capacity(256);

    let index = loop {
        match select_route(routes, &buf) {
            Selection::Route(index) => break index,
            Selection::Unmatched => return Err(ServeError::Unmatched(remote_addr)),
            Selection::NeedMore if buf.len() >= options.max_sniff_bytes => {
                return Err(ServeError::Unmatched(remote_addr));
            }
            Selection::NeedMore => {}
        }

        buf.reserve(256);
        let read = tokio::time::timeout_at(deadline, stream.read_buf(&mut buf))
            .await
            .map_err(|_| ServeError::SniffTimeout(remote_addr))??;
        if read == 0 {
            return Err(ServeError::Unmatched(remote_addr));
        }
    };

    let conn = MuxConn {
        stream: ReplayStream::new(stream, buf),
        remote_addr,
    };
    // 子监听器已被丢弃（服务器已停止）时连接随之关闭
    let _ = routes[index].tx.send(conn).await;
    Ok(())
}

enum Selection {
    Route(usize),
    NeedMore,
    Unmatched,
}

/// 按注册顺序判定；靠前的匹配器还需要更多字节时不会越过它
fn select_route(routes: &[Route], buf: &[u8]) -> Selection {
    for (index, route) in routes.iter().enumerate() {
        match route.matcher.matches(buf) {
            MatchResult::Match => return Selection::Route(index),
            MatchResult::NeedMore => return Selection::NeedMore,
            MatchResult::NoMatch => {}
        }
    }
    Selection::Unmatched
}
