//! 服务上下文
//!
//! 一个 [`ServeCtx`] 对应一个监听套接字。`serve` 等待节点就绪后：
//!
//! 1. 在监听器上建立连接分发器；
//! 2. 明文模式：HTTP/2 前导 -> RPC 引擎，HTTP/1 -> REST（网关 + 用户处理器）；
//! 3. TLS 模式：所有连接先做 TLS 终结，再由协议路由在 RPC 与 REST 之间分流；
//! 4. 服务器句柄放进一次性槽里，`teardown` 时取出关闭。
//!
//! 注册类操作都需要 `&mut self`，上下文开始服务后不能再改动处理器表。

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{ServeConfig, ServeOptions};
use crate::error::{ErrorHandler, ServeError, ServeResult};
use crate::server::cmux::{ConnMux, Matcher, MuxOptions};
use crate::server::debug::{EVENTS_PATH, REQUESTS_PATH, TraceRecorder, TracingHandler, pprof_handlers};
use crate::server::gateway::{JsonPassthrough, Marshaler, register_gateway};
use crate::server::handle_slot::{HandleSlot, SlotState};
use crate::server::http_server::HttpServer;
use crate::server::node::{Node, ServiceRegister};
use crate::server::router::{SharedHandler, create_mux, grpc_handler_func, wrap_mux};
use crate::server::rpc::{DialCredentials, RpcServer, ServiceRegistry};
use crate::server::shutdown::{StopOutcome, stop_insecure_server, stop_secure_server};
use crate::server::tls::{TlsProvider, loopback_client_config};
use crate::utils::logger::Logger;

/// 服务上下文
pub struct ServeCtx {
    listener: Mutex<Option<TcpListener>>,
    addr: SocketAddr,
    secure: bool,
    insecure: bool,
    options: ServeOptions,
    lifecycle: CancellationToken,
    user_handlers: BTreeMap<String, SharedHandler>,
    service_register: Option<ServiceRegister>,
    marshaler: Arc<dyn Marshaler>,
    trace: Option<TraceRecorder>,

    secure_rpc: HandleSlot<RpcServer>,
    insecure_rpc: HandleSlot<RpcServer>,
    secure_http: HandleSlot<HttpServer>,
    insecure_http: HandleSlot<HttpServer>,

    err_handler: OnceLock<ErrorHandler>,
    torn_down: AtomicBool,
    logger: Logger,
}

impl ServeCtx {
    pub fn new(
        listener: TcpListener,
        secure: bool,
        insecure: bool,
        options: ServeOptions,
        logger: Logger,
    ) -> ServeResult<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            addr,
            secure,
            insecure,
            options,
            lifecycle: CancellationToken::new(),
            user_handlers: BTreeMap::new(),
            service_register: None,
            marshaler: Arc::new(JsonPassthrough::default()),
            trace: None,
            secure_rpc: HandleSlot::new(),
            insecure_rpc: HandleSlot::new(),
            secure_http: HandleSlot::new(),
            insecure_http: HandleSlot::new(),
            err_handler: OnceLock::new(),
            torn_down: AtomicBool::new(false),
            logger,
        })
    }

    /// 按配置绑定监听地址，并按开关注册调试端点
    pub async fn bind(config: &ServeConfig, logger: Logger) -> ServeResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr).await?;
        let mut ctx = Self::new(
            listener,
            config.secure,
            config.insecure,
            config.serve_options(),
            logger,
        )?;
        if config.enable_pprof {
            ctx.register_pprof();
        }
        if config.enable_trace {
            ctx.register_trace();
        }
        Ok(ctx)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// 生命周期令牌；teardown 结束时取消
    pub fn lifecycle(&self) -> CancellationToken {
        self.lifecycle.clone()
    }

    pub fn user_handler_paths(&self) -> impl Iterator<Item = &str> {
        self.user_handlers.keys().map(String::as_str)
    }

    pub fn trace_recorder(&self) -> Option<&TraceRecorder> {
        self.trace.as_ref()
    }

    /// 注册辅助处理器；路径已被占用时给出警告并保留原处理器
    pub fn register_user_handler(&mut self, path: impl Into<String>, handler: SharedHandler) -> bool {
        let path = path.into();
        if self.user_handlers.contains_key(&path) {
            self.logger
                .warn(format!("⚠️ 路径 {} 已被用户处理器注册，忽略重复注册", path));
            return false;
        }
        self.user_handlers.insert(path, handler);
        true
    }

    pub fn register_pprof(&mut self) {
        for (path, handler) in pprof_handlers() {
            self.register_user_handler(path, handler);
        }
    }

    pub fn register_trace(&mut self) {
        let recorder = self
            .trace
            .get_or_insert_with(|| TraceRecorder::new(self.options.trace_capacity))
            .clone();
        self.register_user_handler(REQUESTS_PATH, recorder.requests_handler());
        self.register_user_handler(EVENTS_PATH, recorder.events_handler());
    }

    pub fn set_service_register(&mut self, register: ServiceRegister) {
        self.service_register = Some(register);
    }

    /// 替换网关的 JSON 编解码
    pub fn set_marshaler(&mut self, marshaler: Arc<dyn Marshaler>) {
        self.marshaler = marshaler;
    }

    fn record_event(&self, message: impl Into<String>) {
        if let Some(trace) = &self.trace {
            trace.record_event("serve", message);
        }
    }

    /// 运行期错误上报：生命周期结束后只记调试日志
    fn reporter(&self) -> ErrorHandler {
        let lifecycle = self.lifecycle.clone();
        let logger = self.logger.clone();
        let handler = self.err_handler.get().cloned();
        Arc::new(move |err: ServeError| {
            if lifecycle.is_cancelled() {
                logger.debug(format!("🔕 关闭后出现的错误: {}", err));
                return;
            }
            match &handler {
                Some(handler) => handler(err),
                None => logger.error(format!("❌ {}", err)),
            }
        })
    }

    fn seal_slots(&self) {
        self.secure_rpc.seal();
        self.insecure_rpc.seal();
        self.secure_http.seal();
        self.insecure_http.seal();
    }

    /// 开始服务，阻塞到生命周期结束（`Ok`）或分发器出现致命错误。
    /// 建立阶段的错误（TLS 配置、服务注册、网关注册）直接返回。
    pub async fn serve(
        &self,
        node: Arc<dyn Node>,
        tls: Option<Arc<dyn TlsProvider>>,
        handler: Option<SharedHandler>,
        err_handler: ErrorHandler,
    ) -> ServeResult<()> {
        let _ = self.err_handler.set(err_handler);

        tokio::select! {
            _ = self.lifecycle.cancelled() => {
                self.seal_slots();
                return Ok(());
            }
            _ = node.ready() => {}
        }
        self.logger.info("✅ 节点已就绪，开始对外服务");

        let mux = match self.setup(node.as_ref(), tls, handler) {
            Ok(mux) => mux,
            Err(e) => {
                self.seal_slots();
                self.logger.error(format!("❌ 服务建立失败: {}", e));
                return Err(e);
            }
        };
        self.seal_slots();
        self.record_event(format!("serving on {}", self.addr));

        mux.serve(self.lifecycle.clone()).await
    }

    fn setup(
        &self,
        node: &dyn Node,
        tls: Option<Arc<dyn TlsProvider>>,
        handler: Option<SharedHandler>,
    ) -> ServeResult<ConnMux> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| ServeError::ConfigError("serve called more than once".to_string()))?;

        let report = self.reporter();
        let mut mux = ConnMux::new(
            listener,
            MuxOptions {
                sniff_timeout: self.options.sniff_timeout,
                max_sniff_bytes: self.options.max_sniff_bytes,
            },
            self.logger.scoped("cmux"),
        )?;
        mux.set_error_handler(report.clone());

        let mut registry = ServiceRegistry::new();
        node.register_services(&mut registry)?;
        if let Some(register) = &self.service_register {
            register(&mut registry)?;
        }

        if self.insecure {
            self.setup_insecure(&mut mux, &registry, handler.clone(), &report)?;
        }
        if self.secure {
            let tls = tls.ok_or_else(|| {
                ServeError::ConfigError("secure serving requires a TLS provider".to_string())
            })?;
            self.setup_secure(&mut mux, &registry, tls, handler, &report)?;
        }
        Ok(mux)
    }

    fn setup_insecure(
        &self,
        mux: &mut ConnMux,
        registry: &ServiceRegistry,
        handler: Option<SharedHandler>,
        report: &ErrorHandler,
    ) -> ServeResult<()> {
        let rpc = RpcServer::new(
            registry.clone(),
            self.options.rpc.clone(),
            self.logger.scoped("rpc-insecure"),
        );
        deliver(&self.insecure_rpc, rpc.clone())?;
        let grpcl = mux.match_with(Matcher::Http2);
        spawn_serving(report.clone(), async move { rpc.serve(grpcl).await });

        let gateway = register_gateway(
            dial_addr(self.addr),
            DialCredentials::Insecure,
            self.lifecycle.clone(),
            self.marshaler.clone(),
            self.logger.scoped("gateway"),
        )?;
        let root = self.root_handler(Some(Arc::new(gateway)), handler)?;

        let http = HttpServer::new(root, self.logger.scoped("http"));
        deliver(&self.insecure_http, http.clone())?;
        let httpl = mux.match_with(Matcher::Http1);
        spawn_serving(report.clone(), async move { http.serve(httpl).await });

        self.logger.warn(format!(
            "⚠️ 正在 {} 上提供明文客户端服务，强烈不建议这样做！",
            self.addr
        ));
        self.record_event("insecure mode started");
        Ok(())
    }

    fn setup_secure(
        &self,
        mux: &mut ConnMux,
        registry: &ServiceRegistry,
        tls: Arc<dyn TlsProvider>,
        handler: Option<SharedHandler>,
        report: &ErrorHandler,
    ) -> ServeResult<()> {
        let config = tls.server_config()?;
        let rpc = RpcServer::new(
            registry.clone(),
            self.options.rpc.clone(),
            self.logger.scoped("rpc-secure"),
        );
        deliver(&self.secure_rpc, rpc.clone())?;
        let fallback: SharedHandler = Arc::new(grpc_handler_func(Arc::new(rpc), handler));

        // 回连本进程，信任是隐含的
        let gateway = register_gateway(
            dial_addr(self.addr),
            DialCredentials::Tls(loopback_client_config()),
            self.lifecycle.clone(),
            self.marshaler.clone(),
            self.logger.scoped("gateway"),
        )?;
        let tlsl = tls.tls_listener(mux.match_with(Matcher::Any), config);
        let root = self.root_handler(Some(Arc::new(gateway)), Some(fallback))?;

        let http = HttpServer::new(root, self.logger.scoped("https"));
        deliver(&self.secure_http, http.clone())?;
        spawn_serving(report.clone(), async move { http.serve_tls(tlsl).await });

        self.logger.info(format!("🔐 正在 {} 上提供 TLS 客户端服务", self.addr));
        self.record_event("secure mode started");
        Ok(())
    }

    fn root_handler(
        &self,
        gateway: Option<SharedHandler>,
        fallback: Option<SharedHandler>,
    ) -> ServeResult<SharedHandler> {
        let mux = create_mux(&self.user_handlers, gateway, fallback, &self.logger)?;
        let root = wrap_mux(mux);
        Ok(match &self.trace {
            Some(trace) => Arc::new(TracingHandler::new(root, trace.clone())),
            None => root,
        })
    }

    /// 关闭所有已启动的服务器，然后取消生命周期。
    /// 可重复调用；对未完成建立的上下文同样安全。
    pub async fn teardown(&self, timeout: Duration) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.seal_slots();
        let report = self.reporter();
        self.logger.info(format!("🛑 开始关闭服务，超时 {:?}", timeout));

        if self.secure {
            if let SlotState::Delivered(rpc) = self.secure_rpc.state() {
                let http = self.secure_http.get();
                if let Err(e) = stop_secure_server(rpc, http, timeout, &self.logger).await {
                    report(e);
                }
            }
        }

        if self.insecure {
            if let SlotState::Delivered(rpc) = self.insecure_rpc.state() {
                let drain_http = async {
                    match self.insecure_http.get() {
                        Some(http) => http.shutdown(timeout).await,
                        None => Ok(()),
                    }
                };
                let (outcome, drained) =
                    tokio::join!(stop_insecure_server(rpc, timeout, &self.logger), drain_http);
                if outcome == StopOutcome::Forced {
                    self.record_event("insecure rpc server force stopped");
                }
                if let Err(e) = drained {
                    report(e);
                }
            }
        }

        self.lifecycle.cancel();
        self.record_event("teardown complete");
        self.logger.info("✅ 服务已关闭");
    }
}

/// 投递失败说明 teardown 已经开始
fn deliver<T>(slot: &HandleSlot<T>, value: T) -> ServeResult<()> {
    slot.deliver(value).map_err(|_| ServeError::ServerStopped)
}

fn spawn_serving<F>(report: ErrorHandler, serving: F)
where
    F: std::future::Future<Output = ServeResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = serving.await {
            report(e);
        }
    });
}

/// 监听在通配地址时回连本机回环地址
fn dial_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::body::{self, text_response};
    use crate::server::router::handler_fn;
    use crate::utils::logger::Level;
    use hyper::StatusCode;

    async fn ctx(logger: Logger) -> ServeCtx {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ServeCtx::new(listener, false, true, ServeOptions::default(), logger).unwrap()
    }

    fn tagged(tag: &'static str) -> SharedHandler {
        handler_fn(move |_request| async move { text_response(StatusCode::OK, tag) })
    }

    #[test]
    fn wildcard_addresses_dial_loopback() {
        assert_eq!(dial_addr("0.0.0.0:2379".parse().unwrap()), "127.0.0.1:2379".parse().unwrap());
        assert_eq!(dial_addr("[::]:2379".parse().unwrap()), "[::1]:2379".parse().unwrap());
        assert_eq!(dial_addr("10.0.0.7:2379".parse().unwrap()), "10.0.0.7:2379".parse().unwrap());
    }

    #[tokio::test]
    async fn duplicate_user_handler_keeps_first() {
        let (logger, logs) = Logger::capturing("serve");
        let mut ctx = ctx(logger).await;
        assert!(ctx.register_user_handler("/health", tagged("first")));
        assert!(!ctx.register_user_handler("/health", tagged("second")));

        let handler = ctx.user_handlers.get("/health").unwrap().clone();
        let response = handler
            .call(hyper::Request::builder().uri("/health").body(body::empty()).unwrap())
            .await;
        let text = body::collect_bytes(response.into_body()).await.unwrap();
        assert_eq!(&text[..], b"first");
        assert!(logs.lock().unwrap().iter().any(|(level, line)| *level == Level::Warn && line.contains("/health")));
    }

    #[tokio::test]
    async fn debug_endpoints_register_at_conventional_paths() {
        let mut ctx = ctx(Logger::discard()).await;
        ctx.register_pprof();
        ctx.register_trace();
        ctx.register_trace();
        let paths: Vec<&str> = ctx.user_handler_paths().collect();
        assert_eq!(
            paths,
            vec![
                "/debug/events",
                "/debug/pprof/",
                "/debug/pprof/cmdline",
                "/debug/pprof/system",
                "/debug/requests",
            ]
        );
        assert!(ctx.trace_recorder().is_some());
    }

    #[tokio::test]
    async fn teardown_before_serve_is_safe_and_idempotent() {
        let ctx = ctx(Logger::discard()).await;
        let lifecycle = ctx.lifecycle();
        ctx.teardown(Duration::from_millis(100)).await;
        assert!(lifecycle.is_cancelled());
        assert!(matches!(ctx.insecure_rpc.state(), SlotState::NeverStarted));
        ctx.teardown(Duration::from_millis(100)).await;
    }
}
