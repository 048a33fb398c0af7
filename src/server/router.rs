//! 协议路由与 HTTP 多路复用
//!
//! - [`ProtocolRouter`]：有序的 (谓词, 处理器) 列表，第一个命中者处理请求
//! - [`ServeMux`]：按路径模式分发，语义与常见的前缀式 mux 一致（最长匹配、子树重定向）
//! - [`LegacyPathRewriter`]：把 `/v3alpha/` 前缀改写为 `/v3beta/`

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hyper::header::{CONTENT_TYPE, HeaderValue, LOCATION};
use hyper::http::uri::{PathAndQuery, Uri};
use hyper::{Request, Response, StatusCode, Version};

use crate::error::{ServeError, ServeResult};
use crate::server::body::{self, Body};
use crate::server::rpc::{RPC_CONTENT_TYPE, RpcServer};
use crate::server::wsproxy::{WebsocketProxy, force_post};
use crate::utils::logger::Logger;

/// 旧版 REST 前缀
pub const LEGACY_PREFIX: &str = "/v3alpha/";
/// 当前 REST 前缀
pub const STABLE_PREFIX: &str = "/v3beta/";

/// 处理器返回的 future
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<Body>> + Send>>;

/// HTTP 处理器
pub trait HttpHandler: Send + Sync {
    fn call(&self, request: Request<Body>) -> HandlerFuture;
}

/// 共享处理器
pub type SharedHandler = Arc<dyn HttpHandler>;

struct FnHandler<F>(F);

impl<F, Fut> HttpHandler for FnHandler<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    fn call(&self, request: Request<Body>) -> HandlerFuture {
        Box::pin((self.0)(request))
    }
}

/// 用闭包构造处理器
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

impl HttpHandler for RpcServer {
    fn call(&self, request: Request<Body>) -> HandlerFuture {
        let server = self.clone();
        Box::pin(async move { server.serve_http(request).await })
    }
}

/// 请求是否属于 RPC 引擎：HTTP/2 且 content-type 含 `application/grpc`
pub fn is_rpc_request<B>(request: &Request<B>) -> bool {
    request.version() == Version::HTTP_2
        && request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains(RPC_CONTENT_TYPE))
            .unwrap_or(false)
}

/// 路由谓词
pub type RoutePredicate = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// 有序协议路由
#[derive(Clone, Default)]
pub struct ProtocolRouter {
    routes: Vec<(RoutePredicate, SharedHandler)>,
}

impl ProtocolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<P>(mut self, predicate: P, handler: SharedHandler) -> Self
    where
        P: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.routes.push((Arc::new(predicate), handler));
        self
    }

    /// 兜底路由，谓词恒真
    pub fn fallback(self, handler: SharedHandler) -> Self {
        self.route(|_| true, handler)
    }

    pub fn select(&self, request: &Request<Body>) -> Option<&SharedHandler> {
        self.routes
            .iter()
            .find(|(predicate, _)| predicate(request))
            .map(|(_, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl HttpHandler for ProtocolRouter {
    fn call(&self, request: Request<Body>) -> HandlerFuture {
        match self.select(&request) {
            Some(handler) => handler.call(request),
            None => Box::pin(async { body::text_response(StatusCode::NOT_FOUND, "404 page not found\n") }),
        }
    }
}

/// RPC 请求交给 RPC 引擎，其余交给 `other`；没有 `other` 时全部交给 RPC 引擎
pub fn grpc_handler_func(rpc: SharedHandler, other: Option<SharedHandler>) -> ProtocolRouter {
    match other {
        Some(other) => ProtocolRouter::new()
            .route(is_rpc_request, rpc)
            .fallback(other),
        None => ProtocolRouter::new().fallback(rpc),
    }
}

/// 把以 `/v3alpha/` 开头的路径改写为 `/v3beta/`（只替换一次，保留查询串）
pub fn rewrite_legacy_path<B>(request: &mut Request<B>) {
    let path = request.uri().path();
    let Some(rest) = path.strip_prefix(LEGACY_PREFIX) else {
        return;
    };
    let rewritten = match request.uri().query() {
        Some(query) => format!("{}{}?{}", STABLE_PREFIX, rest, query),
        None => format!("{}{}", STABLE_PREFIX, rest),
    };
    let Ok(path_and_query) = PathAndQuery::try_from(rewritten) else {
        return;
    };
    let mut parts = request.uri().clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    if let Ok(uri) = Uri::from_parts(parts) {
        *request.uri_mut() = uri;
    }
}

/// 旧路径改写包装
pub struct LegacyPathRewriter {
    inner: SharedHandler,
}

impl LegacyPathRewriter {
    pub fn new(inner: SharedHandler) -> Self {
        Self { inner }
    }
}

impl HttpHandler for LegacyPathRewriter {
    fn call(&self, mut request: Request<Body>) -> HandlerFuture {
        rewrite_legacy_path(&mut request);
        self.inner.call(request)
    }
}

/// 包装 mux，使其先改写旧路径
pub fn wrap_mux(mux: ServeMux) -> SharedHandler {
    Arc::new(LegacyPathRewriter::new(Arc::new(mux)))
}

/// 路径模式 mux
///
/// 不以 `/` 结尾的模式精确匹配；以 `/` 结尾的模式匹配整棵子树，最长者优先。
/// 请求 `/a` 而只注册了 `/a/` 时返回 301 重定向。
#[derive(Clone, Default)]
pub struct ServeMux {
    patterns: BTreeMap<String, SharedHandler>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, pattern: &str, handler: SharedHandler) -> ServeResult<()> {
        if !pattern.starts_with('/') {
            return Err(ServeError::RegistrationError(format!(
                "invalid pattern {:?}: must start with '/'",
                pattern
            )));
        }
        if self.patterns.contains_key(pattern) {
            return Err(ServeError::RegistrationError(format!(
                "multiple registrations for {}",
                pattern
            )));
        }
        self.patterns.insert(pattern.to_string(), handler);
        Ok(())
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.keys().map(String::as_str)
    }

    /// 找到处理该路径的模式
    pub fn lookup(&self, path: &str) -> Option<(&str, &SharedHandler)> {
        if let Some((pattern, handler)) = self.patterns.get_key_value(path) {
            return Some((pattern.as_str(), handler));
        }
        self.patterns
            .iter()
            .filter(|(pattern, _)| pattern.ends_with('/') && path.starts_with(pattern.as_str()))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(pattern, handler)| (pattern.as_str(), handler))
    }

    fn redirect_target(&self, path: &str) -> Option<String> {
        if path.ends_with('/') || self.patterns.contains_key(path) {
            return None;
        }
        let with_slash = format!("{}/", path);
        if !self.patterns.contains_key(&with_slash) {
            return None;
        }
        // 已有更长的模式能处理原路径时不重定向
        match self.lookup(path) {
            Some((pattern, _)) if pattern.len() > with_slash.len() => None,
            _ => Some(with_slash),
        }
    }
}

impl HttpHandler for ServeMux {
    fn call(&self, request: Request<Body>) -> HandlerFuture {
        let path = request.uri().path().to_string();
        if let Some(target) = self.redirect_target(&path) {
            let location = match request.uri().query() {
                Some(query) => format!("{}?{}", target, query),
                None => target,
            };
            return Box::pin(async move {
                let mut response = body::text_response(StatusCode::MOVED_PERMANENTLY, "Moved Permanently\n");
                if let Ok(value) = HeaderValue::from_str(&location) {
                    response.headers_mut().insert(LOCATION, value);
                }
                response
            });
        }
        match self.lookup(&path) {
            Some((_, handler)) => handler.call(request),
            None => Box::pin(async { body::text_response(StatusCode::NOT_FOUND, "404 page not found\n") }),
        }
    }
}

/// 组装 HTTP mux：用户处理器、`/v3beta/` 网关（经 WebSocket 桥接，方法改写为 POST）、`/` 兜底
pub fn create_mux(
    user_handlers: &BTreeMap<String, SharedHandler>,
    gateway: Option<SharedHandler>,
    fallback: Option<SharedHandler>,
    logger: &Logger,
) -> ServeResult<ServeMux> {
    let mut mux = ServeMux::new();
    for (path, handler) in user_handlers {
        mux.handle(path, handler.clone())?;
    }
    if let Some(gateway) = gateway {
        let proxy = WebsocketProxy::new(gateway, logger.scoped("wsproxy")).with_request_mutator(force_post());
        mux.handle(STABLE_PREFIX, Arc::new(proxy))?;
    }
    if let Some(fallback) = fallback {
        mux.handle("/", fallback)?;
    }
    Ok(mux)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::body::collect_bytes;

    fn tagged(tag: &'static str) -> SharedHandler {
        handler_fn(move |_request| async move { body::text_response(StatusCode::OK, tag) })
    }

    fn request(path: &str) -> Request<Body> {
        let mut request = Request::new(body::empty());
        *request.uri_mut() = path.parse().unwrap();
        request
    }

    async fn text(response: Response<Body>) -> String {
        let bytes = collect_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn rewrites_legacy_prefix_once() {
        let mut req = request("/v3alpha/kv/range?serializable=true");
        rewrite_legacy_path(&mut req);
        assert_eq!(req.uri().path(), "/v3beta/kv/range");
        assert_eq!(req.uri().query(), Some("serializable=true"));

        // 幂等
        rewrite_legacy_path(&mut req);
        assert_eq!(req.uri().path(), "/v3beta/kv/range");

        let mut nested = request("/v3alpha/v3alpha/x");
        rewrite_legacy_path(&mut nested);
        assert_eq!(nested.uri().path(), "/v3beta/v3alpha/x");

        let mut other = request("/metrics");
        rewrite_legacy_path(&mut other);
        assert_eq!(other.uri().path(), "/metrics");
    }

    #[test]
    fn rpc_predicate_needs_http2_and_content_type() {
        let mut req = request("/etcdserverpb.KV/Range");
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc+proto"));
        assert!(!is_rpc_request(&req));
        *req.version_mut() = Version::HTTP_2;
        assert!(is_rpc_request(&req));
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_rpc_request(&req));
    }

    #[tokio::test]
    async fn partition_is_total() {
        let router = grpc_handler_func(tagged("rpc"), Some(tagged("other")));
        assert_eq!(router.len(), 2);

        let mut rpc = request("/etcdserverpb.KV/Range");
        *rpc.version_mut() = Version::HTTP_2;
        rpc.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
        assert_eq!(text(router.call(rpc).await).await, "rpc");
        assert_eq!(text(router.call(request("/health")).await).await, "other");

        let only_rpc = grpc_handler_func(tagged("rpc"), None);
        assert_eq!(only_rpc.len(), 1);
        assert_eq!(text(only_rpc.call(request("/health")).await).await, "rpc");
    }

    #[tokio::test]
    async fn mux_longest_match_and_redirect() {
        let mut mux = ServeMux::new();
        mux.handle("/", tagged("root")).unwrap();
        mux.handle("/v3beta/", tagged("gateway")).unwrap();
        mux.handle("/debug/pprof/", tagged("pprof")).unwrap();
        mux.handle("/debug/pprof/cmdline", tagged("cmdline")).unwrap();
        assert!(mux.handle("/v3beta/", tagged("dup")).is_err());

        assert_eq!(text(mux.call(request("/v3beta/kv/range")).await).await, "gateway");
        assert_eq!(text(mux.call(request("/debug/pprof/cmdline")).await).await, "cmdline");
        assert_eq!(text(mux.call(request("/debug/pprof/heap")).await).await, "pprof");
        assert_eq!(text(mux.call(request("/version")).await).await, "root");

        let redirect = mux.call(request("/v3beta?x=1")).await;
        assert_eq!(redirect.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(redirect.headers().get(LOCATION).unwrap(), "/v3beta/?x=1");
    }

    #[tokio::test]
    async fn mux_without_root_returns_404() {
        let mut mux = ServeMux::new();
        mux.handle("/health", tagged("health")).unwrap();
        let response = mux.call(request("/nothing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrapped_mux_serves_legacy_paths() {
        let mut mux = ServeMux::new();
        mux.handle("/v3beta/", tagged("gateway")).unwrap();
        let handler = wrap_mux(mux);
        assert_eq!(text(handler.call(request("/v3alpha/kv/put")).await).await, "gateway");
    }

    #[test]
    fn create_mux_rejects_conflicting_user_handler() {
        let mut user = BTreeMap::new();
        user.insert(STABLE_PREFIX.to_string(), tagged("user"));
        let err = create_mux(&user, Some(tagged("gw")), None, &Logger::discard()).err();
        assert!(matches!(err, Some(ServeError::RegistrationError(_))));

        let mut user = BTreeMap::new();
        user.insert("/debug/events".to_string(), tagged("events"));
        let mux = create_mux(&user, Some(tagged("gw")), Some(tagged("root")), &Logger::discard()).unwrap();
        assert_eq!(mux.patterns().collect::<Vec<_>>(), vec!["/", "/debug/events", "/v3beta/"]);
    }
}
