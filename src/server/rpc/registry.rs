//! RPC 服务注册表与处理器特征

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use hyper::HeaderMap;

use crate::error::{ServeError, ServeResult};

use super::status::RpcStatus;

/// 消息流（请求或响应方向）
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Bytes, RpcStatus>> + Send>>;

/// 处理器返回的 future
pub type RpcFuture = Pin<Box<dyn Future<Output = Result<RpcReply, RpcStatus>> + Send>>;

/// 一次 RPC 调用
pub struct RpcRequest {
    /// 完整方法路径，例如 `/etcdserverpb.KV/Range`
    pub method: String,
    pub metadata: HeaderMap,
    pub messages: MessageStream,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, metadata: HeaderMap, messages: MessageStream) -> Self {
        Self {
            method: method.into(),
            metadata,
            messages,
        }
    }

    /// 一元调用：取出唯一一条请求消息
    pub async fn into_message(mut self) -> Result<Bytes, RpcStatus> {
        match self.messages.next().await {
            Some(message) => message,
            None => Err(RpcStatus::internal(format!(
                "{}: client sent no request message",
                self.method
            ))),
        }
    }
}

/// 处理器的回复
pub enum RpcReply {
    Unary(Bytes),
    Stream(MessageStream),
}

impl RpcReply {
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, RpcStatus>> + Send + 'static,
    {
        RpcReply::Stream(Box::pin(stream))
    }
}

/// RPC 方法处理器
pub trait RpcHandler: Send + Sync {
    fn call(&self, request: RpcRequest) -> RpcFuture;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(RpcRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RpcReply, RpcStatus>> + Send + 'static,
{
    fn call(&self, request: RpcRequest) -> RpcFuture {
        Box::pin(self(request))
    }
}

/// 拼出方法路径 `/{service}/{method}`
pub fn method_path(service: &str, method: &str) -> String {
    format!("/{}/{}", service, method)
}

/// 服务注册表：方法路径 -> 处理器
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    handlers: BTreeMap<String, Arc<dyn RpcHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册方法；同一路径重复注册返回错误
    pub fn register<H>(&mut self, service: &str, method: &str, handler: H) -> ServeResult<()>
    where
        H: RpcHandler + 'static,
    {
        self.register_path(method_path(service, method), Arc::new(handler))
    }

    pub fn register_path(&mut self, path: String, handler: Arc<dyn RpcHandler>) -> ServeResult<()> {
        if self.handlers.contains_key(&path) {
            return Err(ServeError::RegistrationError(format!(
                "rpc method {} registered twice",
                path
            )));
        }
        self.handlers.insert(path, handler);
        Ok(())
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(path).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
