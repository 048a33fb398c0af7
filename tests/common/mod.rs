//! 集成测试共用的假节点与启动工具

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use rat_node_serve::server::rpc::{RpcReply, RpcRequest, RpcStatus, ServiceRegistry};
use rat_node_serve::server::{Node, ReadyNotify, TlsProvider};
use rat_node_serve::{ErrorHandler, Logger, ServeCtx, ServeError, ServeOptions, ServeResult};

pub type Store = Arc<Mutex<BTreeMap<String, String>>>;

/// 内存 KV 假节点：Range / Put 一元调用，Watch 双向流（建立后一直挂起）
pub struct FakeNode {
    pub ready: ReadyNotify,
    pub store: Store,
}

impl FakeNode {
    pub fn new() -> Arc<Self> {
        let ready = ReadyNotify::new();
        ready.notify();
        Arc::new(Self {
            ready,
            store: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    pub fn put(&self, key: &str, value: &str) {
        self.store.lock().unwrap().insert(key.to_string(), value.to_string());
    }
}

fn parse(message: &Bytes) -> Result<Value, RpcStatus> {
    serde_json::from_slice(message).map_err(|e| RpcStatus::invalid_argument(e.to_string()))
}

fn reply(value: Value) -> Result<RpcReply, RpcStatus> {
    Ok(RpcReply::Unary(Bytes::from(value.to_string())))
}

impl Node for FakeNode {
    fn ready(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.ready.wait())
    }

    fn register_services(&self, registry: &mut ServiceRegistry) -> ServeResult<()> {
        let store = self.store.clone();
        registry.register("etcdserverpb.KV", "Range", move |request: RpcRequest| {
            let store = store.clone();
            async move {
                let query = parse(&request.into_message().await?)?;
                let kvs: Vec<Value> = {
                    let store = store.lock().unwrap();
                    match query.get("key").and_then(Value::as_str) {
                        Some(key) => store
                            .get(key)
                            .map(|value| vec![json!({"key": key, "value": value})])
                            .unwrap_or_default(),
                        None => store.iter().map(|(k, v)| json!({"key": k, "value": v})).collect(),
                    }
                };
                reply(json!({"count": kvs.len(), "kvs": kvs}))
            }
        })?;

        let store = self.store.clone();
        registry.register("etcdserverpb.KV", "Put", move |request: RpcRequest| {
            let store = store.clone();
            async move {
                let put = parse(&request.into_message().await?)?;
                let (Some(key), Some(value)) = (
                    put.get("key").and_then(Value::as_str),
                    put.get("value").and_then(Value::as_str),
                ) else {
                    return Err(RpcStatus::invalid_argument("key and value are required"));
                };
                store.lock().unwrap().insert(key.to_string(), value.to_string());
                reply(json!({"header": {"revision": 1}}))
            }
        })?;

        let store = self.store.clone();
        registry.register("etcdserverpb.Watch", "Watch", move |mut request: RpcRequest| {
            let store = store.clone();
            async move {
                let first = match request.messages.next().await {
                    Some(message) => parse(&message?)?,
                    None => return Err(RpcStatus::cancelled("watch closed before create")),
                };
                let key = first["create_request"]["key"].as_str().unwrap_or_default().to_string();
                let current = store.lock().unwrap().get(&key).cloned();
                let created = Bytes::from(json!({"created": true, "watch_id": 1}).to_string());
                let event = current.map(|value| {
                    Bytes::from(json!({"watch_id": 1, "events": [{"kv": {"key": key, "value": value}}]}).to_string())
                });
                let replies = futures_util::stream::iter(std::iter::once(created).chain(event).map(Ok))
                    .chain(futures_util::stream::pending());
                Ok::<_, RpcStatus>(RpcReply::stream(replies))
            }
        })?;
        Ok(())
    }
}

pub type Errors = Arc<Mutex<Vec<ServeError>>>;

pub fn collecting_errors() -> (ErrorHandler, Errors) {
    let errors: Errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let handler: ErrorHandler = Arc::new(move |err: ServeError| sink.lock().unwrap().push(err));
    (handler, errors)
}

pub struct Running {
    pub ctx: Arc<ServeCtx>,
    pub addr: SocketAddr,
    pub node: Arc<FakeNode>,
    pub serving: JoinHandle<ServeResult<()>>,
    pub errors: Errors,
}

pub fn test_options() -> ServeOptions {
    ServeOptions {
        sniff_timeout: Duration::from_millis(500),
        ..ServeOptions::default()
    }
}

/// 启动一个服务上下文并等到端口可连
pub async fn start(
    secure: bool,
    insecure: bool,
    tls: Option<Arc<dyn TlsProvider>>,
    configure: impl FnOnce(&mut ServeCtx),
) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut ctx = ServeCtx::new(listener, secure, insecure, test_options(), Logger::discard()).unwrap();
    configure(&mut ctx);
    let ctx = Arc::new(ctx);
    let addr = ctx.addr();
    let node = FakeNode::new();
    let (err_handler, errors) = collecting_errors();

    let serving = {
        let ctx = ctx.clone();
        let node: Arc<dyn Node> = node.clone();
        tokio::spawn(async move { ctx.serve(node, tls, None, err_handler).await })
    };
    // 给建立阶段一点时间
    tokio::time::sleep(Duration::from_millis(50)).await;
    Running {
        ctx,
        addr,
        node,
        serving,
        errors,
    }
}
