//! 服务层
//!
//! 单个监听套接字上同时提供 RPC、REST 网关与 WebSocket 流式桥接。
//! 入口是 [`ServeCtx`]。

pub mod body;
pub mod cmux;
pub mod debug;
pub mod gateway;
pub mod handle_slot;
pub mod http_server;
pub mod node;
pub mod router;
pub mod rpc;
pub mod serve;
pub mod shutdown;
pub mod tls;
pub mod wsproxy;

pub use cmux::{ConnMux, Matcher, MuxOptions, SubListener};
pub use gateway::{CallKind, GatewayMux, JsonPassthrough, Marshaler, register_gateway};
pub use handle_slot::{HandleSlot, SlotState};
pub use http_server::HttpServer;
pub use node::{Node, ReadyNotify, ServiceRegister};
pub use router::{HttpHandler, ProtocolRouter, ServeMux, SharedHandler, handler_fn};
pub use serve::ServeCtx;
pub use shutdown::{StopOutcome, stop_insecure_server, stop_secure_server};
pub use tls::{TlsInfo, TlsListener, TlsProvider};
pub use wsproxy::WebsocketProxy;
