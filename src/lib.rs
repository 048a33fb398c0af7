//! RAT Node Serve
//!
//! 数据节点的客户端服务层：一个监听端口，多种协议。
//!
//! - 明文模式按连接前导字节分流：HTTP/2 交给 RPC 引擎，HTTP/1 交给 REST 网关
//! - TLS 模式先终结 TLS，再按请求把 RPC 与 REST 分开
//! - REST 网关通过回环 RPC 通道调用节点自身，流式接口可经 WebSocket 桥接
//! - 关闭时先优雅排空，超时后强制中止

pub mod config;
pub mod error;
pub mod error_i18n;
pub mod server;
pub mod utils;

pub use config::{ServeConfig, ServeOptions};
pub use error::{ErrorHandler, ServeError, ServeResult};
pub use server::ServeCtx;
pub use utils::logger::Logger;
