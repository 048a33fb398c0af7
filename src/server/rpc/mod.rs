//! 最小 RPC 引擎
//!
//! 长度前缀消息 + `grpc-status` trailers，跑在 HTTP/2 上。只负责承载已注册的服务，
//! 不做压缩、拦截器与超时传播。

pub mod client;
pub mod codec;
pub mod registry;
pub mod server;
pub mod status;

pub use client::{DialCredentials, RpcChannel};
pub use codec::{MessageDecoder, RPC_CONTENT_TYPE, encode_message};
pub use registry::{MessageStream, RpcFuture, RpcHandler, RpcReply, RpcRequest, ServiceRegistry, method_path};
pub use server::{RpcServer, RpcServerOptions};
pub use status::{Code, RpcStatus};
