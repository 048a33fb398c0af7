//! 关闭闸门：先优雅、后强制，总耗时受超时约束

use std::time::Duration;

use crate::error::ServeResult;
use crate::server::http_server::HttpServer;
use crate::server::rpc::RpcServer;
use crate::utils::logger::Logger;

/// 明文模式 RPC 停止的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 在途调用全部结束
    Graceful,
    /// 超时后强制中止
    Forced,
}

/// TLS 模式：HTTP 服务器排空（最多 `timeout`），然后强制停止挂在其中的 RPC 引擎。
/// 排空失败以错误返回，调用方负责上报，不影响后续步骤。
pub async fn stop_secure_server(
    rpc: &RpcServer,
    http: Option<&HttpServer>,
    timeout: Duration,
    logger: &Logger,
) -> ServeResult<()> {
    let drained = match http {
        Some(http) => http.shutdown(timeout).await,
        None => Ok(()),
    };
    if let Err(e) = &drained {
        logger.warn(format!("⚠️ HTTPS 服务器排空失败: {}", e));
    }
    rpc.stop();
    rpc.wait().await;
    drained
}

/// 明文模式：后台优雅停止，与超时赛跑；超时则强制停止并等后台任务退出
pub async fn stop_insecure_server(rpc: &RpcServer, timeout: Duration, logger: &Logger) -> StopOutcome {
    let mut graceful = {
        let rpc = rpc.clone();
        tokio::spawn(async move { rpc.graceful_stop().await })
    };
    match tokio::time::timeout(timeout, &mut graceful).await {
        Ok(_) => StopOutcome::Graceful,
        Err(_) => {
            logger.warn(format!("⏰ RPC 服务器 {:?} 内未能优雅停止，强制关闭", timeout));
            rpc.stop();
            let _ = graceful.await;
            StopOutcome::Forced
        }
    }
}
