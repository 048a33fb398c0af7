//! 被服务的节点

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::ServeResult;
use crate::server::rpc::ServiceRegistry;

/// 节点能力：就绪信号 + RPC 服务注册
pub trait Node: Send + Sync {
    /// 节点可以对外服务时完成
    fn ready(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// 把节点实现的 RPC 服务注册进来
    fn register_services(&self, registry: &mut ServiceRegistry) -> ServeResult<()>;
}

/// 额外的 RPC 服务注册回调
pub type ServiceRegister = Arc<dyn Fn(&mut ServiceRegistry) -> ServeResult<()> + Send + Sync>;

/// 一次性就绪通知
#[derive(Clone)]
pub struct ReadyNotify {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadyNotify {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn notify(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // 发送端由 self 持有，不会提前关闭
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ReadyNotify {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_wake_on_notify() {
        let ready = ReadyNotify::new();
        assert!(!ready.is_ready());
        let waiter = {
            let ready = ready.clone();
            tokio::spawn(async move { ready.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        ready.notify();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        // 就绪后再等待立即返回
        tokio::time::timeout(Duration::from_millis(100), ready.wait()).await.unwrap();
    }
}
