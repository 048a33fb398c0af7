//! 错误类型定义
//!
//! 服务层统一使用 [`ServeError`]，面向用户的文本通过 `error_i18n` 做多语言处理。

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::error_i18n::localize;

/// 服务层错误
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("{}", localize("config_error", .0))]
    ConfigError(String),

    #[error("{}", localize("io_error", &.0.to_string()))]
    IoError(#[from] std::io::Error),

    #[error("{}", localize("tls_error", .0))]
    TlsError(String),

    #[error("{}", localize("dial_error", .0))]
    DialError(String),

    #[error("{}", localize("registration_error", .0))]
    RegistrationError(String),

    #[error("{}", localize("unmatched_connection", &.0.to_string()))]
    Unmatched(SocketAddr),

    #[error("{}", localize("sniff_timeout", &.0.to_string()))]
    SniffTimeout(SocketAddr),

    #[error("{}", localize("listener_closed", ""))]
    ListenerClosed,

    #[error("{}", localize("server_stopped", ""))]
    ServerStopped,

    #[error("{}", localize("drain_timeout", &format!("{:?}", .0)))]
    DrainTimeout(Duration),

    #[error("{}", localize("channel_closed", ""))]
    ChannelClosed,
}

impl ServeError {
    /// accept 循环可以继续的错误（对端重置、文件描述符暂时耗尽等）
    pub fn is_transient_accept(err: &std::io::Error) -> bool {
        use std::io::ErrorKind;
        if matches!(
            err.kind(),
            ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionReset
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::TimedOut
        ) {
            return true;
        }
        // EMFILE / ENFILE
        matches!(err.raw_os_error(), Some(23) | Some(24))
    }

    /// 客户端正常断开，不值得以 error 级别记录
    pub fn is_benign_disconnect(message: &str) -> bool {
        message.contains("connection closed")
            || message.contains("broken pipe")
            || message.contains("connection reset")
            || message.contains("unexpected end of file")
            || message.contains("CANCELED")
    }
}

/// 服务层结果类型
pub type ServeResult<T> = Result<T, ServeError>;

/// 装箱错误，用于 HTTP body 等需要擦除错误类型的位置
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 异步错误回调：accept 循环与关闭流程通过它上报非致命错误
pub type ErrorHandler = std::sync::Arc<dyn Fn(ServeError) + Send + Sync>;
