//! 日志模块
//!
//! 宏直接转发到 `rat_logger`；服务层组件通过注入的 [`Logger`] 句柄记录日志，
//! 不依赖任何进程级日志配置。

use std::fmt::Display;
use std::sync::{Arc, Mutex};

pub use rat_logger::{debug, error, info, warn};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// 捕获到的日志记录（测试与诊断用）
pub type CapturedLogs = Arc<Mutex<Vec<(Level, String)>>>;

/// 注入式日志句柄
///
/// 克隆代价低；`muted()` 得到的句柄丢弃所有记录，对应
/// “服务器内部错误日志不外泄”的场景。
#[derive(Clone)]
pub struct Logger {
    scope: Arc<str>,
    enabled: bool,
    capture: Option<CapturedLogs>,
}

impl Logger {
    pub fn new(scope: impl Into<Arc<str>>) -> Self {
        Self {
            scope: scope.into(),
            enabled: true,
            capture: None,
        }
    }

    /// 丢弃所有记录的句柄
    pub fn discard() -> Self {
        Self {
            scope: Arc::from("discard"),
            enabled: false,
            capture: None,
        }
    }

    /// 只写入内存、不转发到 `rat_logger` 的句柄
    pub fn capturing(scope: impl Into<Arc<str>>) -> (Self, CapturedLogs) {
        let logs: CapturedLogs = Arc::new(Mutex::new(Vec::new()));
        let logger = Self {
            scope: scope.into(),
            enabled: true,
            capture: Some(logs.clone()),
        };
        (logger, logs)
    }

    /// 派生子作用域，例如 `serve` -> `serve/cmux`
    pub fn scoped(&self, child: &str) -> Self {
        Self {
            scope: Arc::from(format!("{}/{}", self.scope, child)),
            enabled: self.enabled,
            capture: self.capture.clone(),
        }
    }

    /// 保留作用域但静默
    pub fn muted(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            enabled: false,
            capture: None,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn debug(&self, msg: impl Display) {
        self.emit(Level::Debug, msg);
    }

    pub fn info(&self, msg: impl Display) {
        self.emit(Level::Info, msg);
    }

    pub fn warn(&self, msg: impl Display) {
        self.emit(Level::Warn, msg);
    }

    pub fn error(&self, msg: impl Display) {
        self.emit(Level::Error, msg);
    }

    fn emit(&self, level: Level, msg: impl Display) {
        if !self.enabled {
            return;
        }
        if let Some(capture) = &self.capture {
            if let Ok(mut logs) = capture.lock() {
                logs.push((level, msg.to_string()));
            }
            return;
        }
        match level {
            Level::Debug => debug!("[{}] {}", self.scope, msg),
            Level::Info => info!("[{}] {}", self.scope, msg),
            Level::Warn => warn!("[{}] {}", self.scope, msg),
            Level::Error => error!("[{}] {}", self.scope, msg),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("serve")
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("scope", &self.scope)
            .field("enabled", &self.enabled)
            .finish()
    }
}
