//! 服务层配置
//!
//! `ServeConfig` 可以从 TOML 加载，校验后转换为运行期使用的 [`ServeOptions`]。

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServeError, ServeResult};
use crate::server::rpc::RpcServerOptions;
use crate::server::tls::TlsInfo;

/// HTTP/2 协议允许的帧大小范围
const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = 16_777_215;

/// 服务层配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// 监听地址（客户端端口）
    pub listen_addr: SocketAddr,
    /// 是否提供 TLS 服务
    pub secure: bool,
    /// 是否提供明文服务
    pub insecure: bool,
    /// 关闭时等待在途请求的上限（毫秒）
    pub shutdown_timeout_ms: u64,
    /// 协议嗅探超时（毫秒）
    pub sniff_timeout_ms: u64,
    /// 协议嗅探最多预读的字节数
    pub max_sniff_bytes: usize,
    /// 是否注册 /debug/pprof/ 处理器
    pub enable_pprof: bool,
    /// 是否注册 /debug/requests 与 /debug/events 处理器
    pub enable_trace: bool,
    /// 追踪记录保留条数
    pub trace_capacity: usize,
    /// TLS 证书配置
    pub tls: Option<TlsFileConfig>,
    /// RPC 引擎参数
    pub rpc: RpcConfig,
}

/// TLS 证书来源
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsFileConfig {
    /// 证书链 PEM 路径
    pub cert_path: Option<PathBuf>,
    /// 私钥 PEM 路径
    pub key_path: Option<PathBuf>,
    /// 开发模式：未提供证书时生成自签名证书
    pub self_signed: bool,
    /// 自签名证书的主机名
    pub hostnames: Vec<String>,
}

/// RPC 引擎参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// 单条请求消息的最大字节数
    pub max_recv_message_bytes: usize,
    /// 单连接最大并发流
    pub max_concurrent_streams: u32,
    /// HTTP/2 最大帧大小
    pub max_frame_size: u32,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 2379)),
            secure: false,
            insecure: true,
            shutdown_timeout_ms: 5_000,
            sniff_timeout_ms: 1_000,
            max_sniff_bytes: 4_096,
            enable_pprof: false,
            enable_trace: false,
            trace_capacity: 256,
            tls: None,
            rpc: RpcConfig::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_recv_message_bytes: 4 * 1024 * 1024,
            max_concurrent_streams: 1_000,
            max_frame_size: 1024 * 1024,
        }
    }
}

impl ServeConfig {
    pub fn from_toml_str(content: &str) -> ServeResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|err| ServeError::ConfigError(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ServeResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, path: &Path) -> ServeResult<()> {
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ServeError::ConfigError(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn validate(&self) -> ServeResult<()> {
        if !self.secure && !self.insecure {
            return Err(ServeError::ConfigError(
                "at least one of secure/insecure must be enabled".to_string(),
            ));
        }
        if self.sniff_timeout_ms == 0 {
            return Err(ServeError::ConfigError("sniff_timeout_ms must be positive".to_string()));
        }
        if self.max_sniff_bytes < 24 {
            return Err(ServeError::ConfigError(
                "max_sniff_bytes must cover the HTTP/2 preface (24 bytes)".to_string(),
            ));
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.rpc.max_frame_size) {
            return Err(ServeError::ConfigError(format!(
                "rpc.max_frame_size must be within {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}"
            )));
        }
        if self.rpc.max_recv_message_bytes == 0 {
            return Err(ServeError::ConfigError(
                "rpc.max_recv_message_bytes must be positive".to_string(),
            ));
        }
        if self.secure {
            match &self.tls {
                None => {
                    return Err(ServeError::ConfigError(
                        "secure serving requires a [tls] section".to_string(),
                    ));
                }
                Some(tls) if !tls.self_signed && (tls.cert_path.is_none() || tls.key_path.is_none()) => {
                    return Err(ServeError::ConfigError(
                        "tls needs cert_path and key_path unless self_signed is set".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// 运行期参数
    pub fn serve_options(&self) -> ServeOptions {
        ServeOptions {
            sniff_timeout: Duration::from_millis(self.sniff_timeout_ms),
            max_sniff_bytes: self.max_sniff_bytes,
            trace_capacity: self.trace_capacity,
            rpc: RpcServerOptions {
                max_recv_message_bytes: self.rpc.max_recv_message_bytes,
                max_concurrent_streams: self.rpc.max_concurrent_streams,
                max_frame_size: self.rpc.max_frame_size,
            },
        }
    }

    /// 按配置加载证书；未启用 TLS 时返回 `None`
    pub fn tls_info(&self) -> ServeResult<Option<TlsInfo>> {
        if !self.secure {
            return Ok(None);
        }
        let tls = self
            .tls
            .as_ref()
            .ok_or_else(|| ServeError::ConfigError("secure serving requires a [tls] section".to_string()))?;
        match (&tls.cert_path, &tls.key_path) {
            (Some(cert), Some(key)) => TlsInfo::from_files(cert, key).map(Some),
            _ if tls.self_signed => {
                let hosts = if tls.hostnames.is_empty() {
                    vec!["localhost".to_string(), self.listen_addr.ip().to_string()]
                } else {
                    tls.hostnames.clone()
                };
                TlsInfo::self_signed(&hosts).map(Some)
            }
            _ => Err(ServeError::ConfigError(
                "tls needs cert_path and key_path unless self_signed is set".to_string(),
            )),
        }
    }
}

/// 运行期参数
#[derive(Clone, Debug)]
pub struct ServeOptions {
    pub sniff_timeout: Duration,
    pub max_sniff_bytes: usize,
    pub trace_capacity: usize,
    pub rpc: RpcServerOptions,
}

impl Default for ServeOptions {
    fn default() -> Self {
        ServeConfig::default().serve_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServeConfig::default();
        config.validate().unwrap();
        assert!(config.insecure);
        assert_eq!(config.serve_options().sniff_timeout, Duration::from_secs(1));
    }

    #[test]
    fn parses_partial_toml() {
        let config = ServeConfig::from_toml_str(
            r#"
            listen_addr = "0.0.0.0:12379"
            secure = true
            insecure = true
            shutdown_timeout_ms = 250

            [tls]
            self_signed = true
            hostnames = ["node-1.local"]

            [rpc]
            max_frame_size = 32768
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 12379);
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(250));
        assert_eq!(config.rpc.max_frame_size, 32_768);
        assert_eq!(config.rpc.max_concurrent_streams, 1_000);
        assert!(config.tls.as_ref().unwrap().self_signed);
    }

    #[test]
    fn rejects_nothing_enabled() {
        let err = ServeConfig::from_toml_str("secure = false\ninsecure = false").unwrap_err();
        assert!(matches!(err, ServeError::ConfigError(_)));
    }

    #[test]
    fn secure_requires_certificates() {
        let err = ServeConfig::from_toml_str("secure = true").unwrap_err();
        assert!(matches!(err, ServeError::ConfigError(_)));
        let err = ServeConfig::from_toml_str("secure = true\n[tls]\ncert_path = \"a.pem\"").unwrap_err();
        assert!(matches!(err, ServeError::ConfigError(_)));
    }

    #[test]
    fn rejects_out_of_range_frame_size() {
        let err = ServeConfig::from_toml_str("[rpc]\nmax_frame_size = 1024").unwrap_err();
        assert!(matches!(err, ServeError::ConfigError(_)));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serve.toml");
        let mut config = ServeConfig::default();
        config.enable_trace = true;
        config.save(&path).unwrap();
        let loaded = ServeConfig::load(&path).unwrap();
        assert!(loaded.enable_trace);
        assert_eq!(loaded.listen_addr, config.listen_addr);
    }
}
