//! TLS 能力
//!
//! - [`TlsProvider`]：产出服务端 `ServerConfig` 并把子监听器包装成 TLS 监听器
//! - [`TlsInfo`]：从 PEM 文件/字节或自签名证书构建的默认实现
//! - [`loopback_client_config`]：网关回连本节点用的客户端配置（跳过证书验证，ALPN h2）

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::error::{ServeError, ServeResult};
use crate::server::cmux::{MuxConn, ReplayStream, SubListener};
use crate::utils::crypto_provider::ensure_crypto_provider_installed;

/// 默认 TLS 握手超时
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// ALPN 协议标识
pub struct AlpnProtocol;

impl AlpnProtocol {
    pub const HTTP2: &'static [u8] = b"h2";
    pub const HTTP1_1: &'static [u8] = b"http/1.1";

    pub fn is_http2(protocol: &Option<Vec<u8>>) -> bool {
        protocol.as_deref() == Some(Self::HTTP2)
    }
}

/// TLS 能力
pub trait TlsProvider: Send + Sync {
    /// 服务端配置；ALPN 需要同时包含 `h2` 与 `http/1.1`
    fn server_config(&self) -> ServeResult<Arc<ServerConfig>>;

    /// 把子监听器包装成 TLS 监听器
    fn tls_listener(&self, inner: SubListener, config: Arc<ServerConfig>) -> TlsListener {
        TlsListener::new(inner, config, DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

/// 证书链 + 私钥
pub struct TlsInfo {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    handshake_timeout: Duration,
}

impl TlsInfo {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> ServeResult<Self> {
        if cert_chain.is_empty() {
            return Err(ServeError::TlsError("certificate chain is empty".to_string()));
        }
        Ok(Self {
            cert_chain,
            key,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// 从 PEM 字节加载
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> ServeResult<Self> {
        let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServeError::TlsError(format!("unable to parse certificate: {}", e)))?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| ServeError::TlsError(format!("unable to parse private key: {}", e)))?
            .ok_or_else(|| ServeError::TlsError("private key PEM is empty".to_string()))?;
        Self::new(cert_chain, key)
    }

    /// 从 PEM 文件加载
    pub fn from_files(cert_path: &Path, key_path: &Path) -> ServeResult<Self> {
        let cert_file = File::open(cert_path)
            .map_err(|e| ServeError::TlsError(format!("open {}: {}", cert_path.display(), e)))?;
        let cert_chain = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServeError::TlsError(format!("unable to parse certificate: {}", e)))?;

        let key_file = File::open(key_path)
            .map_err(|e| ServeError::TlsError(format!("open {}: {}", key_path.display(), e)))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| ServeError::TlsError(format!("unable to parse private key: {}", e)))?
            .ok_or_else(|| ServeError::TlsError(format!("{} holds no private key", key_path.display())))?;
        Self::new(cert_chain, key)
    }

    /// 生成自签名证书（开发与测试用）
    pub fn self_signed(hostnames: &[String]) -> ServeResult<Self> {
        let cert = rcgen::generate_simple_self_signed(hostnames.to_vec())
            .map_err(|e| ServeError::TlsError(format!("unable to generate certificate: {}", e)))?;
        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| ServeError::TlsError(format!("unable to encode certificate: {}", e)))?;
        let key_pem = cert.serialize_private_key_pem();
        Self::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
    }
}

impl TlsProvider for TlsInfo {
    fn server_config(&self) -> ServeResult<Arc<ServerConfig>> {
        ensure_crypto_provider_installed();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| ServeError::TlsError(format!("invalid certificate or key: {}", e)))?;
        config.alpn_protocols = vec![AlpnProtocol::HTTP2.to_vec(), AlpnProtocol::HTTP1_1.to_vec()];
        Ok(Arc::new(config))
    }

    fn tls_listener(&self, inner: SubListener, config: Arc<ServerConfig>) -> TlsListener {
        TlsListener::new(inner, config, self.handshake_timeout)
    }
}

/// TLS 监听器：握手放在每个连接自己的任务里完成
pub struct TlsListener {
    inner: SubListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsListener {
    pub fn new(inner: SubListener, config: Arc<ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            inner,
            acceptor: TlsAcceptor::from(config),
            handshake_timeout,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    /// 接受一个尚未握手的连接
    pub async fn accept(&mut self) -> ServeResult<PendingTls> {
        let conn = self.inner.accept().await?;
        Ok(PendingTls {
            conn,
            acceptor: self.acceptor.clone(),
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// 等待握手的连接
pub struct PendingTls {
    conn: MuxConn,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl PendingTls {
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr
    }

    pub async fn handshake(self) -> ServeResult<TlsStream<ReplayStream<TcpStream>>> {
        let remote_addr = self.conn.remote_addr;
        tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(self.conn.stream))
            .await
            .map_err(|_| ServeError::TlsError(format!("handshake with {} timed out", remote_addr)))?
            .map_err(|e| ServeError::TlsError(format!("handshake with {} failed: {}", remote_addr, e)))
    }
}

/// 回连本节点用的客户端配置：跳过证书验证，ALPN 只协商 h2
pub fn loopback_client_config() -> Arc<ClientConfig> {
    ensure_crypto_provider_installed();
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
        .with_no_client_auth();
    config.alpn_protocols = vec![AlpnProtocol::HTTP2.to_vec()];
    Arc::new(config)
}

/// 不验证服务端证书的校验器
#[derive(Debug)]
pub struct NoVerification {
    schemes: Vec<SignatureScheme>,
}

impl NoVerification {
    pub fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl Default for NoVerification {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
