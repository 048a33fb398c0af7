use std::sync::Once;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// 确保 rustls 的 ring 加密后端只安装一次
///
/// 构建任何 `ServerConfig`/`ClientConfig` 之前调用；重复调用无副作用，
/// 若进程里已有其它后端被安装则沿用它。
pub fn ensure_crypto_provider_installed() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            crate::utils::logger::debug!("🔐 已存在进程级 rustls 加密后端，沿用现有配置");
        } else {
            crate::utils::logger::debug!("🔐 rustls ring 加密后端已安装");
        }
    });
}
