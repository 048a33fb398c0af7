//! 错误信息多语言支持模块
//!
//! 为服务层的错误信息提供多语言支持

use std::collections::HashMap;
use std::sync::Once;
use rat_embed_lang::i18n::register_translations;

static TRANSLATIONS_INIT: Once = Once::new();

fn entry(zh: &str, en: &str, ja: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("zh-CN".to_string(), zh.to_string());
    map.insert("en-US".to_string(), en.to_string());
    map.insert("ja-JP".to_string(), ja.to_string());
    map
}

/// 初始化错误信息的翻译
pub fn init_error_translations() {
    let mut translations = HashMap::new();

    // ConfigError - 配置错误
    translations.insert("config_error".to_string(), entry(
        "配置错误: {msg}",
        "Configuration error: {msg}",
        "設定エラー: {msg}",
    ));

    // IoError - IO错误
    translations.insert("io_error".to_string(), entry(
        "IO错误: {msg}",
        "IO error: {msg}",
        "IOエラー: {msg}",
    ));

    // TlsError - TLS错误
    translations.insert("tls_error".to_string(), entry(
        "TLS错误: {msg}",
        "TLS error: {msg}",
        "TLSエラー: {msg}",
    ));

    // DialError - 回环拨号错误
    translations.insert("dial_error".to_string(), entry(
        "回环连接失败: {msg}",
        "Loopback dial failed: {msg}",
        "ループバック接続失敗: {msg}",
    ));

    // RegistrationError - 注册错误
    translations.insert("registration_error".to_string(), entry(
        "注册失败: {msg}",
        "Registration failed: {msg}",
        "登録失敗: {msg}",
    ));

    // 连接分发相关
    translations.insert("unmatched_connection".to_string(), entry(
        "无法识别连接协议: {msg}",
        "No protocol matched connection from {msg}",
        "接続のプロトコルを識別できません: {msg}",
    ));
    translations.insert("sniff_timeout".to_string(), entry(
        "协议嗅探超时: {msg}",
        "Protocol sniffing timed out for {msg}",
        "プロトコル判定タイムアウト: {msg}",
    ));
    translations.insert("listener_closed".to_string(), entry(
        "监听器已关闭{msg}",
        "Listener closed{msg}",
        "リスナーは閉じられました{msg}",
    ));

    // 关闭相关
    translations.insert("server_stopped".to_string(), entry(
        "服务器已停止{msg}",
        "Server stopped{msg}",
        "サーバーは停止しました{msg}",
    ));
    translations.insert("drain_timeout".to_string(), entry(
        "连接排空超时: {msg}",
        "Connection drain timed out after {msg}",
        "接続ドレインのタイムアウト: {msg}",
    ));
    translations.insert("channel_closed".to_string(), entry(
        "RPC 通道已关闭{msg}",
        "RPC channel already closed{msg}",
        "RPCチャネルは既に閉じられています{msg}",
    ));

    register_translations(translations);

    // 设置语言 - 优先使用系统语言，fallback到中文
    use rat_embed_lang::{get_language_from_env, set_language};
    let system_lang = get_language_from_env();
    match system_lang.as_str() {
        "zh-CN" | "en-US" | "ja-JP" => set_language(&system_lang),
        _ => set_language("zh-CN"),
    }
}

/// 确保翻译只注册一次
pub fn ensure_translations() {
    TRANSLATIONS_INIT.call_once(init_error_translations);
}

/// 按当前语言格式化错误信息
///
/// 翻译缺失时退回英文模板，保证细节不丢失。
pub fn localize(key: &str, msg: &str) -> String {
    ensure_translations();
    let text = rat_embed_lang::tf(key, &[("msg", msg)]);
    if text.is_empty() || text == key || (!msg.is_empty() && !text.contains(msg)) {
        return format!("{}: {}", key.replace('_', " "), msg);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localize_keeps_message() {
        let text = localize("tls_error", "no certificate");
        assert!(text.contains("no certificate"));
    }

    #[test]
    fn unknown_key_falls_back() {
        let text = localize("no_such_key", "detail");
        assert!(text.contains("detail"));
    }
}
