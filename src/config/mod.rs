// 配置管理模块 - 使用模块化设计

mod validator;

pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// 上游代理类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputProxyKind {
    /// 不使用上游代理（直连）
    None,
    /// HTTP CONNECT 上游代理
    #[default]
    Http,
    /// SOCKS4 上游代理
    Socks4,
    /// SOCKS5 上游代理
    Socks5,
}

impl fmt::Display for OutputProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputProxyKind::None => "none",
            OutputProxyKind::Http => "http",
            OutputProxyKind::Socks4 => "socks4",
            OutputProxyKind::Socks5 => "socks5",
        };
        f.write_str(name)
    }
}

/// 上游代理配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputProxyConfig {
    /// 是否启用上游代理
    pub enabled: bool,
    /// 上游代理类型
    pub kind: OutputProxyKind,
    /// 上游代理主机
    pub host: String,
    /// 上游代理端口
    pub port: u16,
    /// 用户名（SOCKS4 时作为 user id），为空表示不认证
    pub user: String,
    /// 密码，为空表示不认证
    pub password: String,
}

impl Default for OutputProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: OutputProxyKind::Http,
            host: String::new(),
            port: 0,
            user: String::new(),
            password: String::new(),
        }
    }
}

impl OutputProxyConfig {
    /// 是否真正经由上游代理连接
    pub fn is_active(&self) -> bool {
        self.enabled && self.kind != OutputProxyKind::None
    }
}

/// 监听器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// 监听地址（为空时监听所有地址）
    pub listen_addr: String,
    /// 监听端口
    pub listen_port: u16,
    /// 最大并发连接数
    pub max_connections: usize,
    /// 读取请求头的超时时间（秒）
    pub header_timeout_secs: u64,
    /// 连接目标/上游代理的超时时间（秒）
    pub connect_timeout_secs: u64,
    /// 收到关闭信号后等待在途连接结束的时间（秒）
    pub drain_timeout_secs: u64,
    /// 转发 HTTP 请求时是否接受无效证书
    pub accept_invalid_certs: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 8000,
            max_connections: 256,
            header_timeout_secs: 30,
            connect_timeout_secs: 10,
            drain_timeout_secs: 30,
            accept_invalid_certs: true,
        }
    }
}

impl ListenerConfig {
    /// 实际绑定地址，空地址回退到 0.0.0.0
    pub fn bind_address(&self) -> String {
        let addr = self.listen_addr.trim();
        let addr = if addr.is_empty() { "0.0.0.0" } else { addr };
        if addr.contains(':') {
            format!("[{}]:{}", addr, self.listen_port)
        } else {
            format!("{}:{}", addr, self.listen_port)
        }
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// 安全检查配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// true 时拒绝被判定为不允许的请求；false 时只记录日志
    pub enforce: bool,
    /// 禁止访问的主机（支持 "*.example.com" 通配）
    pub deny_hosts: Vec<String>,
    /// 禁止访问的网段（CIDR，如 "10.0.0.0/8"）
    pub deny_networks: Vec<String>,
}

/// 流量计数器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// 落盘间隔（秒）
    pub flush_interval_secs: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 30,
        }
    }
}

impl CounterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// 状态查询 HTTP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// 状态服务端口（不设置则不启动）
    pub port: Option<u16>,
    /// 状态服务绑定地址
    pub addr: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            port: None,
            addr: "127.0.0.1".to_string(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 数据目录（流量统计文件存放位置），支持 "~" 展开
    pub root_dir: String,
    pub proxy: ListenerConfig,
    pub output_proxy: OutputProxyConfig,
    pub security: SecurityConfig,
    pub counter: CounterConfig,
    pub status: StatusConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root_dir: "./relay-proxy-data".to_string(),
            proxy: ListenerConfig::default(),
            output_proxy: OutputProxyConfig::default(),
            security: SecurityConfig::default(),
            counter: CounterConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置并验证
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        let config = Self::from_toml(&content)?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 解析 TOML 字符串
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse configuration")
    }

    /// 序列化为 TOML（用于生成模板）
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_app_config(self)
    }

    /// 展开后的数据目录
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.root_dir).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.proxy.listen_addr, "127.0.0.1");
        assert_eq!(config.proxy.listen_port, 8000);
        assert_eq!(config.proxy.max_connections, 256);
        assert!(config.proxy.accept_invalid_certs);
        assert!(!config.output_proxy.enabled);
        assert_eq!(config.output_proxy.kind, OutputProxyKind::Http);
        assert_eq!(config.counter.flush_interval(), Duration::from_secs(30));
        assert!(config.status.port.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_output_proxy_kind_serde() {
        let json = serde_json::to_string(&OutputProxyKind::Socks5).unwrap();
        assert_eq!(json, "\"socks5\"");

        let kind: OutputProxyKind = serde_json::from_str("\"socks4\"").unwrap();
        assert_eq!(kind, OutputProxyKind::Socks4);

        let kind: OutputProxyKind = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(kind, OutputProxyKind::None);
    }

    #[test]
    fn test_output_proxy_is_active() {
        let mut output = OutputProxyConfig::default();
        assert!(!output.is_active());

        output.enabled = true;
        assert!(output.is_active());

        output.kind = OutputProxyKind::None;
        assert!(!output.is_active());
    }

    #[test]
    fn test_bind_address() {
        let mut listener = ListenerConfig::default();
        assert_eq!(listener.bind_address(), "127.0.0.1:8000");

        listener.listen_addr = String::new();
        assert_eq!(listener.bind_address(), "0.0.0.0:8000");

        listener.listen_addr = "::1".to_string();
        assert_eq!(listener.bind_address(), "[::1]:8000");
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
            root_dir = "/var/lib/relay-proxy"

            [proxy]
            listen_addr = "0.0.0.0"
            listen_port = 3128
            max_connections = 64

            [output_proxy]
            enabled = true
            kind = "socks5"
            host = "127.0.0.1"
            port = 1080
            user = "alice"
            password = "secret"

            [security]
            enforce = true
            deny_hosts = ["*.internal.example"]
            deny_networks = ["10.0.0.0/8"]

            [status]
            port = 8001
        "#;

        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.root_dir, "/var/lib/relay-proxy");
        assert_eq!(config.proxy.listen_port, 3128);
        assert_eq!(config.proxy.max_connections, 64);
        // 未设置的字段使用默认值
        assert_eq!(config.proxy.header_timeout_secs, 30);

        assert!(config.output_proxy.enabled);
        assert_eq!(config.output_proxy.kind, OutputProxyKind::Socks5);
        assert_eq!(config.output_proxy.user, "alice");
        assert_eq!(config.output_proxy.password, "secret");

        assert!(config.security.enforce);
        assert_eq!(config.security.deny_networks, vec!["10.0.0.0/8"]);
        assert_eq!(config.status.port, Some(8001));
        assert_eq!(config.status.addr, "127.0.0.1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_template_roundtrip() {
        let template = AppConfig::default().to_toml().unwrap();
        let parsed = AppConfig::from_toml(&template).unwrap();
        assert_eq!(parsed.proxy.listen_port, 8000);
        assert_eq!(parsed.output_proxy, OutputProxyConfig::default());
    }

    #[test]
    fn test_root_path_tilde_expansion() {
        let config = AppConfig {
            root_dir: "~/relay-proxy".to_string(),
            ..AppConfig::default()
        };
        let path = config.root_path();
        assert!(path.ends_with("relay-proxy"));
        if let Ok(home) = std::env::var("HOME") {
            assert!(path.starts_with(home));
        }
    }
}
