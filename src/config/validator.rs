use anyhow::{bail, Result};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::warn;

use super::{AppConfig, ListenerConfig, OutputProxyConfig, OutputProxyKind, SecurityConfig};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_app_config(config: &AppConfig) -> Result<()> {
        if config.root_dir.trim().is_empty() {
            bail!("root_dir cannot be empty");
        }

        Self::validate_listener(&config.proxy)?;
        Self::validate_output_proxy(&config.output_proxy)?;
        Self::validate_security(&config.security)?;

        if config.counter.flush_interval_secs == 0 {
            bail!("counter.flush_interval_secs must be greater than 0");
        }

        if let Some(port) = config.status.port {
            Self::validate_port(port, "status")?;
            Self::validate_address(&config.status.addr, "status addr")?;
            if port == config.proxy.listen_port {
                bail!(
                    "status.port ({}) must differ from proxy.listen_port",
                    port
                );
            }
        }

        Ok(())
    }

    /// 验证监听器配置
    pub fn validate_listener(config: &ListenerConfig) -> Result<()> {
        let addr = config.listen_addr.trim();
        if !addr.is_empty() && addr.parse::<IpAddr>().is_err() {
            bail!("proxy.listen_addr '{}' is not a valid IP address", addr);
        }

        Self::validate_port(config.listen_port, "proxy listen_port")?;

        if config.max_connections == 0 {
            bail!("proxy.max_connections must be greater than 0");
        }
        if config.header_timeout_secs == 0 {
            bail!("proxy.header_timeout_secs must be greater than 0");
        }
        if config.connect_timeout_secs == 0 {
            bail!("proxy.connect_timeout_secs must be greater than 0");
        }
        if config.max_connections > 100_000 {
            warn!(
                "proxy.max_connections is very large ({}), file descriptor limits may be hit first",
                config.max_connections
            );
        }
        Ok(())
    }

    /// 验证上游代理配置（仅在启用时检查）
    pub fn validate_output_proxy(config: &OutputProxyConfig) -> Result<()> {
        if !config.is_active() {
            return Ok(());
        }

        Self::validate_address(&config.host, "output_proxy host")?;
        Self::validate_port(config.port, "output_proxy")?;

        if config.user.len() > 255 || config.password.len() > 255 {
            bail!("output_proxy user and password must each be at most 255 bytes");
        }

        // SOCKS5 用户名/密码认证要求两者都非空
        if config.kind == OutputProxyKind::Socks5
            && (config.user.is_empty() != config.password.is_empty())
        {
            bail!("output_proxy socks5 requires both user and password, or neither");
        }
        Ok(())
    }

    /// 验证安全策略配置
    pub fn validate_security(config: &SecurityConfig) -> Result<()> {
        for host in &config.deny_hosts {
            if host.trim().is_empty() {
                bail!("security.deny_hosts cannot contain empty entries");
            }
        }
        for network in &config.deny_networks {
            if network.parse::<IpNetwork>().is_err() {
                bail!("security.deny_networks entry '{}' is not a valid CIDR", network);
            }
        }
        Ok(())
    }
}
