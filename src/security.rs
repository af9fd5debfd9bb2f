//! Security decisions for incoming proxy requests
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;

use crate::config::SecurityConfig;
use crate::request::ProxyRequest;

/// 安全检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub permitted: bool,
    pub reason: String,
}

impl Decision {
    pub fn permit() -> Self {
        Self {
            permitted: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            permitted: false,
            reason: reason.into(),
        }
    }
}

/// 请求安全策略
pub trait SecurityPolicy: Send + Sync + fmt::Debug {
    fn decide(&self, request: &ProxyRequest) -> Decision;
}

/// 放行所有请求
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

impl SecurityPolicy for PermitAll {
    fn decide(&self, _request: &ProxyRequest) -> Decision {
        Decision::permit()
    }
}

/// 基于目标主机名和网段的黑名单
#[derive(Debug, Default, Clone)]
pub struct HostPolicy {
    exact: Vec<String>,
    suffixes: Vec<String>,
    networks: Vec<IpNetwork>,
}

impl HostPolicy {
    /// 从配置构建；无法解析的网段被忽略（配置校验阶段已拒绝）
    pub fn from_config(config: &SecurityConfig) -> Self {
        let mut policy = Self::default();
        for host in &config.deny_hosts {
            let host = host.trim().to_ascii_lowercase();
            if let Some(suffix) = host.strip_prefix("*.") {
                policy.suffixes.push(format!(".{}", suffix));
            } else if !host.is_empty() {
                policy.exact.push(host);
            }
        }
        policy.networks = config
            .deny_networks
            .iter()
            .filter_map(|n| n.parse().ok())
            .collect();
        policy
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffixes.is_empty() && self.networks.is_empty()
    }

    fn check_host(&self, host: &str) -> Option<String> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if self.exact.iter().any(|h| *h == host) {
            return Some(format!("host {} is denied", host));
        }
        if let Some(suffix) = self.suffixes.iter().find(|s| host.ends_with(s.as_str())) {
            return Some(format!("host {} matches denied pattern *{}", host, suffix));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            if let Some(network) = self.networks.iter().find(|n| n.contains(ip)) {
                return Some(format!("address {} is in denied network {}", ip, network));
            }
        }
        None
    }
}

impl SecurityPolicy for HostPolicy {
    fn decide(&self, request: &ProxyRequest) -> Decision {
        match self.check_host(&request.dest_host) {
            Some(reason) => Decision::deny(reason),
            None => Decision::permit(),
        }
    }
}
