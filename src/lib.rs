/// relay-proxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod counter;
pub mod error;
pub mod forwarder;
pub mod registry;
pub mod request;
pub mod security;
pub mod server;
pub mod tunnel;
pub mod upstream;

// 重新导出常用类型
pub use config::{AppConfig, OutputProxyConfig, OutputProxyKind};
pub use counter::{format_bytes, CounterSnapshot, TransferCounter};
pub use error::{ProxyError, Result};
pub use registry::{RegistryGuard, TunnelRegistry};
pub use request::{HeaderList, ProxyRequest};
pub use security::{Decision, HostPolicy, PermitAll, SecurityPolicy};
pub use server::{run_server, ProxyServer, ServerDependencies, ServerState};
pub use tunnel::{Tunnel, TunnelEngine, TunnelState, CONNECT_ESTABLISHED};
pub use upstream::Upstream;
