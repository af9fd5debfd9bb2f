/// 代理错误类型
///
/// 每个连接的错误都在任务边界被捕获并记录，只结束该连接，
/// 唯一致命的情况是监听端口绑定失败（由 `anyhow` 在启动路径上返回）
use std::io;
use thiserror::Error;

/// relay-proxy 的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 请求行或请求头格式错误（关闭连接，不发送响应）
    #[error("Malformed request: {0}")]
    Parse(String),

    /// 连接目标或上游代理失败
    #[error("Failed to connect to {target} ({mode}): {source}")]
    Connect {
        target: String,
        mode: String,
        #[source]
        source: io::Error,
    },

    /// 隧道转发过程中的 I/O 错误
    #[error("Relay error: {0}")]
    Relay(#[source] io::Error),

    /// HTTP 转发失败（发送请求或接收响应）
    #[error("Forward error: {0}")]
    Forward(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建请求解析错误
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// 创建连接失败错误
    pub fn connect_failed(
        target: impl Into<String>,
        mode: impl Into<String>,
        source: io::Error,
    ) -> Self {
        Self::Connect {
            target: target.into(),
            mode: mode.into(),
            source,
        }
    }

    /// 创建转发错误
    pub fn forward(msg: impl Into<String>) -> Self {
        Self::Forward(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }

    pub fn is_connect_failed(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    /// 对端正常断开（复位、管道破裂、提前 EOF）属于良性情况，只需低级别日志
    pub fn is_benign_disconnect(&self) -> bool {
        match self {
            Self::Relay(e) | Self::Io(e) => is_benign_io_error(e),
            _ => false,
        }
    }
}

/// 判断 I/O 错误是否为对端断开导致
pub fn is_benign_io_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
