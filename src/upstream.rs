//! Outbound connections to a destination, directly or through an upstream proxy
use base64::Engine as _;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, warn};

use crate::config::{OutputProxyConfig, OutputProxyKind};
use crate::error::{ProxyError, Result};

/// TCP keepalive 首次探测时间
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
/// TCP keepalive 探测间隔
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// 上游 HTTP 代理响应头的最大长度
const MAX_CONNECT_RESPONSE: usize = 8192;

/// 上游代理认证信息
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"****")
            .finish()
    }
}

/// 出站连接方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// 直接连接目标
    Direct,
    /// 经由 HTTP 代理（CONNECT 方法）
    Http {
        host: String,
        port: u16,
        credentials: Option<Credentials>,
    },
    /// 经由 SOCKS4 代理
    Socks4 {
        host: String,
        port: u16,
        user_id: Option<String>,
    },
    /// 经由 SOCKS5 代理
    Socks5 {
        host: String,
        port: u16,
        credentials: Option<Credentials>,
    },
}

impl Upstream {
    /// 根据配置选择连接方式；未启用时直连
    pub fn from_config(config: &OutputProxyConfig) -> Self {
        if !config.is_active() {
            return Upstream::Direct;
        }

        let credentials = if config.user.is_empty() && config.password.is_empty() {
            None
        } else {
            Some(Credentials {
                user: config.user.clone(),
                password: config.password.clone(),
            })
        };

        match config.kind {
            OutputProxyKind::None => Upstream::Direct,
            OutputProxyKind::Http => Upstream::Http {
                host: config.host.clone(),
                port: config.port,
                credentials,
            },
            OutputProxyKind::Socks4 => Upstream::Socks4 {
                host: config.host.clone(),
                port: config.port,
                user_id: (!config.user.is_empty()).then(|| config.user.clone()),
            },
            OutputProxyKind::Socks5 => Upstream::Socks5 {
                host: config.host.clone(),
                port: config.port,
                credentials,
            },
        }
    }

    /// 用于日志的模式描述（不含密码）
    pub fn mode(&self) -> String {
        match self {
            Upstream::Direct => "direct".to_string(),
            Upstream::Http { host, port, .. } => format!("http {}", authority(host, *port)),
            Upstream::Socks4 { host, port, .. } => format!("socks4 {}", authority(host, *port)),
            Upstream::Socks5 { host, port, .. } => format!("socks5 {}", authority(host, *port)),
        }
    }

    /// 连接到目标 host:port，整个过程（含上游协商）受 `timeout` 限制
    pub async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
        let target = authority(host, port);
        debug!("Connecting to {} ({})", target, self.mode());

        let result = match tokio::time::timeout(timeout, self.connect_inner(host, port)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", timeout),
            )),
        };

        result.map_err(|e| ProxyError::connect_failed(target, self.mode(), e))
    }

    async fn connect_inner(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        match self {
            Upstream::Direct => open_tcp(host, port).await,
            Upstream::Http {
                host: proxy_host,
                port: proxy_port,
                credentials,
            } => {
                let mut stream = open_tcp(proxy_host, *proxy_port).await?;
                http_connect(&mut stream, host, port, credentials.as_ref()).await?;
                Ok(stream)
            }
            Upstream::Socks4 {
                host: proxy_host,
                port: proxy_port,
                user_id,
            } => {
                let socket = open_tcp(proxy_host, *proxy_port).await?;
                let stream = match user_id {
                    Some(user_id) => {
                        Socks4Stream::connect_with_userid_and_socket(socket, (host, port), user_id)
                            .await
                    }
                    None => Socks4Stream::connect_with_socket(socket, (host, port)).await,
                }
                .map_err(socks_error)?;
                Ok(stream.into_inner())
            }
            Upstream::Socks5 {
                host: proxy_host,
                port: proxy_port,
                credentials,
            } => {
                let socket = open_tcp(proxy_host, *proxy_port).await?;
                let stream = match credentials {
                    Some(creds) => {
                        Socks5Stream::connect_with_password_and_socket(
                            socket,
                            (host, port),
                            &creds.user,
                            &creds.password,
                        )
                        .await
                    }
                    None => Socks5Stream::connect_with_socket(socket, (host, port)).await,
                }
                .map_err(socks_error)?;
                Ok(stream.into_inner())
            }
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mode())
    }
}

/// 组合 host:port，IPv6 字面量加方括号
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn socks_error(err: tokio_socks::Error) -> io::Error {
    match err {
        tokio_socks::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::ConnectionRefused, other),
    }
}

async fn open_tcp(host: &str, port: u16) -> io::Result<TcpStream> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let stream = TcpStream::connect((host, port)).await?;
    tune_socket(&stream);
    Ok(stream)
}

/// 关闭 Nagle 并开启 TCP keepalive
pub fn tune_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

/// 通过上游 HTTP 代理建立 CONNECT 隧道
async fn http_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> io::Result<()> {
    let target = authority(host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(creds) = credentials {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", creds.user, creds.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // 逐字节读取，避免吞掉隧道建立后的数据
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upstream CONNECT response too large",
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed during CONNECT",
            ));
        }
        head.push(byte[0]);
    }

    let status = parse_status_code(&head)?;
    if !(200..300).contains(&status) {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("upstream proxy rejected CONNECT with status {}", status),
        ));
    }
    Ok(())
}

fn parse_status_code(head: &[u8]) -> io::Result<u16> {
    let text = String::from_utf8_lossy(head);
    let status_line = text.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid upstream status line: {}", status_line),
        ));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid upstream status line: {}", status_line),
            )
        })
}
