//! Parsing of the proxy request head read from a client connection
use bytes::Bytes;
use http::Method;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

/// 请求头部分的最大长度
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 4096;

/// 保持顺序、大小写不敏感的头部列表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// 第一个匹配的值
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 删除所有同名头部，返回删除的数量
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 从客户端解析出的代理请求
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// 完整 URL；CONNECT 请求为 host:port
    pub url: String,
    pub version: String,
    pub headers: HeaderList,
    /// 请求体长度（Content-Length，缺省为 0）
    pub content_length: u64,
    /// 与请求头一起读入的后续字节（请求体开头或 CONNECT 后的管道数据）
    pub body_prefix: Bytes,
    /// 客户端地址
    pub source: SocketAddr,
    /// 客户端连接到的本地地址
    pub local: SocketAddr,
    /// 目标主机（IPv6 不带方括号）
    pub dest_host: String,
    pub dest_port: u16,
}

impl ProxyRequest {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// 目标 host:port
    pub fn destination(&self) -> String {
        crate::upstream::authority(&self.dest_host, self.dest_port)
    }
}

impl fmt::Display for ProxyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} from {}", self.method, self.url, self.version, self.source)
    }
}

/// 读取并解析请求头，超时或格式错误均视为解析失败
pub async fn read_request<R>(
    reader: &mut R,
    source: SocketAddr,
    local: SocketAddr,
    timeout: Duration,
) -> Result<ProxyRequest>
where
    R: AsyncRead + Unpin,
{
    let (head, rest) = tokio::time::timeout(timeout, read_head(reader))
        .await
        .map_err(|_| ProxyError::parse(format!("timed out reading request head after {:?}", timeout)))??;

    parse_head(&head, Bytes::from(rest), source, local)
}

/// 读取到第一个空行，返回 (头部, 剩余字节)
async fn read_head<R>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut scanned = 0;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client closed before sending a request",
                )));
            }
            return Err(ProxyError::parse("unexpected EOF while reading request head"));
        }
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buffer, scanned) {
            let rest = buffer.split_off(end);
            return Ok((buffer, rest));
        }
        scanned = buffer.len().saturating_sub(3);

        if buffer.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::parse("request head too large"));
        }
    }
}

fn find_head_end(buffer: &[u8], from: usize) -> Option<usize> {
    buffer[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| from + pos + 4)
}

/// 解析请求头（请求行 + 头部行）
pub fn parse_head(
    head: &[u8],
    body_prefix: Bytes,
    source: SocketAddr,
    local: SocketAddr,
) -> Result<ProxyRequest> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::parse("request head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split(' ').filter(|p| !p.is_empty()).collect();
    if parts.len() != 3 {
        return Err(ProxyError::parse(format!(
            "invalid request line: {:?}",
            request_line
        )));
    }

    let method = Method::from_bytes(parts[0].as_bytes())
        .map_err(|_| ProxyError::parse(format!("invalid method: {}", parts[0])))?;
    let target = parts[1];
    let version = parts[2];
    if !version.starts_with("HTTP/1.") {
        return Err(ProxyError::parse(format!("unsupported version: {}", version)));
    }

    let mut headers = HeaderList::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::parse(format!("invalid header line: {:?}", line)))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ProxyError::parse(format!("invalid header name: {:?}", name)));
        }
        headers.push(name, value.trim());
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| ProxyError::parse(format!("invalid Content-Length: {}", value)))?,
        None => 0,
    };

    if let Some(encoding) = headers.get("transfer-encoding") {
        if encoding.to_ascii_lowercase().contains("chunked") {
            return Err(ProxyError::parse("chunked request bodies are not supported"));
        }
    }

    let (url, dest_host, dest_port) = if method == Method::CONNECT {
        let (host, port) = split_authority(target)?;
        (target.to_string(), host, port)
    } else {
        resolve_target(target, &headers)?
    };

    Ok(ProxyRequest {
        method,
        url,
        version: version.to_string(),
        headers,
        content_length,
        body_prefix,
        source,
        local,
        dest_host,
        dest_port,
    })
}

/// 解析 CONNECT 的 host:port（支持 [v6]:port）
pub fn split_authority(authority: &str) -> Result<(String, u16)> {
    let invalid = || ProxyError::parse(format!("invalid CONNECT target: {}", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        authority.rsplit_once(':').ok_or_else(invalid)?
    };

    if host.is_empty() || (host.contains(':') && !authority.starts_with('[')) {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// 绝对 URL 直接使用；origin-form 时借助 Host 头补全
fn resolve_target(target: &str, headers: &HeaderList) -> Result<(String, String, u16)> {
    let full = if target.starts_with('/') {
        let host = headers
            .get("host")
            .ok_or_else(|| ProxyError::parse("relative request target without Host header"))?;
        format!("http://{}{}", host, target)
    } else {
        target.to_string()
    };

    let url = url::Url::parse(&full)
        .map_err(|e| ProxyError::parse(format!("invalid URL {}: {}", target, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProxyError::parse(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::parse(format!("URL has no host: {}", target)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProxyError::parse(format!("URL has no port: {}", target)))?;

    Ok((full, host, port))
}
