//! Forwarding of plain (non-CONNECT) HTTP requests
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, Version};
use hyper::ext::ReasonPhrase;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::ListenerConfig;
use crate::counter::TransferCounter;
use crate::error::{ProxyError, Result};
use crate::request::{HeaderList, ProxyRequest};

/// 响应体分块大小
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// 只对客户端到代理这一跳有效、不转发给目标服务器的头部
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
];

/// HTTP 转发器，所有连接共享同一个出站客户端
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    counter: Arc<TransferCounter>,
}

impl Forwarder {
    pub fn new(config: &ListenerConfig, counter: Arc<TransferCounter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .connect_timeout(config.connect_timeout())
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| ProxyError::config_error(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, counter })
    }

    /// 转发请求并把响应写回客户端
    ///
    /// `body` 是客户端连接的读端，用于读取 `body_prefix` 之后剩余的请求体。
    pub async fn forward<R, W>(&self, mut request: ProxyRequest, body: R, writer: &mut W) -> Result<u64>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Unpin,
    {
        if request.headers.remove("expect") > 0 {
            debug!("Removed Expect header from {}", request.url);
        }
        strip_hop_by_hop(&mut request.headers);

        let headers = build_header_map(&request)?;
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str())
            .headers(headers);

        let content_length = request.content_length;
        if content_length > 0 {
            let prefix_len = request.body_prefix.len().min(content_length as usize);
            let prefix = request.body_prefix.slice(..prefix_len);
            let remaining = content_length - prefix_len as u64;
            let reader = Cursor::new(prefix).chain(body.take(remaining));
            builder = builder.body(reqwest::Body::wrap_stream(ReaderStream::with_capacity(
                reader,
                BODY_CHUNK_SIZE,
            )));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::forward(format!("{} {}: {}", request.method, request.url, e)))?;
        self.counter.increment_client_bytes(content_length);

        debug!(
            "{} {} -> {} {}",
            request.method,
            request.url,
            response.status().as_u16(),
            response.status().canonical_reason().unwrap_or("")
        );

        write_response(writer, response, &self.counter).await
    }
}

/// 删除逐跳头部以及 Connection 中列出的头部，返回删除的数量
pub fn strip_hop_by_hop(headers: &mut HeaderList) -> usize {
    let listed: Vec<String> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty() && token != "content-length" && token != "host")
        .collect();

    HOP_BY_HOP_HEADERS
        .iter()
        .copied()
        .chain(listed.iter().map(String::as_str))
        .map(|name| headers.remove(name))
        .sum()
}

/// 把客户端头部转换为出站请求头，保留重复项
fn build_header_map(request: &ProxyRequest) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(request.headers.len());
    for (name, value) in request.headers.iter() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProxyError::forward(format!("invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProxyError::forward(format!("invalid value for header {}", name)))?;
        headers.append(name, value);
    }
    if request.content_length == 0 {
        headers.remove(CONTENT_LENGTH);
    }
    Ok(headers)
}

/// 从响应头读取 Content-Length
fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// 按固定顺序序列化响应头：状态行、Content-Type、Content-Length、其余头部、空行
pub fn serialize_head(
    version: Version,
    status: StatusCode,
    reason: &[u8],
    headers: &HeaderMap,
    content_length: Option<u64>,
) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("{:?} {} ", version, status.as_u16()).as_bytes());
    head.extend_from_slice(reason);
    head.extend_from_slice(b"\r\n");

    if let Some(content_type) = headers.get(CONTENT_TYPE) {
        if !content_type.is_empty() {
            head.extend_from_slice(b"Content-Type: ");
            head.extend_from_slice(content_type.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
    }

    if let Some(len) = content_length.filter(|len| *len > 0) {
        head.extend_from_slice(format!("Content-Length: {}\r\n", len).as_bytes());
    }

    for (name, value) in headers {
        if name == CONTENT_TYPE || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    head.extend_from_slice(b"\r\n");
    head
}

/// 写出响应头和响应体，返回写出的响应体字节数
///
/// 声明了 Content-Length 时恰好转发该长度；未声明时转发到上游结束为止。
pub async fn write_response<W>(
    writer: &mut W,
    mut response: reqwest::Response,
    counter: &TransferCounter,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let content_length = declared_length(response.headers());
    let head = serialize_head(
        response.version(),
        response.status(),
        reason_phrase(&response),
        response.headers(),
        content_length,
    );
    writer.write_all(&head).await?;
    writer.flush().await?;

    if content_length == Some(0) {
        return Ok(0);
    }

    let mut sent = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ProxyError::forward(format!("failed to read response body: {}", e)))?
    {
        let chunk = match content_length {
            Some(len) => clamp(chunk, len - sent),
            None => chunk,
        };

        for piece in chunk.chunks(BODY_CHUNK_SIZE) {
            writer.write_all(piece).await?;
            writer.flush().await?;
        }
        sent += chunk.len() as u64;
        counter.increment_server_bytes(chunk.len() as u64);

        if content_length.is_some_and(|len| sent >= len) {
            break;
        }
    }

    if let Some(len) = content_length {
        if sent < len {
            debug!("Upstream body ended early: {} of {} bytes", sent, len);
        }
    }
    Ok(sent)
}

/// 上游返回的原始状态描述；与标准描述相同时 hyper 不保留，回退到标准描述
fn reason_phrase(response: &reqwest::Response) -> &[u8] {
    match response.extensions().get::<ReasonPhrase>() {
        Some(reason) => reason.as_bytes(),
        None => response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .as_bytes(),
    }
}

fn clamp(chunk: Bytes, remaining: u64) -> Bytes {
    if chunk.len() as u64 > remaining {
        chunk.slice(..remaining as usize)
    } else {
        chunk
    }
}
