use super::ServerState;
use crate::counter::{CounterSnapshot, HumanCounter};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// `/stats` 的响应内容
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub raw: CounterSnapshot,
    pub human: HumanCounter,
    pub active_tunnels: usize,
    pub active_connections: usize,
}

impl StatusReport {
    pub fn collect(state: &ServerState) -> Self {
        let raw = state.counter.snapshot();
        Self {
            human: raw.human_readable(),
            raw,
            active_tunnels: state.registry.len(),
            active_connections: state.active_connections(),
        }
    }
}

/// 启动状态查询 HTTP 服务器
pub async fn start_status_server(
    addr: &str,
    port: u16,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let bind_addr = if addr.contains(':') {
        format!("[{}]:{}", addr, port)
    } else {
        format!("{}:{}", addr, port)
    };
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind status server to {}", bind_addr))?;

    info!("Status server listening on http://{}", bind_addr);

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((mut stream, addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        handle_status_request(&mut stream, addr, &state).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept status connection: {}", e);
                }
            },
            _ = shutdown.cancelled() => {
                debug!("Status server stopped");
                return Ok(());
            }
        }
    }
}

/// 处理单个状态查询请求
async fn handle_status_request(stream: &mut TcpStream, addr: SocketAddr, state: &ServerState) {
    let mut buffer = vec![0u8; 4096];
    let n = match stream.read(&mut buffer).await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to read from status client {}: {}", addr, e);
            return;
        }
    };

    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = render(path, state);
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response to {}: {}", addr, e);
    }
}

/// 按路径生成完整的 HTTP 响应
fn render(path: &str, state: &ServerState) -> String {
    let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');

    let json = match path {
        "/tunnels" => {
            let tunnels: BTreeMap<u64, String> = state.registry.snapshot();
            serde_json::to_string_pretty(&tunnels)
        }
        "/stats" => serde_json::to_string_pretty(&StatusReport::collect(state)),
        _ => {
            let body = "404 Not Found";
            return format!(
                "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
        }
    };

    let json = json.unwrap_or_default();
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        json.len(),
        json
    )
}
