//! CONNECT tunnels: handshake, bidirectional relay and teardown
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::counter::{format_bytes, TransferCounter};
use crate::error::{is_benign_io_error, ProxyError, Result};
use crate::registry::TunnelRegistry;
use crate::request::ProxyRequest;
use crate::upstream::{authority, Upstream};

/// CONNECT 成功后发给客户端的响应
pub const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\nConnection: close\r\n\r\n";

/// 每个方向的复制缓冲区大小
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// 隧道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    Connecting,
    Established,
    Relaying,
    Closed,
    Failed,
}

impl TunnelState {
    /// 是否允许从当前状态转换到 `next`
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Connecting, Established)
                | (Connecting, Failed)
                | (Established, Relaying)
                | (Relaying, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Connecting => "connecting",
            TunnelState::Established => "established",
            TunnelState::Relaying => "relaying",
            TunnelState::Closed => "closed",
            TunnelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 转发方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("client->server"),
            Direction::ServerToClient => f.write_str("server->client"),
        }
    }
}

/// 一条已建立的 CONNECT 隧道
#[derive(Debug)]
pub struct Tunnel {
    id: u64,
    source: SocketAddr,
    server_addr: Option<SocketAddr>,
    dest_host: String,
    dest_port: u16,
    started_at: Instant,
    client_bytes: AtomicU64,
    server_bytes: AtomicU64,
    active: watch::Sender<bool>,
    counter: Arc<TransferCounter>,
}

impl Tunnel {
    pub fn new(
        id: u64,
        source: SocketAddr,
        server_addr: Option<SocketAddr>,
        dest_host: String,
        dest_port: u16,
        counter: Arc<TransferCounter>,
    ) -> Self {
        let (active, _) = watch::channel(true);
        Self {
            id,
            source,
            server_addr,
            dest_host,
            dest_port,
            started_at: Instant::now(),
            client_bytes: AtomicU64::new(0),
            server_bytes: AtomicU64::new(0),
            active,
            counter,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn destination(&self) -> String {
        authority(&self.dest_host, self.dest_port)
    }

    /// 客户端发往目标的字节数
    pub fn client_bytes(&self) -> u64 {
        self.client_bytes.load(Ordering::Relaxed)
    }

    /// 目标发往客户端的字节数
    pub fn server_bytes(&self) -> u64 {
        self.server_bytes.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 两个方向都仍在转发时为 true
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// 标记隧道结束，返回调用前是否仍处于活动状态
    pub fn mark_closed(&self) -> bool {
        self.active.send_replace(false)
    }

    /// 等待隧道变为非活动状态
    pub async fn closed(&self) {
        let mut rx = self.active.subscribe();
        // self 持有 sender，wait_for 不会因 sender 关闭而失败
        let _ = rx.wait_for(|active| !*active).await;
    }

    fn record(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::ClientToServer => {
                self.client_bytes.fetch_add(bytes, Ordering::Relaxed);
                self.counter.increment_client_bytes(bytes);
            }
            Direction::ServerToClient => {
                self.server_bytes.fetch_add(bytes, Ordering::Relaxed);
                self.counter.increment_server_bytes(bytes);
            }
        }
    }

    /// 人类可读的描述，用于注册表快照
    pub fn describe(&self) -> String {
        let via = self
            .server_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} -> {} via {} | sent {} | received {} | {}s{}",
            self.source,
            self.destination(),
            via,
            format_bytes(self.client_bytes() as i64),
            format_bytes(self.server_bytes() as i64),
            self.elapsed().as_secs(),
            if self.is_active() { "" } else { " | closing" }
        )
    }

    /// 拆分两端 socket 并启动两个方向的转发任务
    ///
    /// `pending` 是客户端在收到 200 响应前已发送的数据，先写给目标。
    pub fn start_relay(self: &Arc<Self>, client: TcpStream, server: TcpStream, pending: Bytes) -> Relay {
        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();

        let upstream = tokio::spawn(pump(
            Arc::clone(self),
            Direction::ClientToServer,
            client_read,
            server_write,
            pending,
        ));
        let downstream = tokio::spawn(pump(
            Arc::clone(self),
            Direction::ServerToClient,
            server_read,
            client_write,
            Bytes::new(),
        ));

        Relay {
            tasks: vec![upstream, downstream],
        }
    }
}

/// 正在运行的转发任务；stop 或 drop 时终止剩余方向并关闭两端 socket
#[derive(Debug)]
pub struct Relay {
    tasks: Vec<JoinHandle<()>>,
}

impl Relay {
    /// 终止所有方向并等待任务退出（socket 随任务一起释放）
    pub async fn stop(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn pump<R, W>(
    tunnel: Arc<Tunnel>,
    direction: Direction,
    mut reader: R,
    mut writer: W,
    pending: Bytes,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match copy_counted(&tunnel, direction, &mut reader, &mut writer, pending).await {
        Ok(n) => debug!(
            "Tunnel {}: {} reached end of stream after {} bytes",
            tunnel.id(),
            direction,
            n
        ),
        Err(e) if is_benign_io_error(&e) => {
            debug!("Tunnel {}: {} peer disconnected: {}", tunnel.id(), direction, e)
        }
        Err(e) => warn!(
            "Tunnel {}: {} relay error: {}",
            tunnel.id(),
            direction,
            ProxyError::Relay(e)
        ),
    }
    tunnel.mark_closed();
}

/// 单向复制，每次写入后计入隧道和全局计数器
async fn copy_counted<R, W>(
    tunnel: &Tunnel,
    direction: Direction,
    reader: &mut R,
    writer: &mut W,
    pending: Bytes,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;

    if !pending.is_empty() {
        writer.write_all(&pending).await?;
        total += pending.len() as u64;
        tunnel.record(direction, pending.len() as u64);
    }

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        tunnel.record(direction, n as u64);
    }

    Ok(total)
}

/// CONNECT 处理引擎，持有连接器、注册表和计数器的共享句柄
#[derive(Debug, Clone)]
pub struct TunnelEngine {
    upstream: Arc<Upstream>,
    registry: Arc<TunnelRegistry>,
    counter: Arc<TransferCounter>,
    connect_timeout: Duration,
}

impl TunnelEngine {
    pub fn new(
        upstream: Arc<Upstream>,
        registry: Arc<TunnelRegistry>,
        counter: Arc<TransferCounter>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            upstream,
            registry,
            counter,
            connect_timeout,
        }
    }

    /// 处理一个 CONNECT 请求直到隧道关闭
    ///
    /// 连接目标失败时不向客户端发送任何响应，直接关闭连接。
    /// `force_close` 被取消时立即放弃连接或拆除隧道。
    pub async fn run(
        &self,
        id: u64,
        mut client: TcpStream,
        request: ProxyRequest,
        force_close: &CancellationToken,
    ) -> Result<TunnelState> {
        let mut state = TunnelState::Connecting;
        let destination = request.destination();

        let connect = self
            .upstream
            .connect(&request.dest_host, request.dest_port, self.connect_timeout);
        let server = tokio::select! {
            result = connect => match result {
                Ok(server) => server,
                Err(e) => {
                    transition(id, &mut state, TunnelState::Failed);
                    return Err(e);
                }
            },
            _ = force_close.cancelled() => {
                debug!("Tunnel {} force-closed while connecting to {}", id, destination);
                transition(id, &mut state, TunnelState::Failed);
                return Ok(state);
            }
        };

        if let Err(e) = write_established(&mut client).await {
            transition(id, &mut state, TunnelState::Failed);
            return Err(ProxyError::Relay(e));
        }
        transition(id, &mut state, TunnelState::Established);

        let tunnel = Arc::new(Tunnel::new(
            id,
            request.source,
            server.peer_addr().ok(),
            request.dest_host.clone(),
            request.dest_port,
            Arc::clone(&self.counter),
        ));
        let _guard = self.registry.register(Arc::clone(&tunnel));
        info!(
            "Tunnel {} established: {} -> {} ({})",
            id, request.source, destination, self.upstream
        );

        let relay = tunnel.start_relay(client, server, request.body_prefix);
        transition(id, &mut state, TunnelState::Relaying);

        tokio::select! {
            _ = tunnel.closed() => {}
            _ = force_close.cancelled() => {
                debug!("Tunnel {} force-closed on shutdown", id);
                tunnel.mark_closed();
            }
        }
        relay.stop().await;
        transition(id, &mut state, TunnelState::Closed);

        info!(
            "Tunnel {} closed: {} sent, {} received in {:.1}s",
            id,
            format_bytes(tunnel.client_bytes() as i64),
            format_bytes(tunnel.server_bytes() as i64),
            tunnel.elapsed().as_secs_f64()
        );
        Ok(state)
    }
}

async fn write_established(client: &mut TcpStream) -> std::io::Result<()> {
    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await
}

fn transition(id: u64, state: &mut TunnelState, next: TunnelState) {
    if !state.can_transition_to(next) {
        warn!("Tunnel {}: unexpected state change {} -> {}", id, state, next);
    }
    debug!("Tunnel {}: {} -> {}", id, state, next);
    *state = next;
}
