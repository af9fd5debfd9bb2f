mod status;

pub use status::{start_status_server, StatusReport};

use crate::config::AppConfig;
use crate::counter::TransferCounter;
use crate::error::{ProxyError, Result as ProxyResult};
use crate::forwarder::Forwarder;
use crate::registry::TunnelRegistry;
use crate::request::read_request;
use crate::security::{HostPolicy, PermitAll, SecurityPolicy};
use crate::tunnel::TunnelEngine;
use crate::upstream::{tune_socket, Upstream};
use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// accept 出错后的等待时间
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// 文件描述符耗尽时的最长退避时间
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(2);
/// EMFILE / ENFILE（Linux、BSD、macOS 取值相同）
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;
/// 强制关闭后等待连接任务退出的时间
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// 服务器依赖（用于依赖注入）
pub struct ServerDependencies {
    pub counter: Option<Arc<TransferCounter>>,
    pub registry: Arc<TunnelRegistry>,
    pub policy: Option<Arc<dyn SecurityPolicy>>,
}

impl ServerDependencies {
    pub fn new() -> Self {
        Self {
            counter: None,
            registry: Arc::new(TunnelRegistry::new()),
            policy: None,
        }
    }
}

impl Default for ServerDependencies {
    fn default() -> Self {
        Self::new()
    }
}

/// 监听器共享状态，启动时创建并以句柄传给每个连接任务
pub struct ServerState {
    pub config: Arc<AppConfig>,
    pub counter: Arc<TransferCounter>,
    pub registry: Arc<TunnelRegistry>,
    pub policy: Arc<dyn SecurityPolicy>,
    pub upstream: Arc<Upstream>,
    forwarder: Forwarder,
    tunnels: TunnelEngine,
    limiter: Arc<Semaphore>,
    connection_seq: AtomicU64,
}

impl ServerState {
    /// 从配置创建状态（使用默认依赖）
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_dependencies(config, ServerDependencies::new())
    }

    /// 从配置和依赖创建状态
    pub fn with_dependencies(config: AppConfig, deps: ServerDependencies) -> Result<Self> {
        let counter = deps.counter.unwrap_or_else(|| {
            Arc::new(TransferCounter::open(
                config.proxy.listen_port,
                config.root_path(),
            ))
        });

        let policy = deps.policy.unwrap_or_else(|| {
            let host_policy = HostPolicy::from_config(&config.security);
            if host_policy.is_empty() {
                Arc::new(PermitAll) as Arc<dyn SecurityPolicy>
            } else {
                Arc::new(host_policy)
            }
        });

        let upstream = Arc::new(Upstream::from_config(&config.output_proxy));
        let forwarder = Forwarder::new(&config.proxy, Arc::clone(&counter))
            .context("Failed to create HTTP forwarder")?;
        let tunnels = TunnelEngine::new(
            Arc::clone(&upstream),
            Arc::clone(&deps.registry),
            Arc::clone(&counter),
            config.proxy.connect_timeout(),
        );
        let limiter = Arc::new(Semaphore::new(config.proxy.max_connections));

        Ok(Self {
            config: Arc::new(config),
            counter,
            registry: deps.registry,
            policy,
            upstream,
            forwarder,
            tunnels,
            limiter,
            connection_seq: AtomicU64::new(0),
        })
    }

    /// 分配新的连接 id
    pub fn next_connection_id(&self) -> u64 {
        self.connection_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 当前正在处理的连接数
    pub fn active_connections(&self) -> usize {
        self.config
            .proxy
            .max_connections
            .saturating_sub(self.limiter.available_permits())
    }
}

/// 已绑定监听端口的代理服务器
pub struct ProxyServer {
    state: Arc<ServerState>,
    listener: TcpListener,
}

impl ProxyServer {
    /// 绑定监听地址，失败是唯一的致命错误
    pub async fn bind(state: Arc<ServerState>) -> Result<Self> {
        let bind_addr = state.config.proxy.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind proxy listener to {}", bind_addr))?;
        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// 接受连接直到 `shutdown` 被取消，然后等待在途连接结束
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self { state, listener } = self;
        let max_connections = state.config.proxy.max_connections;
        let force_close = CancellationToken::new();

        info!(
            "Proxy listening on {} (max {} concurrent connections, upstream: {})",
            listener.local_addr()?,
            max_connections,
            state.upstream
        );

        // 绑定成功后 accept 错误都可恢复，只有 shutdown 结束循环
        let mut consecutive_errors = 0u32;
        loop {
            // 先获取许可再 accept，超出上限的客户端留在系统 backlog 中
            let permit = tokio::select! {
                permit = Arc::clone(&state.limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let (stream, peer) = tokio::select! {
                result = listener.accept() => match result {
                    Ok(accepted) => {
                        consecutive_errors = 0;
                        accepted
                    }
                    Err(e) => {
                        drop(permit);
                        let delay = accept_backoff(&e, consecutive_errors);
                        consecutive_errors = consecutive_errors.saturating_add(1);
                        if is_resource_exhausted(&e) {
                            error!("Failed to accept connection: {} (retrying in {:?})", e, delay);
                        } else {
                            warn!("Failed to accept connection: {}", e);
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = shutdown.cancelled() => break,
                        }
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            let id = state.next_connection_id();
            let state = Arc::clone(&state);
            let force_close = force_close.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(&state, id, stream, peer, &force_close).await {
                    log_connection_error(id, peer, &e);
                }
            });
        }

        drop(listener);
        info!("Proxy listener stopped, draining connections");
        drain(&state, &force_close).await;
        Ok(())
    }
}

/// 等待在途连接结束，超时后强制关闭
async fn drain(state: &ServerState, force_close: &CancellationToken) {
    let max = u32::try_from(state.config.proxy.max_connections).unwrap_or(u32::MAX);
    let active = state.active_connections();
    if active == 0 {
        return;
    }

    let timeout = state.config.proxy.drain_timeout();
    info!("Waiting up to {:?} for {} active connections", timeout, active);
    if tokio::time::timeout(timeout, state.limiter.acquire_many(max))
        .await
        .is_ok()
    {
        info!("All connections finished");
        return;
    }

    warn!(
        "{} connections still active after {:?}, force closing",
        state.active_connections(),
        timeout
    );
    force_close.cancel();
    if tokio::time::timeout(FORCE_CLOSE_GRACE, state.limiter.acquire_many(max))
        .await
        .is_err()
    {
        warn!(
            "{} connections did not exit after force close",
            state.active_connections()
        );
    }
}

/// 描述符或内存耗尽，需要等其他连接释放资源
fn is_resource_exhausted(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(EMFILE) | Some(ENFILE))
        || err.kind() == io::ErrorKind::OutOfMemory
}

/// accept 失败后的等待时间；资源耗尽时按连续失败次数指数退避
fn accept_backoff(err: &io::Error, consecutive_errors: u32) -> Duration {
    if !is_resource_exhausted(err) {
        return ACCEPT_RETRY_DELAY;
    }
    ACCEPT_RETRY_DELAY
        .saturating_mul(1u32 << consecutive_errors.min(5))
        .min(MAX_ACCEPT_BACKOFF)
}

fn log_connection_error(id: u64, peer: SocketAddr, err: &ProxyError) {
    if err.is_benign_disconnect() {
        debug!("Connection {} from {} closed: {}", id, peer, err);
    } else {
        warn!("Connection {} from {} failed: {}", id, peer, err);
    }
}

/// 处理单个客户端连接：解析、安全检查、分派
async fn handle_connection(
    state: &ServerState,
    id: u64,
    mut stream: TcpStream,
    peer: SocketAddr,
    force_close: &CancellationToken,
) -> ProxyResult<()> {
    tune_socket(&stream);
    let local = stream.local_addr()?;

    let request = tokio::select! {
        result = read_request(&mut stream, peer, local, state.config.proxy.header_timeout()) => result?,
        _ = force_close.cancelled() => {
            debug!("Connection {} force-closed while reading request", id);
            return Ok(());
        }
    };
    debug!("Connection {}: {}", id, request);

    let decision = state.policy.decide(&request);
    if !decision.permitted {
        info!(
            "Connection {}: {} {} denied: {}{}",
            id,
            request.method,
            request.destination(),
            decision.reason,
            if state.config.security.enforce {
                ""
            } else {
                " (not enforced)"
            }
        );
        if state.config.security.enforce {
            return Ok(());
        }
    }

    if request.is_connect() {
        state.tunnels.run(id, stream, request, force_close).await?;
        return Ok(());
    }

    let (reader, mut writer) = stream.into_split();
    tokio::select! {
        result = state.forwarder.forward(request, reader, &mut writer) => {
            result?;
        }
        _ = force_close.cancelled() => {
            debug!("Connection {} force-closed on shutdown", id);
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// 运行代理：绑定监听、启动计数器落盘和状态服务，直到收到 Ctrl+C
pub async fn run_server(config: AppConfig) -> Result<()> {
    let state = Arc::new(ServerState::new(config)?);
    let shutdown = CancellationToken::new();

    let server = ProxyServer::bind(Arc::clone(&state)).await?;

    let flusher = Arc::clone(&state.counter)
        .spawn_flusher(state.config.counter.flush_interval(), shutdown.clone());

    if let Some(status_port) = state.config.status.port {
        let status_addr = state.config.status.addr.clone();
        let status_state = Arc::clone(&state);
        let status_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) =
                start_status_server(&status_addr, status_port, status_state, status_shutdown).await
            {
                error!("Status server error: {}", e);
            }
        });
    }

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, stopping proxy..."),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_shutdown.cancel();
    });

    info!("Waiting for client connections... (Press Ctrl+C to stop)");
    let result = server.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = flusher.await {
        warn!("Counter flusher task failed: {}", e);
    }

    info!("Proxy stopped");
    result
}
