//! Common utilities for integration tests
#![allow(dead_code)]

use relay_proxy::config::AppConfig;
use relay_proxy::server::{ProxyServer, ServerState};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Unique temporary directory, removed on drop
pub struct TempRoot {
    pub path: PathBuf,
}

impl TempRoot {
    pub fn new(label: &str) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
        let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

        Self {
            path: std::env::temp_dir().join(format!("relay-proxy-{}-{}", label, unique_id)),
        }
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Proxy configuration for tests: ephemeral port, short timeouts
pub fn test_config(root: &TempRoot) -> AppConfig {
    let mut config = AppConfig::default();
    config.root_dir = root.path.to_string_lossy().into_owned();
    config.proxy.listen_addr = "127.0.0.1".to_string();
    config.proxy.listen_port = 0;
    config.proxy.header_timeout_secs = 5;
    config.proxy.connect_timeout_secs = 5;
    config.proxy.drain_timeout_secs = 1;
    config
}

/// A running proxy instance
pub struct TestProxy {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

impl TestProxy {
    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr)
            .await
            .expect("Failed to connect to proxy")
    }

    /// Stop accepting and wait for the server loop to return
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(15), self.handle)
            .await
            .expect("Proxy did not stop in time")
            .expect("Proxy task panicked")
    }
}

pub async fn start_proxy(config: AppConfig) -> TestProxy {
    let state = Arc::new(ServerState::new(config).expect("Failed to create server state"));
    let server = ProxyServer::bind(Arc::clone(&state))
        .await
        .expect("Failed to bind proxy");
    let addr = server.local_addr().expect("Failed to get proxy addr");
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(shutdown.clone()));

    TestProxy {
        addr,
        state,
        shutdown,
        handle,
    }
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> u16 {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break, // Connection closed
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    port
}

/// Read a request head plus its Content-Length body
async fn read_http_request(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while data.len() < head_end + content_length {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Some(data)
}

/// HTTP server that records each request and answers with a canned response
pub async fn start_http_upstream(response: &'static [u8]) -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind HTTP upstream");
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(request) = read_http_request(&mut socket).await {
                    let _ = tx.send(request);
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });

    (port, rx)
}

/// What a fake SOCKS5 upstream saw during negotiation
#[derive(Debug, Clone, Default)]
pub struct Socks5Handshake {
    pub user: String,
    pub password: String,
    pub target: String,
}

/// Minimal SOCKS5 server; when `accept` is false the CONNECT is refused.
/// Accepted connections echo everything back.
pub async fn start_socks5_upstream(
    accept: bool,
) -> (u16, mpsc::UnboundedReceiver<Socks5Handshake>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind SOCKS5 upstream");
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = serve_socks5(socket, accept, tx).await;
            });
        }
    });

    (port, rx)
}

async fn serve_socks5(
    mut socket: TcpStream,
    accept: bool,
    tx: mpsc::UnboundedSender<Socks5Handshake>,
) -> std::io::Result<()> {
    let mut handshake = Socks5Handshake::default();

    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    let mut methods = vec![0u8; header[1] as usize];
    socket.read_exact(&mut methods).await?;

    if methods.contains(&0x02) {
        socket.write_all(&[0x05, 0x02]).await?;
        let mut ver_ulen = [0u8; 2];
        socket.read_exact(&mut ver_ulen).await?;
        let mut user = vec![0u8; ver_ulen[1] as usize];
        socket.read_exact(&mut user).await?;
        let mut plen = [0u8; 1];
        socket.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        socket.read_exact(&mut password).await?;
        handshake.user = String::from_utf8_lossy(&user).to_string();
        handshake.password = String::from_utf8_lossy(&password).to_string();
        socket.write_all(&[0x01, 0x00]).await?;
    } else {
        socket.write_all(&[0x05, 0x00]).await?;
    }

    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            socket.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        _ => {
            let mut ip = [0u8; 16];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
    };
    let mut port = [0u8; 2];
    socket.read_exact(&mut port).await?;
    handshake.target = format!("{}:{}", host, u16::from_be_bytes(port));
    let _ = tx.send(handshake);

    let reply = if accept { 0x00 } else { 0x05 };
    socket
        .write_all(&[0x05, reply, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    if !accept {
        return Ok(());
    }

    let mut buf = vec![0u8; 8192];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        socket.write_all(&buf[..n]).await?;
    }
}

/// Send a CONNECT and read back exactly the success response
pub async fn open_tunnel(proxy: &TestProxy, target: &str) -> TcpStream {
    let mut stream = proxy.connect().await;
    stream
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).as_bytes())
        .await
        .unwrap();

    let mut response = vec![0u8; relay_proxy::CONNECT_ESTABLISHED.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut response))
        .await
        .expect("Timeout waiting for CONNECT response")
        .expect("Failed to read CONNECT response");
    assert_eq!(response, relay_proxy::CONNECT_ESTABLISHED);
    stream
}

/// Read until the peer closes (a reset counts as closed)
pub async fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("Timeout waiting for connection close")
        {
            Ok(0) | Err(_) => return data,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    }
}

/// Poll until `predicate` holds or the deadline passes
pub async fn wait_until(mut predicate: impl FnMut() -> bool, max_wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}
