//! Listener behaviour when the process runs out of file descriptors
//!
//! Lowering RLIMIT_NOFILE affects the whole test binary, so this file holds a
//! single test.
#![cfg(unix)]

mod common;

use common::{open_tunnel, start_echo_server, start_proxy, test_config, wait_until, TempRoot};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

/// Restores the original open-file limit on drop
struct OpenFilesLimit {
    original: libc::rlimit,
}

impl OpenFilesLimit {
    fn lower_to(soft: libc::rlim_t) -> Self {
        let mut original = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(
            unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut original) },
            0
        );
        let lowered = libc::rlimit {
            rlim_cur: soft.min(original.rlim_max),
            rlim_max: original.rlim_max,
        };
        assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lowered) }, 0);
        Self { original }
    }
}

impl Drop for OpenFilesLimit {
    fn drop(&mut self) {
        unsafe {
            libc::setrlimit(libc::RLIMIT_NOFILE, &self.original);
        }
    }
}

#[tokio::test]
async fn test_listener_recovers_from_fd_exhaustion() {
    let root = TempRoot::new("emfile");
    let echo_port = start_echo_server().await;
    let mut config = test_config(&root);
    config.proxy.max_connections = 10_000;
    let proxy = start_proxy(config).await;

    let limit = OpenFilesLimit::lower_to(256);

    // 预留一个 socket，描述符耗尽后仍能发起连接，让监听端 accept 遇到 EMFILE
    let reserved = TcpSocket::new_v4().expect("Failed to reserve socket");

    let mut clients = Vec::new();
    for _ in 0..2000 {
        match tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(proxy.addr)).await {
            Ok(Ok(stream)) => clients.push(stream),
            _ => break,
        }
    }
    assert!(clients.len() < 2000, "file descriptors were never exhausted");

    let pending = tokio::time::timeout(Duration::from_secs(2), reserved.connect(proxy.addr))
        .await
        .expect("Timeout connecting reserved socket")
        .expect("Failed to connect reserved socket");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !proxy.handle.is_finished(),
        "accept loop must survive descriptor exhaustion"
    );

    drop(pending);
    drop(clients);
    let state = std::sync::Arc::clone(&proxy.state);
    assert!(wait_until(|| state.active_connections() == 0, Duration::from_secs(10)).await);

    // 描述符释放后仍能正常建立隧道
    let mut client = open_tunnel(&proxy, &format!("127.0.0.1:{}", echo_port)).await;
    client.write_all(b"still alive").await.unwrap();
    let mut buf = [0u8; 11];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("Timeout waiting for echo")
        .unwrap();
    assert_eq!(&buf, b"still alive");
    drop(client);

    drop(limit);
    assert!(!proxy.handle.is_finished());
    proxy.stop().await.unwrap();
}
