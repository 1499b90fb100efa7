// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! End-to-end tests of the agent over real loopback sockets.

use std::io::Write;
use std::time::Duration;

use spacey_agent::{
    Agent, AgentError, AgentHandle, AgentOptions, ConnectOptions, FreeInfo, TcpConnection,
    TcpTransport,
};
use tokio::net::TcpListener;

/// Accept connections forever, keeping them open
async fn listen() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            open.push(stream);
        }
    });
    port
}

fn agent(options: AgentOptions) -> AgentHandle<TcpConnection> {
    Agent::spawn(options, TcpTransport::new().with_connect_timeout(Duration::from_secs(5))).unwrap()
}

fn local_port(conn: &mut TcpConnection) -> u16 {
    conn.tcp_mut().unwrap().local_addr().unwrap().port()
}

#[tokio::test]
async fn test_keep_alive_reuses_tcp_connection() {
    let port = listen().await;
    let agent = agent(AgentOptions::keep_alive());

    let mut first = agent.request(ConnectOptions::new("127.0.0.1", port)).await.unwrap();
    let first_port = local_port(&mut first);
    assert_eq!(first.key().as_str(), format!("127.0.0.1:{}:", port));
    first.release();

    let mut second = agent.request(ConnectOptions::new("127.0.0.1", port)).await.unwrap();
    assert!(second.reused());
    assert_eq!(local_port(&mut second), first_port);
    // Idle sockets are unreferenced, handed-out ones are not
    assert!(second.is_referenced());
}

#[tokio::test]
async fn test_endpoints_are_pooled_separately() {
    let (a, b) = (listen().await, listen().await);
    let agent = agent(AgentOptions::keep_alive());

    let first = agent.request(ConnectOptions::new("127.0.0.1", a)).await.unwrap();
    let second = agent.request(ConnectOptions::new("127.0.0.1", b)).await.unwrap();
    first.release();
    second.release();

    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.total_socket_count, 2);
    assert_eq!(stats.endpoint(&format!("127.0.0.1:{}:", a)).free, 1);
    assert_eq!(stats.endpoint(&format!("127.0.0.1:{}:", b)).free, 1);
}

#[tokio::test]
async fn test_total_limit_hands_capacity_to_other_endpoint() {
    let (a, b) = (listen().await, listen().await);
    let options = AgentOptions {
        max_total_sockets: Some(1),
        ..AgentOptions::keep_alive()
    };
    let agent = agent(options);

    let held = agent.request(ConnectOptions::new("127.0.0.1", a)).await.unwrap();
    let pending = agent.enqueue(ConnectOptions::new("127.0.0.1", b)).unwrap();
    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.endpoint(&format!("127.0.0.1:{}:", b)).queued, 1);

    // Closing frees global capacity for the other origin
    drop(held);
    let lease = pending.await.unwrap();
    assert_eq!(lease.key().as_str(), format!("127.0.0.1:{}:", b));
    assert!(!lease.reused());
}

#[tokio::test]
async fn test_keep_alive_hint_zero_closes() {
    let port = listen().await;
    let agent = agent(AgentOptions::keep_alive());

    let lease = agent.request(ConnectOptions::new("127.0.0.1", port)).await.unwrap();
    lease.release_with(FreeInfo::reusable().with_hint("timeout=0"));

    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.total_socket_count, 0);
}

#[tokio::test]
async fn test_legacy_arguments() {
    let port = listen().await;
    let agent = agent(AgentOptions::keep_alive());

    let lease = agent
        .request_legacy("127.0.0.1", Some(port), Some("127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(
        lease.key().as_str(),
        format!("127.0.0.1:{}:127.0.0.1", port)
    );
}

#[tokio::test]
async fn test_connection_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let agent = agent(AgentOptions::keep_alive());

    let err = agent
        .request(ConnectOptions::new("127.0.0.1", port))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Connect { .. }));
}

#[tokio::test]
async fn test_options_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "keepAlive": true, "maxSockets": 1, "scheduling": "fifo" }}"#).unwrap();

    let options = AgentOptions::from_json_file(file.path()).unwrap();
    let port = listen().await;
    let agent = agent(options);
    assert_eq!(agent.options().max_sockets, Some(1));

    let held = agent.request(ConnectOptions::new("127.0.0.1", port)).await.unwrap();
    let pending = agent.enqueue(ConnectOptions::new("127.0.0.1", port)).unwrap();
    held.release();

    // The queued request takes over the released socket
    let lease = pending.await.unwrap();
    assert!(!lease.reused());
    assert_eq!(agent.stats().await.unwrap().total_socket_count, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            open.push(stream);
        }
    });

    let agent = agent(AgentOptions::keep_alive());
    let options = ConnectOptions::unix(path.to_string_lossy().into_owned());

    let first = agent.request(options.clone()).await.unwrap();
    assert!(first.key().as_str().ends_with("agent.sock"));
    first.release();
    assert!(agent.request(options).await.unwrap().reused());
}
