use std::sync::Arc;
use std::time::Duration;

use rkv_client::{ClientConfig, KVClient};
use rkv_engine::DataEngine;
use rkv_server::metrics::Metrics;
use rkv_server::server::{handle_connection, Backend};
use tokio::net::TcpListener;

async fn spawn_standalone() -> String {
    let engine = Arc::new(DataEngine::new());
    let backend = Backend::Standalone(engine);
    let metrics = Arc::new(Metrics::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let backend = backend.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, backend, metrics).await;
            });
        }
    });

    addr
}

fn blocking_client(addr: String) -> KVClient {
    let config = ClientConfig {
        addr,
        max_idle: 1,
        max_total: 1,
        read_timeout: Some(Duration::from_secs(2)),
        write_timeout: Some(Duration::from_secs(2)),
        connect_timeout: Some(Duration::from_secs(2)),
    };
    KVClient::with_config(config).expect("client")
}

#[tokio::test]
async fn set_get_delete_roundtrip_over_real_socket() {
    let addr = spawn_standalone().await;
    let client = tokio::task::spawn_blocking(move || {
        let client = blocking_client(addr);
        client.set(b"k", b"v").unwrap();
        let got = client.get(b"k").unwrap();
        assert_eq!(got, Some(b"v".to_vec()));
        let removed = client.delete(b"k").unwrap();
        assert!(removed);
        assert_eq!(client.get(b"k").unwrap(), None);
        client
    })
    .await
    .unwrap();
    drop(client);
}

#[tokio::test]
async fn multiple_connections_share_one_keyspace() {
    let addr = spawn_standalone().await;

    let addr_a = addr.clone();
    tokio::task::spawn_blocking(move || {
        let client = blocking_client(addr_a);
        client.set(b"shared", b"first").unwrap();
    })
    .await
    .unwrap();

    let addr_b = addr.clone();
    let value = tokio::task::spawn_blocking(move || {
        let client = blocking_client(addr_b);
        client.get(b"shared").unwrap()
    })
    .await
    .unwrap();

    assert_eq!(value, Some(b"first".to_vec()));
}
