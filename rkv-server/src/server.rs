//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to either the
//! standalone storage engine or the cluster router, with minimal overhead.

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use rkv_cluster::ClusterRouter;
use rkv_common::{RequestParser, RespValue};
use rkv_engine::{next_conn_id, DataEngine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::metrics::Metrics;

/// Where a connection's commands are actually executed.
///
/// A single node either runs standalone against its own `DataEngine`, or
/// hands every command to the `ClusterRouter`, which partitions it across
/// peers and falls back to the local engine for anything that stays on this
/// node. Both share the same `args -> RespValue` shape, so the accept loop
/// below does not need to know which mode it is in.
#[derive(Clone)]
pub enum Backend {
    Standalone(Arc<DataEngine>),
    Cluster(Arc<ClusterRouter>),
}

impl Backend {
    fn exec(&self, conn_id: u64, args: &[Vec<u8>]) -> RespValue {
        match self {
            Backend::Standalone(engine) => engine.exec(conn_id, args),
            Backend::Cluster(router) => router.exec(args),
        }
    }
}

/// Handles a single TCP client connection until it disconnects or a
/// protocol error forces the connection closed.
pub async fn handle_connection(
    stream: TcpStream,
    backend: Backend,
    metrics: Arc<Metrics>,
) -> std::io::Result<()> {
    let conn_id = next_conn_id();
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RequestParser::new();

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            let parsed = parser.parse(&mut buffer);
            match parsed {
                Ok(Some(args)) => {
                    if args.is_empty() {
                        continue;
                    }
                    metrics.record_request_start();
                    let start = Instant::now();
                    let reply = backend.exec(conn_id, &args);
                    metrics.record_request_end(start.elapsed());
                    if matches!(reply, RespValue::Error(_)) {
                        metrics.record_error();
                    }
                    let mut out = Vec::new();
                    reply.encode(&mut out);
                    stream.write_all(&out).await?;
                }
                Ok(None) => break,
                Err(err) => {
                    let mut out = Vec::new();
                    RespValue::from_error(&err).encode(&mut out);
                    let _ = stream.write_all(&out).await;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn serves_get_and_set_over_the_wire() {
        let engine = Arc::new(DataEngine::new());
        let backend = Backend::Standalone(engine);
        let metrics = Arc::new(Metrics::new());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_connection(stream, backend, metrics).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$1\r\nv\r\n");
    }
}
