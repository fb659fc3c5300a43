mod common;

use std::time::Duration;

use anyhow::Result;
use redis_replicated::connection::Connection;
use redis_replicated::rdb::{Rdb, SnapshotCodec};
use redis_replicated::replication::ReplicationError;
use redis_replicated::{Config, Resp, Server, ServerError};
use tokio::net::TcpListener;

use common::{Client, TestServer};

/// Runs the replica side of the handshake by hand, leaving the connection at
/// the start of the command stream.
async fn fake_replica(primary: &TestServer) -> Result<Client> {
    let mut replica = primary.client().await?;
    replica.call(&["PING"]).await?;
    replica.call(&["REPLCONF", "listening-port", "7000"]).await?;
    replica.call(&["REPLCONF", "capa", "psync2"]).await?;
    replica.call(&["PSYNC", "?", "-1"]).await?;
    replica.conn.read_snapshot().await?;
    Ok(replica)
}

#[tokio::test]
async fn writes_reach_registered_replica_in_order() -> Result<()> {
    let primary = TestServer::primary().await?;
    let mut replica = fake_replica(&primary).await?;
    let mut client = primary.client().await?;

    client.call(&["SET", "a", "1"]).await?;
    client.call(&["SET", "b", "2", "PX", "10000"]).await?;
    client.call(&["DEL", "a"]).await?;
    client.call(&["DEL", "never-existed"]).await?;
    client.call(&["SET", "c", "3"]).await?;

    assert_eq!(replica.read().await?, Resp::command(["SET", "a", "1"]));
    assert_eq!(
        replica.read().await?,
        Resp::command(["SET", "b", "2", "PX", "10000"])
    );
    assert_eq!(replica.read().await?, Resp::command(["DEL", "a"]));
    assert_eq!(replica.read().await?, Resp::command(["SET", "c", "3"]));

    let info = client.call(&["INFO", "replication"]).await?;
    let body = String::from_utf8(info.expect_bulk_string().unwrap().to_vec())?;
    assert!(body.contains("connected_slaves:1"));
    assert!(body.contains("port=7000"));
    Ok(())
}

#[tokio::test]
async fn replica_mirrors_primary() -> Result<()> {
    let primary = TestServer::primary().await?;
    let mut client = primary.client().await?;
    client.call(&["SET", "before", "sync"]).await?;

    let replica = TestServer::replica_of(primary.addr).await?;
    let mut reader = replica.client().await?;
    reader.wait_for("before", Some("sync")).await?;

    for i in 0..50 {
        let value = i.to_string();
        client.call(&["SET", "counter", value.as_str()]).await?;
    }
    client.call(&["SET", "w1", "x"]).await?;
    client.call(&["DEL", "w1"]).await?;
    client.call(&["SET", "last", "done"]).await?;

    reader.wait_for("last", Some("done")).await?;
    assert_eq!(reader.call(&["GET", "counter"]).await?, Resp::bulk_string("49"));
    assert_eq!(reader.call(&["GET", "w1"]).await?, Resp::Null);

    let info = reader.call(&["INFO", "replication"]).await?;
    let body = String::from_utf8(info.expect_bulk_string().unwrap().to_vec())?;
    assert!(body.starts_with("role:slave\r\n"));
    let primary_info = client.call(&["INFO", "replication"]).await?;
    let primary_body = String::from_utf8(primary_info.expect_bulk_string().unwrap().to_vec())?;
    let replid = primary_body
        .split("\r\n")
        .find(|line| line.starts_with("master_replid:"))
        .unwrap();
    assert!(body.contains(replid));
    Ok(())
}

#[tokio::test]
async fn replica_rejects_client_writes() -> Result<()> {
    let primary = TestServer::primary().await?;
    let replica = TestServer::replica_of(primary.addr).await?;
    let mut client = replica.client().await?;

    assert_eq!(
        client.call(&["SET", "a", "1"]).await?,
        Resp::error("READONLY You can't write against a read only replica.")
    );
    assert_eq!(client.call(&["ECHO", "still here"]).await?, Resp::bulk_string("still here"));
    Ok(())
}

#[tokio::test]
async fn wait_counts_acknowledging_replicas() -> Result<()> {
    let primary = TestServer::primary().await?;
    let _replica = TestServer::replica_of(primary.addr).await?;
    let mut client = primary.client().await?;

    client.call(&["SET", "a", "1"]).await?;
    assert_eq!(client.call(&["WAIT", "1", "2000"]).await?, Resp::Integer(1));
    // No deadline: returns once the replica acknowledges.
    assert_eq!(client.call(&["WAIT", "1", "0"]).await?, Resp::Integer(1));
    assert_eq!(client.call(&["WAIT", "2", "100"]).await?, Resp::Integer(1));
    Ok(())
}

#[tokio::test]
async fn replica_fails_fast_without_primary() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let result = Server::bind(Config {
        port: 0,
        replicaof: Some(format!("127.0.0.1 {}", addr.port())),
        handshake_timeout_ms: 500,
        ..Config::default()
    })
    .await;
    assert!(matches!(
        result,
        Err(ServerError::Replication(ReplicationError::Connect { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn losing_the_primary_stops_the_replica() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let primary = tokio::spawn(async move {
        let mut conn = Connection::new(listener.accept().await?);
        for reply in ["+PONG\r\n", "+OK\r\n", "+OK\r\n"] {
            conn.read_frame().await?;
            conn.write_all(reply.as_bytes()).await?;
        }
        conn.read_frame().await?;
        conn.write_all(format!("+FULLRESYNC {} 0\r\n", "a".repeat(40)).as_bytes())
            .await?;
        conn.write_all(&Resp::encode_snapshot(&Rdb.encode(&[]))).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        anyhow::Ok(())
    });

    let replica = Server::bind(Config {
        port: 0,
        replicaof: Some(addr.to_string()),
        handshake_timeout_ms: 1000,
        ..Config::default()
    })
    .await?;
    assert_eq!(replica.replication().replid(), "a".repeat(40));

    primary.await??;
    let result = tokio::time::timeout(Duration::from_secs(2), replica.run()).await?;
    assert!(matches!(
        result,
        Err(ServerError::Replication(ReplicationError::PrimaryLost))
    ));
    Ok(())
}
