#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use redis_replicated::connection::Connection;
use redis_replicated::{Config, Resp, Server};
use tokio::task::JoinHandle;

pub struct TestServer {
    pub addr: SocketAddr,
    pub task: JoinHandle<Result<(), redis_replicated::ServerError>>,
}

impl TestServer {
    pub async fn primary() -> Result<Self> {
        Self::start(Config {
            port: 0,
            ..Config::default()
        })
        .await
    }

    pub async fn replica_of(primary: SocketAddr) -> Result<Self> {
        Self::start(Config {
            port: 0,
            replicaof: Some(format!("{} {}", primary.ip(), primary.port())),
            handshake_timeout_ms: 1000,
            ack_interval_ms: 100,
            ..Config::default()
        })
        .await
    }

    pub async fn start(config: Config) -> Result<Self> {
        let server = Server::bind(config).await?;
        let addr = server.local_addr()?;
        let task = tokio::spawn(server.run());
        Ok(Self { addr, task })
    }

    pub async fn client(&self) -> Result<Client> {
        Client::connect(self.addr).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Client {
    pub conn: Connection,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            conn: Connection::connect(&addr.to_string()).await?,
        })
    }

    pub async fn send(&mut self, parts: &[&str]) -> Result<()> {
        let frame = Resp::command(parts.iter().map(|p| p.to_string()));
        self.conn.write_frame(&frame).await?;
        Ok(())
    }

    pub async fn read(&mut self) -> Result<Resp> {
        match tokio::time::timeout(Duration::from_secs(2), self.conn.read_frame()).await?? {
            Some(frame) => Ok(frame),
            None => bail!("server closed the connection"),
        }
    }

    pub async fn call(&mut self, parts: &[&str]) -> Result<Resp> {
        self.send(parts).await?;
        self.read().await
    }

    /// Polls GET until it returns `expected` or two seconds pass.
    pub async fn wait_for(&mut self, key: &str, expected: Option<&str>) -> Result<()> {
        let expected = match expected {
            Some(value) => Resp::BulkString(Bytes::copy_from_slice(value.as_bytes())),
            None => Resp::Null,
        };
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let got = self.call(&["GET", key]).await?;
            if got == expected {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                bail!("{key} is {got:?}, expected {expected:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
