use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::command::{Command, ReplConf};
use crate::db::Db;
use crate::rdb::SnapshotCodec;
use crate::replication::{FullResync, Replication};
use crate::resp::Resp;

const READONLY: &str = "READONLY You can't write against a read only replica.";

/// Per-connection facts collected from `REPLCONF` before a `PSYNC`.
#[derive(Debug)]
pub struct Session {
    pub addr: SocketAddr,
    pub listening_port: Option<u16>,
}

impl Session {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            listening_port: None,
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Reply(Resp),
    /// `REPLCONF ACK` is never answered.
    Silent,
    /// The connection becomes a replica link.
    Resync(FullResync),
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    db: Arc<Db>,
    replication: Replication,
    codec: Arc<dyn SnapshotCodec>,
}

impl Dispatcher {
    pub fn new(db: Arc<Db>, replication: Replication, codec: Arc<dyn SnapshotCodec>) -> Self {
        Self {
            db,
            replication,
            codec,
        }
    }

    pub fn replication(&self) -> &Replication {
        &self.replication
    }

    pub async fn execute(&self, command: Command, session: &mut Session) -> Outcome {
        let reply = match command {
            Command::Ping(None) => Resp::simple_string("PONG"),
            Command::Ping(Some(msg)) | Command::Echo(msg) => Resp::BulkString(msg),
            Command::Get(key) => match self.db.get(&key).await {
                Some(value) => Resp::BulkString(value),
                None => Resp::Null,
            },
            Command::Set(_) | Command::Del(_) => match &self.replication {
                Replication::Master(master) => {
                    let guard = master.begin_write().await;
                    let (reply, changed) = apply_write(&self.db, &command).await;
                    if changed {
                        guard.propagate(&command);
                    }
                    reply
                }
                Replication::Replica(_) => Resp::error(READONLY),
            },
            Command::Info(section) => match section.as_deref() {
                None | Some("replication") => Resp::bulk_string(self.replication.info().await),
                Some(_) => Resp::BulkString(Bytes::new()),
            },
            Command::ReplConf(ReplConf::ListeningPort(port)) => {
                session.listening_port = Some(port);
                Resp::ok()
            }
            Command::ReplConf(ReplConf::Capa(capabilities)) => {
                debug!(addr = %session.addr, ?capabilities, "replica capabilities");
                Resp::ok()
            }
            Command::ReplConf(ReplConf::Ack(_)) => return Outcome::Silent,
            Command::ReplConf(ReplConf::GetAck) => {
                Resp::error("ERR REPLCONF GETACK is only valid on a replication link")
            }
            Command::Psync { .. } => match &self.replication {
                Replication::Master(master) => {
                    let resync = master
                        .register(
                            &self.db,
                            self.codec.as_ref(),
                            session.addr,
                            session.listening_port,
                        )
                        .await;
                    return Outcome::Resync(resync);
                }
                Replication::Replica(_) => Resp::error("ERR PSYNC is not served by a replica"),
            },
            Command::Wait { replicas, timeout } => match &self.replication {
                Replication::Master(master) => {
                    Resp::Integer(master.wait(replicas, timeout).await as i64)
                }
                Replication::Replica(_) => {
                    Resp::error("ERR WAIT cannot be used with replica instances")
                }
            },
        };
        Outcome::Reply(reply)
    }
}

/// Applies a keyspace mutation. Shared by client writes on a primary and the
/// replica's inbound stream; returns the reply and whether anything changed.
pub async fn apply_write(db: &Db, command: &Command) -> (Resp, bool) {
    match command {
        Command::Set(set) => {
            db.set(set.key.clone(), set.value.clone(), set.ttl()).await;
            (Resp::ok(), true)
        }
        Command::Del(keys) => {
            let removed = db.delete_many(keys).await;
            (Resp::Integer(removed as i64), removed > 0)
        }
        other => (
            Resp::error(format!("ERR '{}' is not a write command", other.name())),
            false,
        ),
    }
}
