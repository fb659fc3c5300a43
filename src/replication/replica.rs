use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::ReplicationError;
use crate::command::{Command, ReplConf};
use crate::connection::{Connection, ConnectionError};
use crate::db::Db;
use crate::dispatch::apply_write;
use crate::rdb::SnapshotCodec;
use crate::resp::Resp;

/// Bootstrap progress of a replica's link to its primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    PingSent,
    ReplconfPortSent,
    ReplconfCapaSent,
    PsyncSent,
    SnapshotLoading,
    Streaming,
    Failed,
}

/// What a replica knows about the primary it follows.
#[derive(Debug)]
pub struct Replica {
    master_replid: String,
    offset: AtomicU64,
}

impl Replica {
    pub fn new(master_replid: String, offset: u64) -> Self {
        Self {
            master_replid,
            offset: AtomicU64::new(offset),
        }
    }

    pub fn master_replid(&self) -> &str {
        &self.master_replid
    }

    /// Bytes of the primary's stream applied so far.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }
}

/// Client side of PING → REPLCONF → REPLCONF → PSYNC. Every step is bounded
/// by `step_timeout`; any failure leaves the handshake in `Failed`.
#[derive(Debug)]
pub struct Handshake {
    conn: Connection,
    state: HandshakeState,
    step_timeout: Duration,
    listening_port: u16,
}

/// A finished handshake, ready to stream.
#[derive(Debug)]
pub struct ReplicaLink {
    conn: Connection,
    replica: Arc<Replica>,
    state: HandshakeState,
}

impl Handshake {
    pub async fn connect(
        primary: &str,
        listening_port: u16,
        step_timeout: Duration,
    ) -> Result<Self, ReplicationError> {
        let conn = match time::timeout(step_timeout, Connection::connect(primary)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => {
                return Err(ReplicationError::Connect {
                    addr: primary.to_string(),
                    source,
                })
            }
            Err(_) => return Err(ReplicationError::Timeout(HandshakeState::Init)),
        };
        info!(primary, "connected to primary");
        Ok(Self {
            conn,
            state: HandshakeState::Init,
            step_timeout,
            listening_port,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub async fn run(
        mut self,
        db: &Db,
        codec: &dyn SnapshotCodec,
    ) -> Result<ReplicaLink, ReplicationError> {
        let replica = self.sync(db, codec).await?;
        Ok(ReplicaLink {
            conn: self.conn,
            replica: Arc::new(replica),
            state: self.state,
        })
    }

    /// Drives the handshake to `Streaming`. On error the handshake stays in
    /// `Failed` and the error names the step that broke.
    pub async fn sync(
        &mut self,
        db: &Db,
        codec: &dyn SnapshotCodec,
    ) -> Result<Replica, ReplicationError> {
        match self.perform(db, codec).await {
            Ok(replica) => {
                self.transition(HandshakeState::Streaming);
                info!(
                    master_replid = replica.master_replid(),
                    offset = replica.offset(),
                    "full resync complete, streaming"
                );
                Ok(replica)
            }
            Err(err) => {
                error!(state = ?self.state, %err, "replication handshake failed");
                self.transition(HandshakeState::Failed);
                Err(err)
            }
        }
    }

    async fn perform(
        &mut self,
        db: &Db,
        codec: &dyn SnapshotCodec,
    ) -> Result<Replica, ReplicationError> {
        self.send(Command::Ping(None), HandshakeState::PingSent)
            .await?;
        self.expect_simple("PONG").await?;

        let port = ReplConf::ListeningPort(self.listening_port);
        self.send(Command::ReplConf(port), HandshakeState::ReplconfPortSent)
            .await?;
        self.expect_simple("OK").await?;

        let capa = ReplConf::Capa(vec!["psync2".to_string()]);
        self.send(Command::ReplConf(capa), HandshakeState::ReplconfCapaSent)
            .await?;
        self.expect_simple("OK").await?;

        let psync = Command::Psync {
            replid: "?".to_string(),
            offset: -1,
        };
        self.send(psync, HandshakeState::PsyncSent).await?;
        let (replid, offset) = self.expect_fullresync().await?;

        self.transition(HandshakeState::SnapshotLoading);
        let snapshot = within(self.step_timeout, self.state, self.conn.read_snapshot()).await?;
        let entries = codec.decode(&snapshot)?;
        debug!(keys = entries.len(), bytes = snapshot.len(), "loading snapshot");
        db.load(entries).await;

        Ok(Replica::new(replid, offset))
    }

    fn transition(&mut self, state: HandshakeState) {
        debug!(from = ?self.state, to = ?state, "handshake step");
        self.state = state;
    }

    async fn send(&mut self, command: Command, next: HandshakeState) -> Result<(), ReplicationError> {
        let frame = Resp::from(command);
        within(self.step_timeout, self.state, self.conn.write_frame(&frame)).await?;
        self.transition(next);
        Ok(())
    }

    async fn reply(&mut self) -> Result<Resp, ReplicationError> {
        match within(self.step_timeout, self.state, self.conn.read_frame()).await? {
            Some(frame) => Ok(frame),
            None => Err(self.failure("primary closed the connection")),
        }
    }

    async fn expect_simple(&mut self, expected: &str) -> Result<(), ReplicationError> {
        let reply = self.reply().await?;
        match reply.expect_simple_string() {
            Some(text) if text.eq_ignore_ascii_case(expected) => Ok(()),
            _ => Err(self.failure(format!("expected +{expected}, got {reply:?}"))),
        }
    }

    /// Parses `+FULLRESYNC <replid> <offset>`.
    async fn expect_fullresync(&mut self) -> Result<(String, u64), ReplicationError> {
        let reply = self.reply().await?;
        let parsed = reply.expect_simple_string().and_then(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(keyword), Some(replid), Some(offset), None)
                    if keyword.eq_ignore_ascii_case("FULLRESYNC") =>
                {
                    Some((replid.to_string(), offset.parse::<u64>().ok()?))
                }
                _ => None,
            }
        });
        parsed.ok_or_else(|| self.failure(format!("expected +FULLRESYNC, got {reply:?}")))
    }

    fn failure(&self, reason: impl Into<String>) -> ReplicationError {
        ReplicationError::Handshake {
            state: self.state,
            reason: reason.into(),
        }
    }
}

async fn within<T>(
    limit: Duration,
    state: HandshakeState,
    step: impl Future<Output = Result<T, ConnectionError>>,
) -> Result<T, ReplicationError> {
    match time::timeout(limit, step).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ReplicationError::Timeout(state)),
    }
}

impl ReplicaLink {
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn replica(&self) -> Arc<Replica> {
        self.replica.clone()
    }

    /// Applies the primary's command stream in arrival order and acknowledges
    /// progress every `ack_interval`. Only returns on failure: losing the
    /// primary is fatal for a replica.
    pub async fn stream(mut self, db: Arc<Db>, ack_interval: Duration) -> ReplicationError {
        let mut ack = time::interval_at(Instant::now() + ack_interval, ack_interval);
        ack.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let err = loop {
            tokio::select! {
                frame = self.conn.read_frame_with_len() => match frame {
                    Ok(Some((frame, len))) => {
                        if let Err(err) = self.apply(frame, &db).await {
                            break err;
                        }
                        self.replica.offset.fetch_add(len as u64, Ordering::AcqRel);
                    }
                    Ok(None) => break ReplicationError::PrimaryLost,
                    Err(err) => break err.into(),
                },
                _ = ack.tick() => {
                    if let Err(err) = self.send_ack().await {
                        break err;
                    }
                }
            }
        };
        error!(%err, "replication stream ended");
        err
    }

    async fn apply(&mut self, frame: Resp, db: &Db) -> Result<(), ReplicationError> {
        match Command::parse(frame) {
            Ok(command) if command.is_write() => {
                apply_write(db, &command).await;
            }
            // The reported offset excludes the GETACK itself.
            Ok(Command::ReplConf(ReplConf::GetAck)) => self.send_ack().await?,
            Ok(Command::Ping(_)) => {}
            Ok(command) => debug!(command = command.name(), "ignoring command from primary"),
            Err(err) => warn!(%err, "unparseable command from primary"),
        }
        Ok(())
    }

    async fn send_ack(&mut self) -> Result<(), ReplicationError> {
        let ack: Resp = Command::ReplConf(ReplConf::Ack(self.replica.offset())).into();
        self.conn.write_frame(&ack).await?;
        Ok(())
    }
}
