use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use indexmap::IndexMap;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{Command, ReplConf};
use crate::connection::{Connection, ConnectionError};
use crate::db::Db;
use crate::rdb::SnapshotCodec;
use crate::resp::Resp;

pub type ReplicaId = u64;

/// The primary's view of one synchronized replica.
#[derive(Debug)]
struct ReplicaHandle {
    addr: SocketAddr,
    listening_port: Option<u16>,
    sender: mpsc::UnboundedSender<Bytes>,
    ack_offset: u64,
}

#[derive(Debug, Default)]
struct MasterState {
    offset: u64,
    replicas: IndexMap<ReplicaId, ReplicaHandle>,
    next_id: ReplicaId,
}

impl MasterState {
    /// Queues `frame` for every replica. Replicas whose link task is gone are
    /// dropped here; nothing waits on a socket.
    fn propagate(&mut self, frame: &Resp) {
        if self.replicas.is_empty() {
            return;
        }
        let bytes = Bytes::from(frame.encode());
        self.offset += bytes.len() as u64;
        self.replicas.retain(|id, handle| {
            let alive = handle.sender.send(bytes.clone()).is_ok();
            if !alive {
                warn!(replica = id, addr = %handle.addr, "dropping replica, stream closed");
            }
            alive
        });
    }

    fn acked(&self, target: u64) -> usize {
        self.replicas
            .values()
            .filter(|handle| handle.ack_offset >= target)
            .count()
    }
}

#[derive(Debug)]
pub struct Master {
    replid: String,
    state: Mutex<MasterState>,
    acks: Notify,
}

/// Holds the primary's write lock. A write applied to the store while the
/// guard is alive is propagated in exactly the order it was applied.
pub struct WriteGuard<'a> {
    state: MutexGuard<'a, MasterState>,
}

impl WriteGuard<'_> {
    pub fn propagate(mut self, command: &Command) {
        self.state.propagate(&Resp::from(command));
    }
}

/// Everything needed to finish a PSYNC on the connection that asked for it.
#[derive(Debug)]
pub struct FullResync {
    master: Arc<Master>,
    pub id: ReplicaId,
    pub offset: u64,
    pub snapshot: Bytes,
    stream: mpsc::UnboundedReceiver<Bytes>,
}

impl Master {
    pub fn new(replid: String) -> Self {
        Self {
            replid,
            state: Mutex::new(MasterState::default()),
            acks: Notify::new(),
        }
    }

    pub fn replid(&self) -> &str {
        &self.replid
    }

    pub async fn offset(&self) -> u64 {
        self.state.lock().await.offset
    }

    pub async fn replica_count(&self) -> usize {
        self.state.lock().await.replicas.len()
    }

    /// `connected_slaves` plus one line per replica, as `INFO replication` lists them.
    pub async fn replica_info(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut lines = vec![format!("connected_slaves:{}", state.replicas.len())];
        for (n, handle) in state.replicas.values().enumerate() {
            lines.push(format!(
                "slave{n}:ip={},port={},state=online,offset={}",
                handle.addr.ip(),
                handle.listening_port.unwrap_or(handle.addr.port()),
                handle.ack_offset
            ));
        }
        lines
    }

    pub async fn begin_write(&self) -> WriteGuard<'_> {
        WriteGuard {
            state: self.state.lock().await,
        }
    }

    /// Snapshots the store and registers the replica under one lock, so the
    /// stream it receives starts exactly where the snapshot ends.
    pub async fn register(
        self: &Arc<Self>,
        db: &Db,
        codec: &dyn SnapshotCodec,
        addr: SocketAddr,
        listening_port: Option<u16>,
    ) -> FullResync {
        let mut state = self.state.lock().await;
        let snapshot = codec.encode(&db.snapshot().await);
        let (sender, stream) = mpsc::unbounded_channel();
        state.next_id += 1;
        let id = state.next_id;
        let offset = state.offset;
        state.replicas.insert(
            id,
            ReplicaHandle {
                addr,
                listening_port,
                sender,
                ack_offset: offset,
            },
        );
        info!(replica = id, %addr, ?listening_port, offset, "replica registered");

        FullResync {
            master: self.clone(),
            id,
            offset,
            snapshot,
            stream,
        }
    }

    pub async fn deregister(&self, id: ReplicaId) {
        if let Some(handle) = self.state.lock().await.replicas.shift_remove(&id) {
            info!(replica = id, addr = %handle.addr, "replica removed");
        }
        self.acks.notify_waiters();
    }

    pub async fn record_ack(&self, id: ReplicaId, offset: u64) {
        if let Some(handle) = self.state.lock().await.replicas.get_mut(&id) {
            handle.ack_offset = handle.ack_offset.max(offset);
        }
        self.acks.notify_waiters();
    }

    /// Blocks until `wanted` replicas have acknowledged everything propagated
    /// before the call, or `timeout` passes. A zero timeout has no deadline.
    pub async fn wait(&self, wanted: usize, timeout: Duration) -> usize {
        let target = {
            let mut state = self.state.lock().await;
            let target = state.offset;
            let acked = state.acked(target);
            if acked >= wanted {
                return acked;
            }
            state.propagate(&Command::ReplConf(ReplConf::GetAck).into());
            target
        };

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            let notified = self.acks.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let acked = self.state.lock().await.acked(target);
            if acked >= wanted {
                return acked;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.state.lock().await.acked(target);
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl FullResync {
    pub fn header(&self) -> Resp {
        Resp::simple_string(format!("FULLRESYNC {} {}", self.master.replid, self.offset))
    }

    /// Completes the PSYNC reply and then owns the connection as a replica
    /// link until it closes. The handle is always removed on the way out.
    pub async fn serve(mut self, mut conn: Connection) -> Result<(), ConnectionError> {
        let result = self.stream_to(&mut conn).await;
        self.master.deregister(self.id).await;
        let _ = conn.shutdown().await;
        result
    }

    async fn stream_to(&mut self, conn: &mut Connection) -> Result<(), ConnectionError> {
        conn.write_frame(&self.header()).await?;
        conn.write_all(&Resp::encode_snapshot(&self.snapshot)).await?;
        debug!(replica = self.id, bytes = self.snapshot.len(), "snapshot sent");

        loop {
            tokio::select! {
                propagated = self.stream.recv() => match propagated {
                    Some(bytes) => conn.write_all(&bytes).await?,
                    None => return Ok(()),
                },
                frame = conn.read_frame() => match frame? {
                    None => return Ok(()),
                    Some(frame) => match Command::parse(frame) {
                        Ok(Command::ReplConf(ReplConf::Ack(offset))) => {
                            self.master.record_ack(self.id, offset).await;
                        }
                        Ok(command) => {
                            debug!(
                                replica = self.id,
                                command = command.name(),
                                "ignoring command on replica link"
                            );
                        }
                        Err(err) => warn!(replica = self.id, %err, "bad frame on replica link"),
                    },
                },
            }
        }
    }
}
