use std::sync::Arc;

use thiserror::Error;

use crate::connection::ConnectionError;
use crate::rdb::RdbError;

pub mod master;
pub mod replica;

pub use master::{FullResync, Master, ReplicaId, WriteGuard};
pub use replica::{Handshake, HandshakeState, Replica, ReplicaLink};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("could not reach primary at {addr}")]
    Connect {
        addr: String,
        #[source]
        source: ConnectionError,
    },

    #[error("handshake failed in state {state:?}: {reason}")]
    Handshake {
        state: HandshakeState,
        reason: String,
    },

    #[error("primary did not answer in time (state {0:?})")]
    Timeout(HandshakeState),

    #[error("connection to primary failed")]
    Connection(#[from] ConnectionError),

    #[error("snapshot from primary could not be loaded")]
    Snapshot(#[from] RdbError),

    #[error("lost connection to primary")]
    PrimaryLost,
}

/// Role-specific replication state, fixed for the life of the process.
#[derive(Debug, Clone)]
pub enum Replication {
    Master(Arc<Master>),
    Replica(Arc<Replica>),
}

impl Replication {
    pub fn role(&self) -> &'static str {
        match self {
            Replication::Master(_) => "master",
            Replication::Replica(_) => "slave",
        }
    }

    pub fn replid(&self) -> &str {
        match self {
            Replication::Master(master) => master.replid(),
            Replication::Replica(replica) => replica.master_replid(),
        }
    }

    pub async fn offset(&self) -> u64 {
        match self {
            Replication::Master(master) => master.offset().await,
            Replication::Replica(replica) => replica.offset(),
        }
    }

    /// Body of `INFO replication`.
    pub async fn info(&self) -> String {
        let mut lines = vec![format!("role:{}", self.role())];
        if let Replication::Master(master) = self {
            lines.extend(master.replica_info().await);
        }
        lines.push(format!("master_replid:{}", self.replid()));
        lines.push(format!("master_repl_offset:{}", self.offset().await));
        lines.join("\r\n")
    }
}
