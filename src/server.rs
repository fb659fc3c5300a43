use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::command::Command;
use crate::config::Config;
use crate::connection::{Connection, ConnectionError};
use crate::db::Db;
use crate::dispatch::{Dispatcher, Outcome, Session};
use crate::rdb::{Rdb, SnapshotCodec};
use crate::replication::{Handshake, Master, ReplicaLink, Replication, ReplicationError};
use crate::resp::Resp;
use crate::utils::generate_replication_id;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Can not listen to port {port}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("replication failed")]
    Replication(#[from] ReplicationError),

    #[error("IO error")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct Server {
    config: Config,
    listener: TcpListener,
    db: Arc<Db>,
    dispatcher: Dispatcher,
    link: Option<ReplicaLink>,
}

impl Server {
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        Self::bind_with_codec(config, Arc::new(Rdb)).await
    }

    /// Binds the listener and, for a replica, completes the handshake with the
    /// primary. Client connections are only accepted once this returns.
    pub async fn bind_with_codec(
        config: Config,
        codec: Arc<dyn SnapshotCodec>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((config.bind.as_str(), config.port))
            .await
            .map_err(|source| ServerError::Bind {
                port: config.port,
                source,
            })?;
        let port = listener.local_addr()?.port();
        let db = Arc::new(Db::new());

        let (replication, link) = match config.primary_address() {
            None => {
                let master = Master::new(generate_replication_id());
                info!(replid = master.replid(), "starting as primary");
                (Replication::Master(Arc::new(master)), None)
            }
            Some(primary) => {
                info!(%primary, "starting as replica");
                let link = Handshake::connect(&primary, port, config.handshake_timeout())
                    .await?
                    .run(&db, codec.as_ref())
                    .await?;
                (Replication::Replica(link.replica()), Some(link))
            }
        };

        let dispatcher = Dispatcher::new(db.clone(), replication, codec);
        Ok(Self {
            config,
            listener,
            db,
            dispatcher,
            link,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn replication(&self) -> &Replication {
        self.dispatcher.replication()
    }

    /// Serves clients until a fatal error. For a replica, losing the primary
    /// is fatal and ends the server.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self {
            config,
            listener,
            db,
            dispatcher,
            link,
        } = self;
        info!(
            addr = %listener.local_addr()?,
            role = dispatcher.replication().role(),
            "Listening"
        );
        let sweeper = db.spawn_sweeper(config.sweep_interval());

        let result = match link {
            None => accept_loop(listener, dispatcher).await,
            Some(link) => {
                let stream = tokio::spawn(link.stream(db.clone(), config.ack_interval()));
                tokio::select! {
                    result = accept_loop(listener, dispatcher) => result,
                    ended = stream => Err(match ended {
                        Ok(err) => err.into(),
                        Err(join) => {
                            error!(%join, "replication task aborted");
                            ReplicationError::PrimaryLost.into()
                        }
                    }),
                }
            }
        };
        sweeper.abort();
        result
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Dispatcher) -> Result<(), ServerError> {
    loop {
        let (tcp, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let handler = Handler {
            connection: Connection::new((tcp, addr)),
            dispatcher: dispatcher.clone(),
            session: Session::new(addr),
        };
        tokio::spawn(async move {
            if let Err(err) = handler.run().await {
                debug!(%addr, %err, "connection ended with error");
            }
        });
    }
}

/// Read, decode, dispatch, reply for one client connection.
struct Handler {
    connection: Connection,
    dispatcher: Dispatcher,
    session: Session,
}

impl Handler {
    async fn run(mut self) -> Result<(), ConnectionError> {
        info!(addr = %self.connection.addr, "accepted new connection");
        loop {
            let frame = match self.connection.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!(addr = %self.connection.addr, "connection closed");
                    return Ok(());
                }
                // The stream can't be resynchronized after a bad frame.
                Err(ConnectionError::Protocol(err)) => {
                    let reply = Resp::error(format!("ERR Protocol error: {err}"));
                    self.connection.write_frame(&reply).await?;
                    let _ = self.connection.shutdown().await;
                    return Err(err.into());
                }
                Err(err) => return Err(err),
            };

            let command = match Command::parse(frame) {
                Ok(command) => command,
                Err(err) => {
                    self.connection
                        .write_frame(&Resp::error(err.to_string()))
                        .await?;
                    continue;
                }
            };
            debug!(addr = %self.connection.addr, command = command.name(), "dispatching");

            match self.dispatcher.execute(command, &mut self.session).await {
                Outcome::Reply(reply) => self.connection.write_frame(&reply).await?,
                Outcome::Silent => {}
                Outcome::Resync(resync) => {
                    info!(addr = %self.connection.addr, "connection promoted to replica");
                    return resync.serve(self.connection).await;
                }
            }
        }
    }
}
