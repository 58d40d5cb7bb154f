//! The connection façade.
use bytes::BytesMut;
use std::{collections::HashMap, io};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
};

use crate::{
    Error, Result,
    config::Config,
    engine::{Command, Engine, Reply, TxHandle},
    net::Socket,
    protocol::{backend::BackendKeyData, frontend},
    result::ResultGroup,
    statement::Statement,
    transaction::Transaction,
};

/// What the façade hands to the driver task.
enum Submission {
    Command { command: Command, tx: Option<TxHandle>, reply: Reply },
    Begin { handle: TxHandle, reply: Reply },
    Commit { handle: TxHandle, reply: Reply },
    Rollback { handle: TxHandle, reply: Option<Reply> },
    Close { reply: oneshot::Sender<()> },
}

/// An open postgres connection.
///
/// The value is a handle; the protocol engine runs in a background task
/// that owns the socket. Operations may be submitted at any time and
/// complete strictly in submission order, one at a time on the wire.
pub struct Connection {
    submissions: mpsc::UnboundedSender<Submission>,
    key_data: Option<BackendKeyData>,
    parameters: HashMap<String, String>,
    config: Config,
}

impl Connection {
    /// Open a transport, perform the startup and authentication
    /// handshake, and resolve with the connection on the first
    /// `ReadyForQuery`.
    pub async fn connect(config: Config) -> Result<Connection> {
        let socket = Socket::connect(&config).await?;

        let (handshake, handshake_rx) = oneshot::channel();
        let engine = Engine::new(&config, handshake);

        let (submissions, submission_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(socket, engine, submission_rx));

        let handshake = handshake_rx.await.map_err(|_| Error::closed())??;
        log::debug!(
            "connected to {} as {}",
            config.get_host(),
            config.get_user(),
        );

        Ok(Connection {
            submissions,
            key_data: handshake.key_data,
            parameters: handshake.parameters,
            config,
        })
    }

    /// Connect with configuration from the environment.
    pub async fn connect_env() -> Result<Connection> {
        Self::connect(Config::from_env()).await
    }

    /// Run a simple query. The sql may hold several semicolon separated
    /// statements; the group carries one result per statement, in order.
    pub async fn execute(&self, sql: &str) -> Result<ResultGroup> {
        self.submit(Command::Query { sql: sql.to_owned() }, None).await
    }

    /// Parse and describe a prepared statement.
    pub async fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        Statement::prepare(self, sql, &[], None).await
    }

    /// Parse with explicit parameter-type oids for the placeholders the
    /// server should not infer.
    pub async fn prepare_with(&self, sql: &str, param_oids: &[i32]) -> Result<Statement<'_>> {
        Statement::prepare(self, sql, param_oids, None).await
    }

    /// Open a transaction. Resolves once `BEGIN` completes; submissions
    /// not made through the returned guard wait until it ends.
    pub async fn transaction(&self) -> Result<Transaction<'_>> {
        let handle = TxHandle::new();
        let (reply, rx) = oneshot::channel();
        self.send(Submission::Begin { handle: handle.clone(), reply })?;
        rx.await.map_err(|_| Error::closed())??;
        Ok(Transaction::new(self, handle))
    }

    /// Gracefully close the connection: `Terminate`, flush, shutdown.
    pub async fn close(self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Submission::Close { reply })?;
        rx.await.map_err(|_| Error::closed())
    }

    /// Request cancellation of whatever this connection is running, over a
    /// second short-lived connection. The canceled operation fails with a
    /// regular server error and the session recovers on its own.
    pub async fn cancel(&self) -> Result<()> {
        let Some(key) = self.key_data else {
            return Err(Error::misuse("no backend key data to cancel with"));
        };
        let mut socket = Socket::connect(&self.config).await?;
        let mut buf = BytesMut::with_capacity(16);
        frontend::CancelRequest {
            process_id: key.process_id,
            secret_key: key.secret_key,
        }
        .write(&mut buf);
        socket.write_all_buf(&mut buf).await?;
        socket.shutdown().await?;
        Ok(())
    }

    /// Key data for out-of-band cancellation from elsewhere.
    pub fn backend_key_data(&self) -> Option<BackendKeyData> {
        self.key_data
    }

    /// A server run-time parameter reported during startup.
    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub(crate) async fn submit(
        &self,
        command: Command,
        tx: Option<&TxHandle>,
    ) -> Result<ResultGroup> {
        let (reply, rx) = oneshot::channel();
        self.send(Submission::Command { command, tx: tx.cloned(), reply })?;
        rx.await.map_err(|_| Error::closed())?
    }

    pub(crate) async fn commit_tx(&self, handle: &TxHandle) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Submission::Commit { handle: handle.clone(), reply })?;
        rx.await.map_err(|_| Error::closed())??;
        Ok(())
    }

    pub(crate) async fn rollback_tx(&self, handle: &TxHandle) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Submission::Rollback { handle: handle.clone(), reply: Some(reply) })?;
        rx.await.map_err(|_| Error::closed())??;
        Ok(())
    }

    /// Fire-and-forget rollback, for the transaction guard's drop.
    pub(crate) fn rollback_nowait(&self, handle: &TxHandle) {
        let _ = self.send(Submission::Rollback { handle: handle.clone(), reply: None });
    }

    fn send(&self, submission: Submission) -> Result<()> {
        self.submissions.send(submission).map_err(|_| Error::closed())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.get_host())
            .field("process_id", &self.key_data.map(|k| k.process_id))
            .finish()
    }
}

/// The event-loop half: pump the socket and the submission channel into
/// the engine until either side is done.
async fn drive(
    mut socket: Socket,
    mut engine: Engine,
    mut submissions: mpsc::UnboundedReceiver<Submission>,
) {
    let error = 'run: loop {
        while engine.wants_write() {
            if let Err(err) = socket.write_all_buf(engine.write_buf_mut()).await {
                break 'run err.into();
            }
        }

        tokio::select! {
            submission = submissions.recv() => match submission {
                Some(Submission::Close { reply }) => {
                    engine.terminate();
                    let _ = socket.write_all_buf(engine.write_buf_mut()).await;
                    let _ = socket.shutdown().await;
                    engine.fail_all(Error::closed());
                    let _ = reply.send(());
                    return;
                }
                Some(submission) => apply(&mut engine, submission),
                // every handle dropped: terminate and go away
                None => {
                    engine.terminate();
                    let _ = socket.write_all_buf(engine.write_buf_mut()).await;
                    let _ = socket.shutdown().await;
                    return;
                }
            },
            read = socket.read_buf(engine.read_buf_mut()) => match read {
                Ok(0) => break 'run io::Error::from(io::ErrorKind::UnexpectedEof).into(),
                Ok(_) => {
                    if let Err(err) = engine.drive() {
                        break 'run err;
                    }
                }
                Err(err) => break 'run err.into(),
            },
        }
    };

    log::error!("connection task stopping: {error}");
    engine.fail_all(error);

    // keep draining so late submitters observe the failure instead of a
    // hung future
    while let Some(submission) = submissions.recv().await {
        refuse(submission);
    }
}

fn apply(engine: &mut Engine, submission: Submission) {
    match submission {
        Submission::Command { command, tx, reply } => engine.submit(command, tx.as_ref(), reply),
        Submission::Begin { handle, reply } => engine.begin(handle, reply),
        Submission::Commit { handle, reply } => engine.commit(&handle, reply),
        Submission::Rollback { handle, reply } => engine.rollback(&handle, reply),
        Submission::Close { reply } => {
            let _ = reply.send(());
        }
    }
}

fn refuse(submission: Submission) {
    match submission {
        Submission::Command { reply, .. }
        | Submission::Begin { reply, .. }
        | Submission::Commit { reply, .. }
        | Submission::Rollback { reply: Some(reply), .. } => {
            let _ = reply.send(Err(Error::closed()));
        }
        Submission::Rollback { reply: None, .. } => {}
        Submission::Close { reply } => {
            let _ = reply.send(());
        }
    }
}
