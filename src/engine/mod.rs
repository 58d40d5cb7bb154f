//! The per-connection protocol engine.
//!
//! The [`Engine`] is sans-io: a host feeds it inbound bytes (through
//! [`read_buf_mut`][Engine::read_buf_mut] and [`drive`][Engine::drive]) and
//! flushes the outbound bytes it accumulates in
//! [`write_buf_mut`][Engine::write_buf_mut]. [`Connection`][1] wires it to a
//! tokio socket; tests drive it with literal byte scripts.
//!
//! One operation is in flight at a time. Operations submitted while the
//! session is busy wait in a queue and are dispatched one by one as the
//! session re-enters `ready`; their completion futures resolve strictly in
//! submission order. While a transaction is open, submissions tagged with
//! its [`TxHandle`] run ahead of untagged ones, which wait in a second
//! queue until the transaction ends.
//!
//! [1]: crate::connection::Connection
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tokio::sync::oneshot;

use crate::{
    Error, Result,
    config::Config,
    error::{DbError, UnsupportedAuth},
    protocol::{
        BackendMessage, BackendProtocol, FrontendProtocol,
        backend::{Authentication, BackendKeyData, Fields},
        buffer::FrameBuffer,
        frontend,
    },
    result::{QueryResult, ResultGroup},
};

mod auth;
pub mod session;
pub mod txn;

pub use session::{Event, SessionState};
pub use txn::{TxEvent, TxHandle, TxPhase};

/// Completion side of one submitted operation.
pub type Reply = oneshot::Sender<Result<ResultGroup>>;

/// Everything the handshake produced, delivered on the first
/// `ReadyForQuery`.
#[derive(Debug)]
pub struct Handshake {
    pub key_data: Option<BackendKeyData>,
    pub parameters: HashMap<String, String>,
}

/// One deferrable protocol operation.
#[derive(Debug)]
pub enum Command {
    /// Simple query; the sql may hold several semicolon separated
    /// statements and yields one result per statement.
    Query { sql: String },
    Parse { statement: String, sql: String, param_oids: Vec<i32> },
    DescribeStatement { statement: String },
    DescribePortal { portal: String },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Bytes>>,
        result_formats: Vec<i16>,
    },
    Execute { portal: String, max_rows: i32 },
    ClosePortal { portal: String },
    CloseStatement { statement: String },
}

impl Command {
    fn sent_event(&self) -> Event {
        match self {
            Self::Query { .. } => Event::QuerySent,
            Self::Parse { .. } => Event::ParseSent,
            Self::DescribeStatement { .. } => Event::DescribeStatementSent,
            Self::DescribePortal { .. } => Event::DescribePortalSent,
            Self::Bind { .. } => Event::BindSent,
            Self::Execute { .. } => Event::ExecuteSent,
            Self::ClosePortal { .. } => Event::ClosePortalSent,
            Self::CloseStatement { .. } => Event::CloseStatementSent,
        }
    }
}

/// Transactional brackets ride the queue as pre-encoded simple queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bracket {
    Start,
    Commit,
    Rollback,
}

#[derive(Debug)]
enum Op {
    Command(Command),
    Bracket(Bracket),
}

#[derive(Debug)]
struct Pending {
    op: Op,
    reply: Option<Reply>,
}

/// Statement-registry bookkeeping to undo when the in-flight operation
/// fails: a failed Parse never prepared its name, a failed Close never
/// released it.
#[derive(Debug)]
enum StmtUndo {
    Parsed(String),
    Closed(String),
}

#[derive(Debug, Default)]
struct InFlight {
    bracket: Option<Bracket>,
    reply: Option<Reply>,
    stmt: Option<StmtUndo>,
}

/// The protocol engine of one connection.
pub struct Engine {
    buffer: FrameBuffer,
    write_buf: BytesMut,

    state: SessionState,
    phase: TxPhase,
    tx_handle: Option<TxHandle>,

    /// Operations of the current scope, dispatched one at a time.
    this_q: VecDeque<Pending>,
    /// Operations deferred until the open transaction ends.
    next_q: Option<VecDeque<Pending>>,
    in_flight: Option<InFlight>,
    group: Option<ResultGroup>,

    /// Statement names parsed on this connection and not yet closed;
    /// closing a name outside this set fails locally.
    statements: HashSet<String>,

    last_error: Option<Fields>,
    unsupported_auth: Option<&'static str>,

    parameters: HashMap<String, String>,
    key_data: Option<BackendKeyData>,
    tx_status: u8,

    connect: Option<oneshot::Sender<Result<Handshake>>>,
    user: String,
    password: String,

    begin_frame: Bytes,
    commit_frame: Bytes,
    rollback_frame: Bytes,
}

fn encoded_query(sql: &str) -> Bytes {
    let mut buf = BytesMut::new();
    frontend::write(frontend::Query { sql }, &mut buf);
    buf.freeze()
}

impl Engine {
    /// Create the engine for a fresh transport and queue the startup
    /// packet; `connect` resolves on the first `ReadyForQuery`.
    pub fn new(config: &Config, connect: oneshot::Sender<Result<Handshake>>) -> Self {
        let mut write_buf = BytesMut::with_capacity(1024);
        frontend::Startup {
            user: config.get_user(),
            database: config.get_dbname(),
        }
        .write(&mut write_buf);

        Self {
            buffer: FrameBuffer::new(),
            write_buf,
            state: SessionState::Startup,
            phase: TxPhase::None,
            tx_handle: None,
            this_q: VecDeque::new(),
            next_q: None,
            in_flight: None,
            group: None,
            statements: HashSet::new(),
            last_error: None,
            unsupported_auth: None,
            parameters: HashMap::new(),
            key_data: None,
            tx_status: 0,
            connect: Some(connect),
            user: config.get_user().to_owned(),
            password: config.get_password().to_owned(),
            begin_frame: encoded_query("BEGIN"),
            commit_frame: encoded_query("COMMIT"),
            rollback_frame: encoded_query("ROLLBACK"),
        }
    }

    // ===== Submission =====

    /// Submit an operation, optionally tagged with the transaction it
    /// belongs to. Dispatches immediately when the session is `ready`,
    /// queues otherwise; `reply` resolves when the operation finishes.
    pub fn submit(&mut self, command: Command, tx: Option<&TxHandle>, reply: Reply) {
        if self.state.is_terminal() {
            let _ = reply.send(Err(Error::closed()));
            return;
        }
        match &command {
            Command::Bind { param_formats, params, result_formats, .. } => {
                if let Err(err) = validate_bind(param_formats, params, result_formats) {
                    let _ = reply.send(Err(err));
                    return;
                }
            }
            Command::Parse { statement, .. } => {
                self.statements.insert(statement.clone());
            }
            Command::CloseStatement { statement } => {
                if !self.statements.remove(statement) {
                    let _ = reply.send(Err(Error::misuse("statement is not prepared on this connection")));
                    return;
                }
            }
            _ => {}
        }
        self.route(Pending { op: Op::Command(command), reply: Some(reply) }, tx);
    }

    /// Open a transaction: issues `BEGIN` and defers every untagged
    /// submission until the transaction ends. `reply` resolves once the
    /// `BEGIN` completes.
    pub fn begin(&mut self, handle: TxHandle, reply: Reply) {
        if self.state.is_terminal() {
            let _ = reply.send(Err(Error::closed()));
            return;
        }
        let Some(phase) = self.phase.apply(TxEvent::Start) else {
            let _ = reply.send(Err(Error::misuse("a transaction is already open on this connection")));
            return;
        };
        self.phase = phase;
        self.tx_handle = Some(handle);

        // everything already waiting belongs to no transaction; park it
        // until this one ends
        let waiting = std::mem::take(&mut self.this_q);
        match &mut self.next_q {
            Some(parked) => parked.extend(waiting),
            None => self.next_q = Some(waiting),
        }

        self.this_q.push_back(Pending { op: Op::Bracket(Bracket::Start), reply: Some(reply) });
        self.pump();
    }

    /// Issue `COMMIT` for the active transaction.
    pub fn commit(&mut self, handle: &TxHandle, reply: Reply) {
        self.finish_transaction(handle, Bracket::Commit, Some(reply));
    }

    /// Issue `ROLLBACK` for the active transaction. `reply` is optional so
    /// a guard drop can fire and forget.
    pub fn rollback(&mut self, handle: &TxHandle, reply: Option<Reply>) {
        self.finish_transaction(handle, Bracket::Rollback, reply);
    }

    fn finish_transaction(&mut self, handle: &TxHandle, bracket: Bracket, reply: Option<Reply>) {
        let fail = |reply: Option<Reply>, error: Error| {
            if let Some(reply) = reply {
                let _ = reply.send(Err(error));
            }
        };
        if self.state.is_terminal() {
            return fail(reply, Error::closed());
        }
        if self.tx_handle.as_ref() != Some(handle) {
            return fail(reply, Error::misuse("transaction is not active on this connection"));
        }
        let event = match bracket {
            Bracket::Commit => TxEvent::Commit,
            _ => TxEvent::Rollback,
        };
        let Some(phase) = self.phase.apply(event) else {
            return fail(reply, Error::misuse("transaction is not in a state to finish"));
        };
        self.phase = phase;
        self.this_q.push_back(Pending { op: Op::Bracket(bracket), reply });
        self.pump();
    }

    fn route(&mut self, pending: Pending, tx: Option<&TxHandle>) {
        let deferred = match (&self.tx_handle, tx) {
            (Some(active), Some(tag)) => active != tag,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if deferred {
            self.next_q.get_or_insert_default().push_back(pending);
        } else {
            self.this_q.push_back(pending);
            self.pump();
        }
    }

    /// Dispatch the head of the active queue when the session is idle.
    fn pump(&mut self) {
        if self.state != SessionState::Ready || self.in_flight.is_some() {
            return;
        }
        let Some(pending) = self.this_q.pop_front() else { return };
        self.dispatch(pending);
    }

    fn dispatch(&mut self, pending: Pending) {
        let Pending { op, reply } = pending;
        let (event, bracket, stmt) = match &op {
            Op::Bracket(bracket) => {
                let frame = match bracket {
                    Bracket::Start => &self.begin_frame,
                    Bracket::Commit => &self.commit_frame,
                    Bracket::Rollback => &self.rollback_frame,
                };
                self.write_buf.extend_from_slice(frame);
                (Event::QuerySent, Some(*bracket), None)
            }
            Op::Command(command) => {
                self.send_command(command);
                let stmt = match command {
                    Command::Parse { statement, .. } => Some(StmtUndo::Parsed(statement.clone())),
                    Command::CloseStatement { statement } => {
                        Some(StmtUndo::Closed(statement.clone()))
                    }
                    _ => None,
                };
                (command.sent_event(), None, stmt)
            }
        };
        self.in_flight = Some(InFlight { bracket, reply, stmt });
        self.transition(event);
    }

    /// Extended-query steps ride with a trailing `Flush` so the backend
    /// reports progress without waiting for `Sync`.
    fn send_command(&mut self, command: &Command) {
        match command {
            Command::Query { sql } => self.send(frontend::Query { sql }),
            Command::Parse { statement, sql, param_oids } => {
                self.send(frontend::Parse { statement, sql, param_oids });
                self.send(frontend::Flush);
            }
            Command::DescribeStatement { statement } => {
                self.send(frontend::Describe { kind: b'S', name: statement });
                self.send(frontend::Flush);
            }
            Command::DescribePortal { portal } => {
                self.send(frontend::Describe { kind: b'P', name: portal });
                self.send(frontend::Flush);
            }
            Command::Bind { portal, statement, param_formats, params, result_formats } => {
                self.send(frontend::Bind { portal, statement, param_formats, params, result_formats });
                self.send(frontend::Flush);
            }
            Command::Execute { portal, max_rows } => {
                self.send(frontend::Execute { portal, max_rows: *max_rows });
                self.send(frontend::Flush);
            }
            Command::ClosePortal { portal } => {
                self.send(frontend::Close { kind: b'P', name: portal });
                self.send(frontend::Flush);
            }
            Command::CloseStatement { statement } => {
                self.send(frontend::Close { kind: b'S', name: statement });
                self.send(frontend::Flush);
            }
        }
    }

    fn send<F: FrontendProtocol + fmt::Debug>(&mut self, message: F) {
        log::trace!("(F) {message:?}");
        frontend::write(message, &mut self.write_buf);
    }

    // ===== Inbound =====

    /// The inbound buffer, for the host to read socket bytes into.
    pub fn read_buf_mut(&mut self) -> &mut BytesMut {
        self.buffer.buf_mut()
    }

    /// Process every complete frame accumulated in the inbound buffer.
    ///
    /// An error is a protocol violation; the connection is already marked
    /// failed when one is returned.
    pub fn drive(&mut self) -> Result<()> {
        while let Some((msgtype, body)) = self.buffer.next_frame() {
            self.on_frame(msgtype, body)?;
        }
        Ok(())
    }

    /// Append a chunk of inbound bytes and process it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.buf_mut().extend_from_slice(chunk);
        self.drive()
    }

    fn on_frame(&mut self, msgtype: u8, body: Bytes) -> Result<()> {
        let message = match BackendMessage::decode(msgtype, body) {
            Ok(message) => message,
            Err(err) => {
                log::error!("protocol violation: {err}");
                self.fail_all(Error::closed());
                return Err(err.into());
            }
        };
        log::trace!("(B) {message:?}");
        self.on_message(message);
        Ok(())
    }

    fn on_message(&mut self, message: BackendMessage) {
        use BackendMessage as B;
        match message {
            B::Authentication(auth) => self.on_authentication(auth),
            B::BackendKeyData(key) => {
                self.key_data = Some(key);
                self.transition(Event::BackendKeyData);
            }
            B::ParameterStatus(status) => {
                self.parameters.insert(status.name, status.value);
                self.transition(Event::ParameterStatus);
            }
            B::ReadyForQuery(ready) => {
                self.tx_status = ready.status;
                self.transition(Event::ReadyForQuery);
            }
            B::NoticeResponse(notice) => {
                if self.in_flight.is_some() {
                    let map = notice.fields.to_map();
                    self.current().push_notice(map);
                } else {
                    log::warn!("{}", notice.fields.get(b'M').unwrap_or("notice"));
                }
                self.transition(Event::NoticeResponse);
            }
            B::ErrorResponse(error) => {
                self.last_error = Some(error.fields);
                self.transition(Event::ErrorResponse);
            }
            B::RowDescription(rd) => {
                if self.in_flight.is_some() {
                    self.current().set_columns(rd.columns);
                }
                self.transition(Event::RowDescription);
            }
            B::ParameterDescription(pd) => {
                if self.in_flight.is_some() {
                    self.current().set_parameter_oids(pd.oids);
                }
                self.transition(Event::ParameterDescription);
            }
            B::DataRow(row) => {
                if self.in_flight.is_some() {
                    self.current().push_row(row.values);
                }
                self.transition(Event::DataRow);
            }
            B::CommandComplete(complete) => {
                if self.in_flight.is_some() {
                    self.current().finish(complete.tag);
                }
                self.transition(Event::CommandComplete);
            }
            B::EmptyQueryResponse(_) => self.transition(Event::EmptyQueryResponse),
            B::ParseComplete(_) => self.transition(Event::ParseComplete),
            B::BindComplete(_) => self.transition(Event::BindComplete),
            B::CloseComplete(_) => self.transition(Event::CloseComplete),
            B::NoData(_) => self.transition(Event::NoData),
            B::PortalSuspended(_) => self.transition(Event::PortalSuspended),
            B::CopyInResponse(_) | B::CopyOutResponse(_) | B::CopyBothResponse(_) => {
                // no copy-data plumbing exists; the session cannot continue
                self.fail_all(Error::misuse("copy streaming is not supported"));
            }
        }
    }

    fn on_authentication(&mut self, auth: Authentication) {
        match auth {
            Authentication::Ok => self.transition(Event::AuthenticationOk),
            Authentication::CleartextPassword => {
                let password = std::mem::take(&mut self.password);
                self.send(frontend::PasswordMessage { password: &password });
                self.password = password;
                self.transition(Event::AuthenticationCleartextPassword);
            }
            Authentication::Md5Password { salt } => {
                let hashed = auth::md5_password(&self.user, &self.password, salt);
                self.send(frontend::PasswordMessage { password: &hashed });
                self.transition(Event::AuthenticationMd5Password);
            }
            other => {
                self.unsupported_auth = Some(other.method());
                self.transition(Event::AuthenticationUnsupported);
            }
        }
    }

    // ===== Transitions and entry actions =====

    fn transition(&mut self, event: Event) {
        let Some(next) = self.state.apply(event) else {
            log::trace!("{:?} ignores {event:?}", self.state);
            return;
        };
        if next == self.state {
            return;
        }
        log::trace!("{:?} -> {next:?} on {event:?}", self.state);
        self.state = next;
        self.enter(next);
    }

    fn enter(&mut self, state: SessionState) {
        use SessionState as S;
        match state {
            S::Ready => self.on_ready(),
            S::QueryFailed => self.fail_in_flight(true, false),
            S::ExecuteFailed => self.fail_in_flight(true, true),
            S::ParseFailed | S::BindFailed => {
                self.fail_in_flight(false, true);
                self.transition(Event::ErrorReset);
            }
            S::ClosePortalFailed | S::CloseStatementFailed => self.fail_in_flight(false, true),
            S::ConnectionFailed => {
                let fields = self.last_error.take().unwrap_or_default();
                self.fail_all(DbError::new(fields).into());
            }
            S::UnsupportedAuthMethod => {
                let method = self.unsupported_auth.take().unwrap_or("unknown");
                self.fail_all(UnsupportedAuth(method).into());
            }
            _ => {}
        }
    }

    /// Entering `ready` finishes the previous operation and dispatches the
    /// next queued one. The finished waiter resolves after the dispatch so
    /// the next command is on the wire first; completion through the
    /// channel never re-enters the engine.
    fn on_ready(&mut self) {
        if let Some(connect) = self.connect.take() {
            let _ = connect.send(Ok(Handshake {
                key_data: self.key_data,
                parameters: self.parameters.clone(),
            }));
        }

        let in_flight = self.in_flight.take();
        let group = self.group.take().unwrap_or_default();

        if let Some(bracket) = in_flight.as_ref().and_then(|f| f.bracket) {
            if let Some(phase) = self.phase.apply(TxEvent::CommandComplete) {
                self.phase = phase;
            }
            if matches!(bracket, Bracket::Commit | Bracket::Rollback) {
                self.end_transaction();
            }
        }

        self.pump();

        if let Some(InFlight { reply: Some(reply), .. }) = in_flight {
            let _ = reply.send(Ok(group));
        }
    }

    fn fail_in_flight(&mut self, attach_partial: bool, resync: bool) {
        let fields = self.last_error.take().unwrap_or_default();
        let partial = match attach_partial {
            true => self.group.take(),
            false => {
                self.group = None;
                None
            }
        };
        let error = DbError::with_partial(fields, partial);

        let InFlight { bracket, reply, stmt } = self.in_flight.take().unwrap_or_default();

        // the registry claimed this at submit time; the failure says the
        // server never did
        match stmt {
            Some(StmtUndo::Parsed(name)) => {
                self.statements.remove(&name);
            }
            Some(StmtUndo::Closed(name)) => {
                self.statements.insert(name);
            }
            None => {}
        }

        match reply {
            Some(reply) => {
                let _ = reply.send(Err(error.into()));
            }
            None => log::error!("{error}"),
        }

        // a failed BEGIN/COMMIT/ROLLBACK closes the transaction scope
        if bracket.is_some() {
            self.end_transaction();
        }

        if resync {
            self.send(frontend::Sync);
        }
    }

    /// Swap the deferred queue back in once a transaction ends. Tagged
    /// submissions that never ran cannot run outside their transaction and
    /// fail here.
    fn end_transaction(&mut self) {
        self.phase = TxPhase::None;
        self.tx_handle = None;
        for stale in self.this_q.drain(..) {
            if let Some(reply) = stale.reply {
                let _ = reply.send(Err(Error::misuse("transaction ended before the operation ran")));
            }
        }
        self.this_q = self.next_q.take().unwrap_or_default();
    }

    /// Fail every outstanding waiter and mark the connection unusable.
    /// `error` goes to the oldest waiter, the rest observe a closed
    /// connection.
    pub fn fail_all(&mut self, error: Error) {
        self.state = SessionState::ConnectionFailed;
        let mut error = Some(error);

        if let Some(connect) = self.connect.take() {
            let _ = connect.send(Err(error.take().unwrap_or_else(Error::closed)));
        }
        if let Some(InFlight { reply: Some(reply), .. }) = self.in_flight.take() {
            let _ = reply.send(Err(error.take().unwrap_or_else(Error::closed)));
        }
        for pending in self.this_q.drain(..).chain(self.next_q.take().unwrap_or_default()) {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(Error::closed()));
            }
        }
        if let Some(error) = error {
            log::error!("connection failed: {error}");
        }
        self.group = None;
        self.statements.clear();
        self.phase = TxPhase::None;
        self.tx_handle = None;
    }

    /// Queue the `Terminate` message for a graceful shutdown.
    pub fn terminate(&mut self) {
        self.send(frontend::Terminate);
    }

    fn current(&mut self) -> &mut QueryResult {
        self.group.get_or_insert_default().current()
    }

    // ===== Observers =====

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tx_phase(&self) -> TxPhase {
        self.phase
    }

    /// Transaction status byte of the last `ReadyForQuery`: `'I'` idle,
    /// `'T'` in a transaction, `'E'` in a failed transaction.
    pub fn transaction_status(&self) -> u8 {
        self.tx_status
    }

    pub fn backend_key_data(&self) -> Option<BackendKeyData> {
        self.key_data
    }

    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// The outbound buffer, for the host to flush to the socket.
    pub fn write_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("phase", &self.phase)
            .field("queued", &self.this_q.len())
            .field("deferred", &self.next_q.as_ref().map_or(0, VecDeque::len))
            .finish()
    }
}

fn validate_bind(
    param_formats: &[i16],
    params: &[Option<Bytes>],
    result_formats: &[i16],
) -> Result<()> {
    for format in param_formats.iter().chain(result_formats) {
        if !matches!(format, 0 | 1) {
            return Err(Error::misuse("format code must be 0 (text) or 1 (binary)"));
        }
    }
    if !matches!(param_formats.len(), 0 | 1) && param_formats.len() != params.len() {
        return Err(Error::misuse("parameter format count must be zero, one, or the parameter count"));
    }
    Ok(())
}

#[cfg(test)]
mod test;
