use bytes::Bytes;
use tokio::sync::oneshot;

use super::*;
use crate::config::Config;

// ===== backend byte script builders =====

fn frame(msgtype: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = vec![msgtype];
    buf.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

fn auth_ok() -> Vec<u8> {
    frame(b'R', &0i32.to_be_bytes())
}

fn key_data(pid: i32, secret: i32) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(&secret.to_be_bytes());
    frame(b'K', &body)
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    frame(b'S', &body)
}

fn ready(status: u8) -> Vec<u8> {
    frame(b'Z', &[status])
}

fn row_description(columns: &[(&str, i32)]) -> Vec<u8> {
    let mut body = (columns.len() as u16).to_be_bytes().to_vec();
    for (name, type_oid) in columns {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_be_bytes()); // table oid
        body.extend_from_slice(&0i16.to_be_bytes()); // attribute
        body.extend_from_slice(&type_oid.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes()); // type size
        body.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        body.extend_from_slice(&0i16.to_be_bytes()); // format
    }
    frame(b'T', &body)
}

fn data_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut body = (values.len() as u16).to_be_bytes().to_vec();
    for value in values {
        match value {
            Some(text) => {
                body.extend_from_slice(&(text.len() as i32).to_be_bytes());
                body.extend_from_slice(text.as_bytes());
            }
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    frame(b'D', &body)
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = tag.as_bytes().to_vec();
    body.push(0);
    frame(b'C', &body)
}

fn parameter_description(oids: &[i32]) -> Vec<u8> {
    let mut body = (oids.len() as u16).to_be_bytes().to_vec();
    for oid in oids {
        body.extend_from_slice(&oid.to_be_bytes());
    }
    frame(b't', &body)
}

fn error_response(fields: &[(u8, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (tag, value) in fields {
        body.push(*tag);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    frame(b'E', &body)
}

fn syntax_error() -> Vec<u8> {
    error_response(&[
        (b'S', "ERROR"),
        (b'C', "42601"),
        (b'M', "syntax error at or near \"SELECTx\""),
    ])
}

fn notice_response(message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(b'S');
    body.extend_from_slice(b"NOTICE\0");
    body.push(b'M');
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body.push(0);
    frame(b'N', &body)
}

// ===== engine drivers =====

fn new_engine() -> (Engine, oneshot::Receiver<Result<Handshake>>) {
    let config = Config::new().user("jim").password("secret").dbname("inventory");
    let (tx, rx) = oneshot::channel();
    (Engine::new(&config, tx), rx)
}

/// Engine with the handshake already played out and buffers drained.
fn connected() -> Engine {
    let (mut engine, mut rx) = new_engine();
    engine.feed(&auth_ok()).unwrap();
    engine.feed(&parameter_status("server_version", "17.2")).unwrap();
    engine.feed(&key_data(1234, 12345678)).unwrap();
    engine.feed(&ready(b'I')).unwrap();
    rx.try_recv().unwrap().unwrap();
    engine.write_buf_mut().clear();
    engine
}

fn taken(engine: &mut Engine) -> Vec<u8> {
    engine.write_buf_mut().split().to_vec()
}

fn submit_query(engine: &mut Engine, sql: &str) -> oneshot::Receiver<Result<ResultGroup>> {
    submit_query_in(engine, sql, None)
}

fn submit_query_in(
    engine: &mut Engine,
    sql: &str,
    tx: Option<&TxHandle>,
) -> oneshot::Receiver<Result<ResultGroup>> {
    let (reply, rx) = oneshot::channel();
    engine.submit(Command::Query { sql: sql.into() }, tx, reply);
    rx
}

fn submit(
    engine: &mut Engine,
    command: Command,
) -> oneshot::Receiver<Result<ResultGroup>> {
    let (reply, rx) = oneshot::channel();
    engine.submit(command, None, reply);
    rx
}

fn texts(result: &QueryResult) -> Vec<Vec<&str>> {
    (0..result.rows().len())
        .map(|row| {
            (0..result.rows()[row].len())
                .map(|col| result.value(row, col).unwrap())
                .collect()
        })
        .collect()
}

// ===== handshake =====

#[test]
fn startup_packet_on_construction() {
    let (mut engine, _rx) = new_engine();
    assert_eq!(
        taken(&mut engine),
        b"\x00\x00\x00\x25\x00\x03\x00\x00user\0jim\0database\0inventory\0\0",
    );
    assert_eq!(engine.state(), SessionState::Startup);
}

#[test]
fn handshake_completes_on_first_ready() {
    let (mut engine, mut rx) = new_engine();
    engine.feed(&auth_ok()).unwrap();
    assert_eq!(engine.state(), SessionState::ReceiveServerData);

    engine.feed(&parameter_status("city", "Fort Lauderdale")).unwrap();
    engine.feed(&key_data(1234, 12345678)).unwrap();
    assert!(rx.try_recv().is_err());

    engine.feed(&ready(b'I')).unwrap();
    let handshake = rx.try_recv().unwrap().unwrap();
    assert_eq!(handshake.key_data.unwrap().process_id, 1234);
    assert_eq!(handshake.key_data.unwrap().secret_key, 12345678);
    assert_eq!(handshake.parameters["city"], "Fort Lauderdale");
    assert_eq!(engine.state(), SessionState::Ready);
    assert_eq!(engine.transaction_status(), b'I');
}

#[test]
fn md5_challenge_answered() {
    let (mut engine, _rx) = new_engine();
    engine.write_buf_mut().clear();

    let mut body = 5i32.to_be_bytes().to_vec();
    body.extend_from_slice(b"abcd");
    engine.feed(&frame(b'R', &body)).unwrap();

    assert_eq!(engine.state(), SessionState::Authorizing);
    assert_eq!(
        taken(&mut engine),
        frame(b'p', b"md59625bf463b81c6bcb14d00f510688fad\0"),
    );
}

#[test]
fn cleartext_challenge_answered() {
    let (mut engine, _rx) = new_engine();
    engine.write_buf_mut().clear();

    engine.feed(&frame(b'R', &3i32.to_be_bytes())).unwrap();
    assert_eq!(taken(&mut engine), frame(b'p', b"secret\0"));
}

#[test]
fn unsupported_auth_fails_connect() {
    let (mut engine, mut rx) = new_engine();
    engine.feed(&frame(b'R', &2i32.to_be_bytes())).unwrap();

    assert_eq!(engine.state(), SessionState::UnsupportedAuthMethod);
    let err = rx.try_recv().unwrap().unwrap_err();
    assert!(matches!(err.kind(), crate::ErrorKind::UnsupportedAuth(_)));
}

#[test]
fn startup_error_fails_connect() {
    let (mut engine, mut rx) = new_engine();
    engine
        .feed(&error_response(&[
            (b'S', "FATAL"),
            (b'C', "28P01"),
            (b'M', "password authentication failed for user \"jim\""),
        ]))
        .unwrap();

    assert_eq!(engine.state(), SessionState::ConnectionFailed);
    let err = rx.try_recv().unwrap().unwrap_err();
    assert!(err.as_db().unwrap().message().contains("authentication failed"));

    // the connection accepts nothing afterwards
    let mut rx = submit_query(&mut engine, "SELECT 1");
    assert!(matches!(
        rx.try_recv().unwrap().unwrap_err().kind(),
        crate::ErrorKind::Closed,
    ));
}

// ===== simple query =====

#[test]
fn simple_query_roundtrip() {
    let mut engine = connected();
    let mut rx = submit_query(&mut engine, "select * from people");

    assert_eq!(taken(&mut engine), b"Q\x00\x00\x00\x19select * from people\0");
    assert_eq!(engine.state(), SessionState::QueryInProgress);

    engine.feed(&row_description(&[("name", 25)])).unwrap();
    engine.feed(&data_row(&[Some("moses")])).unwrap();
    assert_eq!(engine.state(), SessionState::RowsetQueryInProgress);

    engine.feed(&command_complete("SELECT 1")).unwrap();
    engine.feed(&ready(b'I')).unwrap();

    let group = rx.try_recv().unwrap().unwrap();
    let result = group.into_single();
    assert_eq!(texts(&result), [["moses"]]);
    assert_eq!(result.columns().unwrap()[0].name, "name");
    assert_eq!(result.tag(), Some("SELECT 1"));
    assert_eq!(result.rows_affected(), Some(1));
}

#[test]
fn multi_statement_batch_yields_a_group() {
    let mut engine = connected();
    let mut rx = submit_query(&mut engine, "SELECT 1; SELECT 2");
    taken(&mut engine);

    engine.feed(&row_description(&[("?column?", 23)])).unwrap();
    engine.feed(&data_row(&[Some("1")])).unwrap();
    engine.feed(&command_complete("SELECT 1")).unwrap();
    engine.feed(&row_description(&[("?column?", 23)])).unwrap();
    engine.feed(&data_row(&[Some("2")])).unwrap();
    engine.feed(&command_complete("SELECT 1")).unwrap();
    engine.feed(&ready(b'I')).unwrap();

    let group = rx.try_recv().unwrap().unwrap();
    assert_eq!(group.len(), 2);
    assert_eq!(texts(&group.results()[0]), [["1"]]);
    assert_eq!(texts(&group.results()[1]), [["2"]]);
}

#[test]
fn null_values_survive_the_row() {
    let mut engine = connected();
    let mut rx = submit_query(&mut engine, "SELECT NULL, 'x'");
    taken(&mut engine);

    engine.feed(&row_description(&[("a", 25), ("b", 25)])).unwrap();
    engine.feed(&data_row(&[None, Some("x")])).unwrap();
    engine.feed(&command_complete("SELECT 1")).unwrap();
    engine.feed(&ready(b'I')).unwrap();

    let result = rx.try_recv().unwrap().unwrap().into_single();
    assert_eq!(result.rows()[0][0], None);
    assert_eq!(result.rows()[0][1].as_deref(), Some(&b"x"[..]));
}

#[test]
fn empty_query_completes() {
    let mut engine = connected();
    let mut rx = submit_query(&mut engine, "");
    taken(&mut engine);

    engine.feed(&frame(b'I', b"")).unwrap();
    assert_eq!(engine.state(), SessionState::EmptyQueryInProgress);
    engine.feed(&ready(b'I')).unwrap();

    let group = rx.try_recv().unwrap().unwrap();
    assert_eq!(group.first().tag(), None);
    assert_eq!(engine.state(), SessionState::Ready);
}

#[test]
fn notices_attach_to_the_current_result() {
    let mut engine = connected();
    let mut rx = submit_query(&mut engine, "CREATE TABLE alpha (id SERIAL)");
    taken(&mut engine);

    engine
        .feed(&notice_response(
            "CREATE TABLE will create implicit sequence \"alpha_id_seq\"",
        ))
        .unwrap();
    engine.feed(&command_complete("CREATE TABLE")).unwrap();
    engine.feed(&ready(b'I')).unwrap();

    let result = rx.try_recv().unwrap().unwrap().into_single();
    assert_eq!(result.notices().len(), 1);
    assert!(result.notices()[0]["Message"].contains("create implicit sequence"));
    assert_eq!(result.tag(), Some("CREATE TABLE"));
}

// ===== ordering =====

#[test]
fn second_submission_waits_for_the_first() {
    let mut engine = connected();
    let mut rx1 = submit_query(&mut engine, "SELECT 1");
    let mut rx2 = submit_query(&mut engine, "SELECT 2");

    let sent = taken(&mut engine);
    assert!(sent.windows(8).any(|w| w == b"SELECT 1"));
    assert!(!sent.windows(8).any(|w| w == b"SELECT 2"));
    assert!(rx2.try_recv().is_err());

    engine.feed(&row_description(&[("?column?", 23)])).unwrap();
    engine.feed(&data_row(&[Some("1")])).unwrap();
    engine.feed(&command_complete("SELECT 1")).unwrap();
    engine.feed(&ready(b'I')).unwrap();

    // the first completes and the second goes on the wire
    rx1.try_recv().unwrap().unwrap();
    let sent = taken(&mut engine);
    assert!(sent.windows(8).any(|w| w == b"SELECT 2"));

    engine.feed(&row_description(&[("?column?", 23)])).unwrap();
    engine.feed(&data_row(&[Some("2")])).unwrap();
    engine.feed(&command_complete("SELECT 1")).unwrap();
    engine.feed(&ready(b'I')).unwrap();
    rx2.try_recv().unwrap().unwrap();
}

// ===== error recovery =====

#[test]
fn query_error_surfaces_and_recovers() {
    let mut engine = connected();
    let mut rx = submit_query(&mut engine, "SELECTx 1");
    taken(&mut engine);

    engine.feed(&syntax_error()).unwrap();
    let err = rx.try_recv().unwrap().unwrap_err();
    assert!(err.as_db().unwrap().message().contains("syntax error"));
    assert_eq!(err.as_db().unwrap().code(), "42601");
    assert_eq!(engine.state(), SessionState::QueryFailed);

    engine.feed(&ready(b'I')).unwrap();
    assert_eq!(engine.state(), SessionState::Ready);

    let mut rx = submit_query(&mut engine, "SELECT 1");
    taken(&mut engine);
    engine.feed(&command_complete("SELECT 0")).unwrap();
    engine.feed(&ready(b'I')).unwrap();
    rx.try_recv().unwrap().unwrap();
}

#[test]
fn query_error_carries_partial_result() {
    let mut engine = connected();
    let mut rx = submit_query(&mut engine, "SELECT 1; SELECTx 2");
    taken(&mut engine);

    engine.feed(&row_description(&[("?column?", 23)])).unwrap();
    engine.feed(&data_row(&[Some("1")])).unwrap();
    engine.feed(&command_complete("SELECT 1")).unwrap();
    engine.feed(&syntax_error()).unwrap();

    let err = rx.try_recv().unwrap().unwrap_err();
    let partial = err.as_db().unwrap().partial().unwrap();
    assert_eq!(texts(&partial.results()[0]), [["1"]]);
}

#[test]
fn parse_error_resyncs_before_next_work() {
    let mut engine = connected();
    let mut rx = submit(&mut engine, Command::Parse {
        statement: "stmt_1".into(),
        sql: "SELECTx 1".into(),
        param_oids: vec![],
    });
    taken(&mut engine);

    engine.feed(&syntax_error()).unwrap();
    rx.try_recv().unwrap().unwrap_err();
    // a Sync went out and the session stays parked until ReadyForQuery
    assert_eq!(taken(&mut engine), b"S\x00\x00\x00\x04");
    assert_eq!(engine.state(), SessionState::Syncing);

    let mut rx = submit_query(&mut engine, "SELECT 1");
    assert!(taken(&mut engine).is_empty());

    engine.feed(&ready(b'I')).unwrap();
    assert!(taken(&mut engine).windows(8).any(|w| w == b"SELECT 1"));
    engine.feed(&command_complete("SELECT 0")).unwrap();
    engine.feed(&ready(b'I')).unwrap();
    rx.try_recv().unwrap().unwrap();
}

#[test]
fn execute_error_resyncs_and_recovers() {
    let mut engine = connected();
    let mut rx = submit(&mut engine, Command::Execute { portal: "p1".into(), max_rows: 0 });
    taken(&mut engine);

    engine.feed(&data_row(&[Some("1")])).unwrap();
    engine
        .feed(&error_response(&[(b'S', "ERROR"), (b'C', "22012"), (b'M', "division by zero")]))
        .unwrap();

    let err = rx.try_recv().unwrap().unwrap_err();
    let db = err.as_db().unwrap();
    assert_eq!(db.message(), "division by zero");
    assert_eq!(texts(db.partial().unwrap().first()), [["1"]]);

    assert_eq!(taken(&mut engine), b"S\x00\x00\x00\x04");
    assert_eq!(engine.state(), SessionState::ExecuteFailed);
    engine.feed(&ready(b'I')).unwrap();
    assert_eq!(engine.state(), SessionState::Ready);
}

#[test]
fn bind_misuse_fails_locally() {
    let mut engine = connected();
    let mut rx = submit(&mut engine, Command::Bind {
        portal: "p".into(),
        statement: "s".into(),
        param_formats: vec![3],
        params: vec![],
        result_formats: vec![],
    });
    assert!(taken(&mut engine).is_empty());
    assert!(matches!(
        rx.try_recv().unwrap().unwrap_err().kind(),
        crate::ErrorKind::Misuse(_),
    ));

    let mut rx = submit(&mut engine, Command::Bind {
        portal: "p".into(),
        statement: "s".into(),
        param_formats: vec![0, 0],
        params: vec![Some(Bytes::from_static(b"1"))],
        result_formats: vec![],
    });
    assert!(matches!(
        rx.try_recv().unwrap().unwrap_err().kind(),
        crate::ErrorKind::Misuse(_),
    ));
}

#[test]
fn closing_an_unprepared_statement_fails_locally() {
    let mut engine = connected();
    let mut rx = submit(&mut engine, Command::CloseStatement { statement: "nope".into() });
    assert!(taken(&mut engine).is_empty());
    assert!(matches!(
        rx.try_recv().unwrap().unwrap_err().kind(),
        crate::ErrorKind::Misuse(_),
    ));
}

#[test]
fn a_statement_closes_once() {
    let mut engine = connected();
    let mut parse = submit(&mut engine, Command::Parse {
        statement: "s1".into(),
        sql: "SELECT 1".into(),
        param_oids: vec![],
    });
    taken(&mut engine);
    engine.feed(&frame(b'1', b"")).unwrap();
    parse.try_recv().unwrap().unwrap();

    let mut close = submit(&mut engine, Command::CloseStatement { statement: "s1".into() });
    taken(&mut engine);
    engine.feed(&frame(b'3', b"")).unwrap();
    close.try_recv().unwrap().unwrap();

    // the name was released; a second close has nothing to close
    let mut again = submit(&mut engine, Command::CloseStatement { statement: "s1".into() });
    assert!(taken(&mut engine).is_empty());
    assert!(matches!(
        again.try_recv().unwrap().unwrap_err().kind(),
        crate::ErrorKind::Misuse(_),
    ));
}

#[test]
fn a_failed_parse_leaves_nothing_to_close() {
    let mut engine = connected();
    let mut parse = submit(&mut engine, Command::Parse {
        statement: "bad".into(),
        sql: "SELECTx 1".into(),
        param_oids: vec![],
    });
    taken(&mut engine);

    engine.feed(&syntax_error()).unwrap();
    parse.try_recv().unwrap().unwrap_err();
    assert_eq!(taken(&mut engine), b"S\x00\x00\x00\x04");

    let mut close = submit(&mut engine, Command::CloseStatement { statement: "bad".into() });
    assert!(taken(&mut engine).is_empty());
    assert!(matches!(
        close.try_recv().unwrap().unwrap_err().kind(),
        crate::ErrorKind::Misuse(_),
    ));
}

// ===== extended query =====

#[test]
fn extended_query_cycle() {
    let mut engine = connected();

    let mut parse = submit(&mut engine, Command::Parse {
        statement: "stmt_1".into(),
        sql: "SELECT $1::int AS t_int, $2::varchar(30) AS t_varchar".into(),
        param_oids: vec![],
    });
    let sent = taken(&mut engine);
    assert_eq!(sent[0], b'P');
    assert_eq!(&sent[sent.len() - 5..], b"H\x00\x00\x00\x04");

    engine.feed(&frame(b'1', b"")).unwrap();
    parse.try_recv().unwrap().unwrap();

    let mut describe = submit(&mut engine, Command::DescribeStatement { statement: "stmt_1".into() });
    let sent = taken(&mut engine);
    assert_eq!(&sent[..2], b"D\x00");

    engine.feed(&parameter_description(&[23, 1043])).unwrap();
    engine.feed(&row_description(&[("t_int", 23), ("t_varchar", 1043)])).unwrap();

    let described = describe.try_recv().unwrap().unwrap().into_single();
    assert_eq!(described.parameter_oids(), Some(&[23, 1043][..]));
    let columns = described.columns().unwrap();
    assert_eq!(columns[0].name, "t_int");
    assert_eq!(columns[1].name, "t_varchar");

    let mut bind = submit(&mut engine, Command::Bind {
        portal: "port_1_0".into(),
        statement: "stmt_1".into(),
        param_formats: vec![],
        params: vec![
            Some(Bytes::from_static(b"12345")),
            Some(Bytes::from_static(b"This is a test")),
        ],
        result_formats: vec![],
    });
    let sent = taken(&mut engine);
    assert_eq!(sent[0], b'B');
    engine.feed(&frame(b'2', b"")).unwrap();
    bind.try_recv().unwrap().unwrap();

    let mut execute = submit(&mut engine, Command::Execute { portal: "port_1_0".into(), max_rows: 0 });
    taken(&mut engine);
    engine.feed(&data_row(&[Some("12345"), Some("This is a test")])).unwrap();
    engine.feed(&command_complete("SELECT 1")).unwrap();

    let result = execute.try_recv().unwrap().unwrap().into_single();
    assert_eq!(texts(&result), [["12345", "This is a test"]]);
    assert_eq!(engine.state(), SessionState::Ready);

    let mut close = submit(&mut engine, Command::CloseStatement { statement: "stmt_1".into() });
    taken(&mut engine);
    engine.feed(&frame(b'3', b"")).unwrap();
    close.try_recv().unwrap().unwrap();
}

#[test]
fn describe_no_data_statement() {
    let mut engine = connected();
    let mut describe = submit(&mut engine, Command::DescribeStatement { statement: "s".into() });
    taken(&mut engine);

    engine.feed(&parameter_description(&[23])).unwrap();
    engine.feed(&frame(b'n', b"")).unwrap();

    let described = describe.try_recv().unwrap().unwrap().into_single();
    assert_eq!(described.parameter_oids(), Some(&[23][..]));
    assert_eq!(described.columns(), None);
}

#[test]
fn portal_suspension_completes_the_execute() {
    let mut engine = connected();
    let mut execute = submit(&mut engine, Command::Execute { portal: "p1".into(), max_rows: 2 });
    taken(&mut engine);

    engine.feed(&data_row(&[Some("1")])).unwrap();
    engine.feed(&data_row(&[Some("2")])).unwrap();
    engine.feed(&frame(b's', b"")).unwrap();

    let result = execute.try_recv().unwrap().unwrap().into_single();
    assert_eq!(texts(&result), [["1"], ["2"]]);
    assert_eq!(result.tag(), None);
    assert_eq!(engine.state(), SessionState::Ready);
}

// ===== transactions =====

fn open_transaction(engine: &mut Engine) -> TxHandle {
    let handle = TxHandle::new();
    let (reply, mut rx) = oneshot::channel();
    engine.begin(handle.clone(), reply);
    assert_eq!(taken(engine), b"Q\x00\x00\x00\x0aBEGIN\0");
    engine.feed(&command_complete("BEGIN")).unwrap();
    engine.feed(&ready(b'T')).unwrap();
    rx.try_recv().unwrap().unwrap();
    handle
}

#[test]
fn commit_cycle_on_the_wire() {
    let mut engine = connected();
    let handle = open_transaction(&mut engine);
    assert_eq!(engine.tx_phase(), TxPhase::Active);

    let mut insert = submit_query_in(&mut engine, "INSERT INTO t VALUES (1)", Some(&handle));
    assert!(taken(&mut engine).windows(6).any(|w| w == b"INSERT"));
    engine.feed(&command_complete("INSERT 0 1")).unwrap();
    engine.feed(&ready(b'T')).unwrap();
    insert.try_recv().unwrap().unwrap();

    let (reply, mut commit) = oneshot::channel();
    engine.commit(&handle, reply);
    assert_eq!(taken(&mut engine), b"Q\x00\x00\x00\x0bCOMMIT\0");
    engine.feed(&command_complete("COMMIT")).unwrap();
    engine.feed(&ready(b'I')).unwrap();
    commit.try_recv().unwrap().unwrap();
    assert_eq!(engine.tx_phase(), TxPhase::None);
}

#[test]
fn untagged_submissions_wait_for_the_transaction() {
    let mut engine = connected();
    let handle = open_transaction(&mut engine);

    // belongs to no transaction: parked
    let mut outside = submit_query(&mut engine, "SELECT 3");
    assert!(taken(&mut engine).is_empty());

    // tagged: runs now
    let mut inside = submit_query_in(&mut engine, "SELECT 2", Some(&handle));
    assert!(taken(&mut engine).windows(8).any(|w| w == b"SELECT 2"));
    engine.feed(&command_complete("SELECT 0")).unwrap();
    engine.feed(&ready(b'T')).unwrap();
    inside.try_recv().unwrap().unwrap();
    assert!(outside.try_recv().is_err());

    let (reply, mut commit) = oneshot::channel();
    engine.commit(&handle, reply);
    taken(&mut engine);
    engine.feed(&command_complete("COMMIT")).unwrap();
    engine.feed(&ready(b'I')).unwrap();
    commit.try_recv().unwrap().unwrap();

    // the parked submission dispatched as the transaction ended
    assert!(taken(&mut engine).windows(8).any(|w| w == b"SELECT 3"));
    engine.feed(&command_complete("SELECT 0")).unwrap();
    engine.feed(&ready(b'I')).unwrap();
    outside.try_recv().unwrap().unwrap();
}

#[test]
fn foreign_handle_is_deferred_too() {
    let mut engine = connected();
    let handle = open_transaction(&mut engine);

    let stranger = TxHandle::new();
    let mut foreign = submit_query_in(&mut engine, "SELECT 9", Some(&stranger));
    assert!(taken(&mut engine).is_empty());
    assert!(foreign.try_recv().is_err());

    let (reply, _commit) = oneshot::channel();
    engine.commit(&handle, reply);
    taken(&mut engine);
    engine.feed(&command_complete("COMMIT")).unwrap();
    engine.feed(&ready(b'I')).unwrap();

    assert!(taken(&mut engine).windows(8).any(|w| w == b"SELECT 9"));
}

#[test]
fn rollback_ends_the_transaction() {
    let mut engine = connected();
    let handle = open_transaction(&mut engine);

    let (reply, mut rollback) = oneshot::channel();
    engine.rollback(&handle, Some(reply));
    assert_eq!(taken(&mut engine), b"Q\x00\x00\x00\x0dROLLBACK\0");
    engine.feed(&command_complete("ROLLBACK")).unwrap();
    engine.feed(&ready(b'I')).unwrap();
    rollback.try_recv().unwrap().unwrap();
    assert_eq!(engine.tx_phase(), TxPhase::None);
}

#[test]
fn nested_begin_rejected() {
    let mut engine = connected();
    let _handle = open_transaction(&mut engine);

    let (reply, mut rx) = oneshot::channel();
    engine.begin(TxHandle::new(), reply);
    assert!(matches!(
        rx.try_recv().unwrap().unwrap_err().kind(),
        crate::ErrorKind::Misuse(_),
    ));
}

#[test]
fn commit_with_wrong_handle_rejected() {
    let mut engine = connected();
    let _handle = open_transaction(&mut engine);

    let (reply, mut rx) = oneshot::channel();
    engine.commit(&TxHandle::new(), reply);
    assert!(matches!(
        rx.try_recv().unwrap().unwrap_err().kind(),
        crate::ErrorKind::Misuse(_),
    ));
}

#[test]
fn tagged_submission_after_commit_fails_at_pop() {
    let mut engine = connected();
    let handle = open_transaction(&mut engine);

    let (reply, _commit) = oneshot::channel();
    engine.commit(&handle, reply);
    // still tagged with the ending transaction, queued behind COMMIT
    let mut late = submit_query_in(&mut engine, "SELECT 5", Some(&handle));

    taken(&mut engine);
    engine.feed(&command_complete("COMMIT")).unwrap();
    engine.feed(&ready(b'I')).unwrap();

    assert!(matches!(
        late.try_recv().unwrap().unwrap_err().kind(),
        crate::ErrorKind::Misuse(_),
    ));
}

// ===== transport failure =====

#[test]
fn fail_all_unblocks_every_waiter() {
    let mut engine = connected();
    let mut rx1 = submit_query(&mut engine, "SELECT 1");
    let mut rx2 = submit_query(&mut engine, "SELECT 2");

    engine.fail_all(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into());

    assert!(matches!(rx1.try_recv().unwrap().unwrap_err().kind(), crate::ErrorKind::Io(_)));
    assert!(matches!(rx2.try_recv().unwrap().unwrap_err().kind(), crate::ErrorKind::Closed));
    assert_eq!(engine.state(), SessionState::ConnectionFailed);
}

#[test]
fn undecodable_frame_is_a_protocol_violation() {
    let mut engine = connected();
    let err = engine.feed(&frame(b'?', b"")).unwrap_err();
    assert!(matches!(err.kind(), crate::ErrorKind::Protocol(_)));
    assert_eq!(engine.state(), SessionState::ConnectionFailed);
}
