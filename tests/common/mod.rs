//! Test doubles: an in-process PostgreSQL partition speaking just enough of
//! the v3 wire protocol to drive the engine end to end, plus host-side
//! hooks and hash sources.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use postgres_protocol::authentication;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pgfanout::{HashSource, HostHooks, Notice, PgValue, Result};

const PROTOCOL_V3: i32 = 196_608;
const CANCEL_CODE: i32 = 80_877_102;

/// Configuration of one mock partition backend.
#[derive(Clone)]
pub struct MockConfig {
    pub server_version: String,
    pub client_encoding: String,
    /// Rows per tuple result.
    pub rows: usize,
    /// Make the first result column echo the bound parameters, joined
    /// with `|`, instead of a fixed payload.
    pub echo_params: bool,
    /// Password to demand at login.
    pub password: Option<String>,
    /// How the password is challenged when one is configured.
    pub auth_method: AuthMethod,
    /// Mechanisms advertised by the SASL challenge.
    pub sasl_mechanisms: Vec<String>,
    /// Send a notice ahead of the result rows.
    pub notice: Option<String>,
    /// Answer the query with an error instead of rows.
    pub error: Option<String>,
    pub process_id: i32,
    pub secret_key: i32,
}

/// Login challenge issued when a password is configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Cleartext,
    Md5,
    ScramSha256,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            server_version: "16.4".to_string(),
            client_encoding: "UTF8".to_string(),
            rows: 1,
            echo_params: false,
            password: None,
            auth_method: AuthMethod::Cleartext,
            sasl_mechanisms: vec!["SCRAM-SHA-256".to_string()],
            notice: None,
            error: None,
            process_id: 4242,
            secret_key: 9999,
        }
    }
}

/// Observable side effects of one mock partition.
#[derive(Default)]
pub struct MockState {
    pub connections: usize,
    pub queries: usize,
    pub simple_queries: Vec<String>,
    pub cancels: Vec<(i32, i32)>,
    /// Parameter bytes of the latest extended query.
    pub last_params: Vec<Option<Vec<u8>>>,
    /// Result format code of the latest extended query.
    pub last_result_format: i16,
}

pub struct MockPartition {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    stall: Arc<AtomicBool>,
}

impl MockPartition {
    pub async fn spawn(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(MockState::default()));
        let stall = Arc::new(AtomicBool::new(false));

        let accept_state = state.clone();
        let accept_stall = stall.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let config = config.clone();
                let state = accept_state.clone();
                let stall = accept_stall.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, config, state, stall).await;
                });
            }
        });

        Self { addr, state, stall }
    }

    pub fn connstr(&self, dbname: &str) -> String {
        format!(
            "host=127.0.0.1 port={} dbname={} user=tester",
            self.addr.port(),
            dbname
        )
    }

    pub fn connstr_with_password(&self, dbname: &str, password: &str) -> String {
        format!("{} password={}", self.connstr(dbname), password)
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    pub async fn wait_for_cancel(&self, timeout: Duration) -> Option<(i32, i32)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(&cancel) = self.state().cancels.first() {
                return Some(cancel);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn serve(
    mut socket: TcpStream,
    config: MockConfig,
    state: Arc<Mutex<MockState>>,
    stall: Arc<AtomicBool>,
) -> std::io::Result<()> {
    // Startup packet: length-prefixed, no type byte.
    let len = socket.read_i32().await?;
    let mut payload = vec![0u8; (len - 4) as usize];
    socket.read_exact(&mut payload).await?;
    let mut payload = BytesMut::from(&payload[..]);
    let code = payload.get_i32();

    if code == CANCEL_CODE {
        let pid = payload.get_i32();
        let key = payload.get_i32();
        state.lock().unwrap().cancels.push((pid, key));
        return Ok(());
    }
    assert_eq!(code, PROTOCOL_V3, "unexpected startup code");
    let startup = startup_params(&mut payload);
    state.lock().unwrap().connections += 1;

    let mut out = BytesMut::new();
    if let Some(expected) = &config.password {
        let user = startup.get("user").map(String::as_str).unwrap_or("tester");
        let authenticated = match config.auth_method {
            AuthMethod::Cleartext => authenticate_cleartext(&mut socket, &mut out, expected).await?,
            AuthMethod::Md5 => authenticate_md5(&mut socket, &mut out, user, expected).await?,
            AuthMethod::ScramSha256 => {
                authenticate_scram(&mut socket, &mut out, &config.sasl_mechanisms, expected).await?
            }
        };
        if !authenticated {
            message(&mut out, b'E', |body| {
                error_fields(body, "FATAL", "28P01", "password authentication failed");
            });
            socket.write_all(&out).await?;
            return Ok(());
        }
    }

    message(&mut out, b'R', |body| body.put_i32(0));
    parameter_status(&mut out, "server_version", &config.server_version);
    parameter_status(&mut out, "client_encoding", &config.client_encoding);
    message(&mut out, b'K', |body| {
        body.put_i32(config.process_id);
        body.put_i32(config.secret_key);
    });
    ready_for_query(&mut out);
    socket.write_all(&out).await?;
    out.clear();

    let mut pending_params: Vec<Option<Vec<u8>>> = Vec::new();
    let mut pending_result_format: i16 = 0;
    loop {
        let Ok((tag, body)) = read_frame(&mut socket).await else {
            return Ok(());
        };
        match tag {
            b'P' | b'D' | b'H' => {}
            b'B' => {
                let (params, result_format) = parse_bind(&body);
                pending_params = params;
                pending_result_format = result_format;
            }
            b'E' => {}
            b'S' => {
                if stall.load(Ordering::SeqCst) {
                    // Swallow the query without answering; the engine's
                    // deadline has to fire.
                    while stall.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    return Ok(());
                }
                {
                    let mut state = state.lock().unwrap();
                    state.queries += 1;
                    state.last_params = pending_params.clone();
                    state.last_result_format = pending_result_format;
                }
                message(&mut out, b'1', |_| {});
                message(&mut out, b'2', |_| {});
                if let Some(text) = &config.notice {
                    let text = text.clone();
                    message(&mut out, b'N', |body| {
                        error_fields(body, "NOTICE", "01000", &text);
                    });
                }
                if let Some(text) = &config.error {
                    let text = text.clone();
                    message(&mut out, b'E', |body| {
                        error_fields(body, "ERROR", "P0001", &text);
                    });
                    ready_for_query(&mut out);
                } else {
                    row_description(&mut out, "r");
                    for i in 0..config.rows {
                        let value = if config.echo_params {
                            let fields: Vec<String> = pending_params
                                .iter()
                                .map(|p| match p {
                                    Some(bytes) => {
                                        String::from_utf8_lossy(bytes).into_owned()
                                    }
                                    None => "NULL".to_string(),
                                })
                                .collect();
                            fields.join("|")
                        } else {
                            format!("row{i}")
                        };
                        data_row(&mut out, &value);
                    }
                    message(&mut out, b'C', |body| {
                        put_cstr(body, &format!("SELECT {}", config.rows));
                    });
                    ready_for_query(&mut out);
                }
                socket.write_all(&out).await?;
                out.clear();
            }
            b'Q' => {
                let sql = cstr_at(&body, 0);
                state.lock().unwrap().simple_queries.push(sql.clone());
                // A `set client_encoding` round trip reports the new value.
                if let Some(value) = sql
                    .strip_prefix("set client_encoding = '")
                    .and_then(|rest| rest.strip_suffix('\''))
                {
                    parameter_status(&mut out, "client_encoding", value);
                }
                message(&mut out, b'C', |body| put_cstr(body, "SET"));
                ready_for_query(&mut out);
                socket.write_all(&out).await?;
                out.clear();
            }
            b'X' => return Ok(()),
            other => panic!("mock received unexpected message {:?}", other as char),
        }
    }
}

async fn read_frame(socket: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let tag = socket.read_u8().await?;
    let len = socket.read_i32().await?;
    let mut body = vec![0u8; (len - 4) as usize];
    socket.read_exact(&mut body).await?;
    Ok((tag, body))
}

async fn authenticate_cleartext(
    socket: &mut TcpStream,
    out: &mut BytesMut,
    expected: &str,
) -> std::io::Result<bool> {
    message(out, b'R', |body| body.put_i32(3));
    socket.write_all(out).await?;
    out.clear();

    let (tag, body) = read_frame(socket).await?;
    assert_eq!(tag, b'p', "expected a password message");
    Ok(cstr_at(&body, 0) == expected)
}

async fn authenticate_md5(
    socket: &mut TcpStream,
    out: &mut BytesMut,
    user: &str,
    expected: &str,
) -> std::io::Result<bool> {
    let salt = [0x71, 0x5e, 0x3b, 0xd4];
    message(out, b'R', |body| {
        body.put_i32(5);
        body.put_slice(&salt);
    });
    socket.write_all(out).await?;
    out.clear();

    let (tag, body) = read_frame(socket).await?;
    assert_eq!(tag, b'p', "expected a password message");
    let wanted = authentication::md5_hash(user.as_bytes(), expected.as_bytes(), salt);
    Ok(cstr_at(&body, 0) == wanted)
}

/// Server side of the SCRAM-SHA-256 exchange, including verifying the client
/// proof and producing the server signature the client checks on its side.
async fn authenticate_scram(
    socket: &mut TcpStream,
    out: &mut BytesMut,
    mechanisms: &[String],
    expected: &str,
) -> std::io::Result<bool> {
    message(out, b'R', |body| {
        body.put_i32(10);
        for mechanism in mechanisms {
            put_cstr(body, mechanism);
        }
        body.put_u8(0);
    });
    socket.write_all(out).await?;
    out.clear();

    // SASLInitialResponse: mechanism, then the length-prefixed
    // client-first-message.
    let (tag, body) = read_frame(socket).await?;
    assert_eq!(tag, b'p', "expected a SASL initial response");
    let mechanism = cstr_at(&body, 0);
    assert_eq!(mechanism, "SCRAM-SHA-256");
    let mut rest = BytesMut::from(&body[mechanism.len() + 1..]);
    let len = rest.get_i32();
    let mut initial = vec![0u8; len as usize];
    rest.copy_to_slice(&mut initial);
    let client_first = String::from_utf8(initial).unwrap();

    // The bare message starts after the GS2 header ("n,," without channel
    // binding).
    let bare_start = client_first
        .match_indices(',')
        .map(|(i, _)| i)
        .nth(1)
        .expect("malformed client-first message")
        + 1;
    let client_first_bare = client_first[bare_start..].to_string();
    let client_nonce = client_first_bare
        .split(',')
        .find_map(|attr| attr.strip_prefix("r="))
        .expect("client-first message has no nonce")
        .to_string();

    let salt = b"mock-partition-salt";
    let iterations = 4096u32;
    let server_first = format!(
        "r={client_nonce}mockserver,s={},i={iterations}",
        STANDARD.encode(salt)
    );
    message(out, b'R', |body| {
        body.put_i32(11);
        body.put_slice(server_first.as_bytes());
    });
    socket.write_all(out).await?;
    out.clear();

    let (tag, body) = read_frame(socket).await?;
    assert_eq!(tag, b'p', "expected a SASL response");
    let client_final = String::from_utf8(body).unwrap();
    let (without_proof, proof_b64) = client_final
        .rsplit_once(",p=")
        .expect("client-final message has no proof");
    let Ok(proof) = STANDARD.decode(proof_b64) else {
        return Ok(false);
    };

    let mut salted = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(expected.as_bytes(), salt, iterations, &mut salted)
        .expect("pbkdf2 failed");
    let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key = Sha256::digest(client_key);
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let wanted: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(key, sig)| key ^ sig)
        .collect();
    if proof != wanted {
        return Ok(false);
    }

    let server_key = hmac_sha256(&salted, b"Server Key");
    let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
    // AuthenticationSASLFinal; flushed together with AuthenticationOk by the
    // caller.
    message(out, b'R', |body| {
        body.put_i32(12);
        body.put_slice(format!("v={}", STANDARD.encode(server_signature)).as_bytes());
    });
    Ok(true)
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

fn startup_params(payload: &mut BytesMut) -> HashMap<String, String> {
    let mut params = HashMap::new();
    while payload.first().is_some_and(|&b| b != 0) {
        let key = take_cstr(payload);
        let value = take_cstr(payload);
        params.insert(key, value);
    }
    params
}

fn take_cstr(buf: &mut BytesMut) -> String {
    let mut out = Vec::new();
    loop {
        let byte = buf.get_u8();
        if byte == 0 {
            break;
        }
        out.push(byte);
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_bind(body: &[u8]) -> (Vec<Option<Vec<u8>>>, i16) {
    let mut buf = BytesMut::from(body);
    skip_cstr(&mut buf); // portal
    skip_cstr(&mut buf); // statement
    let nformats = buf.get_i16();
    for _ in 0..nformats {
        buf.get_i16();
    }
    let nparams = buf.get_i16();
    let mut params = Vec::with_capacity(nparams as usize);
    for _ in 0..nparams {
        let len = buf.get_i32();
        if len < 0 {
            params.push(None);
        } else {
            let mut value = vec![0u8; len as usize];
            buf.copy_to_slice(&mut value);
            params.push(Some(value));
        }
    }
    let nresult_formats = buf.get_i16();
    let mut result_format = 0;
    for _ in 0..nresult_formats {
        result_format = buf.get_i16();
    }
    (params, result_format)
}

fn message(buf: &mut BytesMut, tag: u8, fill: impl FnOnce(&mut BytesMut)) {
    let mut body = BytesMut::new();
    fill(&mut body);
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(&body);
}

fn parameter_status(buf: &mut BytesMut, name: &str, value: &str) {
    message(buf, b'S', |body| {
        put_cstr(body, name);
        put_cstr(body, value);
    });
}

fn ready_for_query(buf: &mut BytesMut) {
    message(buf, b'Z', |body| body.put_u8(b'I'));
}

fn row_description(buf: &mut BytesMut, name: &str) {
    message(buf, b'T', |body| {
        body.put_i16(1);
        put_cstr(body, name);
        body.put_i32(0); // table oid
        body.put_i16(0); // attribute number
        body.put_i32(25); // text
        body.put_i16(-1); // typlen
        body.put_i32(-1); // typmod
        body.put_i16(0); // format
    });
}

fn data_row(buf: &mut BytesMut, value: &str) {
    message(buf, b'D', |body| {
        body.put_i16(1);
        body.put_i32(value.len() as i32);
        body.put_slice(value.as_bytes());
    });
}

fn error_fields(body: &mut BytesMut, severity: &str, code: &str, text: &str) {
    body.put_u8(b'S');
    put_cstr(body, severity);
    body.put_u8(b'V');
    put_cstr(body, severity);
    body.put_u8(b'C');
    put_cstr(body, code);
    body.put_u8(b'M');
    put_cstr(body, text);
    body.put_u8(0);
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn cstr_at(body: &[u8], offset: usize) -> String {
    let end = body[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(body.len());
    String::from_utf8_lossy(&body[offset..end]).into_owned()
}

fn skip_cstr(buf: &mut BytesMut) {
    while buf.get_u8() != 0 {}
}

/// Host hooks with observable notices and a switchable cancel flag.
pub struct TestHooks {
    pub canceled: AtomicBool,
    pub notices: Mutex<Vec<Notice>>,
    pub version: String,
    pub encoding: String,
}

impl TestHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            canceled: AtomicBool::new(false),
            notices: Mutex::new(Vec::new()),
            version: String::new(),
            encoding: "UTF8".to_string(),
        })
    }

    pub fn with_version(version: &str) -> Arc<Self> {
        Arc::new(Self {
            canceled: AtomicBool::new(false),
            notices: Mutex::new(Vec::new()),
            version: version.to_string(),
            encoding: "UTF8".to_string(),
        })
    }
}

impl HostHooks for TestHooks {
    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn notice(&self, notice: &Notice) {
        self.notices.lock().unwrap().push(notice.clone());
    }

    fn local_encoding(&self) -> String {
        self.encoding.clone()
    }

    fn local_server_version(&self) -> String {
        self.version.clone()
    }

    fn current_user(&self) -> String {
        "tester".to_string()
    }
}

/// Routes by the integer value of the hashed argument, like
/// `create function h(x int) returns int as 'select x'`.
pub struct IdentityHash;

impl HashSource for IdentityHash {
    fn hash_rows(&mut self, _sql: &str, args: &[PgValue]) -> Result<Vec<Option<i64>>> {
        Ok(vec![match args[0] {
            PgValue::Int4(v) => Some(i64::from(v)),
            PgValue::Null => None,
            _ => panic!("unexpected hash argument"),
        }])
    }

    fn split_hash_rows(
        &mut self,
        sql: &str,
        args: &[PgValue],
        rows: usize,
    ) -> Result<Vec<(i64, Option<i64>)>> {
        let array = args
            .iter()
            .find_map(|a| match a {
                PgValue::Array(arr) => Some(arr.clone()),
                _ => None,
            })
            .expect("no split array argument");
        assert_eq!(array.len(), rows);
        let mut out = Vec::new();
        for (i, elem) in array.elems.iter().enumerate() {
            let hash = self.hash_rows(sql, std::slice::from_ref(elem))?[0];
            out.push(((i + 1) as i64, hash));
        }
        Ok(out)
    }
}

/// A set-returning hash that selects nothing.
pub struct EmptyHash;

impl HashSource for EmptyHash {
    fn hash_rows(&mut self, _: &str, _: &[PgValue]) -> Result<Vec<Option<i64>>> {
        Ok(Vec::new())
    }

    fn split_hash_rows(
        &mut self,
        _: &str,
        _: &[PgValue],
        _: usize,
    ) -> Result<Vec<(i64, Option<i64>)>> {
        Ok(Vec::new())
    }
}
