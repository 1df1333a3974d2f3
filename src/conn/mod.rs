//! The per-partition connection state machine.
//!
//! Each physical backend gets one `PartitionConnection`. Within a call it is
//! driven exclusively through non-blocking steps: the poll loop observes
//! socket readiness and calls [`PartitionConnection::advance`], which moves
//! the machine through login, query submission, and result drain without
//! ever blocking the thread.

pub(crate) mod protocol;
pub(crate) mod result;
pub(crate) mod stream;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication;
use postgres_protocol::authentication::sasl::{self, ChannelBinding, ScramSha256};
use postgres_protocol::message::backend::{Message, NoticeResponseBody};
use postgres_protocol::message::frontend;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::conn_str::ConnStr;
use crate::error::{Error, Result, TimeoutPhase};
use crate::function::ProxyFunction;
use crate::host::HostHooks;
use crate::options::ClusterOptions;
use crate::types::DatumArray;

use self::result::{Column, QueryResult, Row};

/// How long a connection may sit idle before reuse requires a readability
/// probe. Any byte (or EOF) arriving on an idle session means the backend
/// went away or spoke out of turn, so the connection is rebuilt.
pub(crate) const IDLE_CONN_CHECK: Duration = Duration::from_secs(2);

/// Lifecycle state of one partition connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// No socket.
    None,
    /// Connecting, or flushing login traffic.
    ConnectWrite,
    /// Awaiting login responses.
    ConnectRead,
    /// Logged in, no query in flight.
    Ready,
    /// Flushing a submitted query.
    QueryWrite,
    /// Draining query results.
    QueryRead,
    /// This call's query completed on this connection.
    Done,
}

/// Shared per-call context threaded through connection steps.
pub(crate) struct CallCtx<'a> {
    pub(crate) func: &'a ProxyFunction,
    pub(crate) options: &'a ClusterOptions,
    pub(crate) hooks: &'a dyn HostHooks,
    /// Config and return-type gate for binary results; the per-connection
    /// version match still applies on top.
    pub(crate) binary_results: bool,
}

pub(crate) struct PartitionConnection {
    connstr: ConnStr,
    /// Effective login user, resolved at cluster build time.
    user: String,

    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    pub(crate) state: ConnState,
    send_buf: BytesMut,
    recv_buf: BytesMut,
    startup_sent: bool,
    scram: Option<ScramSha256>,
    parameters: HashMap<String, String>,
    backend_key: Option<(i32, i32)>,

    connect_time: Instant,
    query_time: Instant,
    same_ver: bool,
    tuning: bool,
    tuned: bool,

    // Per-call state, cleared when the call ends.
    pub(crate) run_tag: u32,
    pub(crate) last_split_tag: u32,
    pub(crate) split_params: Vec<Option<DatumArray>>,
    pub(crate) param_values: Vec<Option<Bytes>>,
    pub(crate) param_formats: Vec<i16>,
    pub(crate) submitted: bool,
    binary_result: bool,
    pending: Option<QueryResult>,
    result: Option<QueryResult>,
}

impl PartitionConnection {
    pub(crate) fn new(connstr: ConnStr, user: String) -> Self {
        let now = Instant::now();
        Self {
            connstr,
            user,
            stream: None,
            peer: None,
            state: ConnState::None,
            send_buf: BytesMut::new(),
            recv_buf: BytesMut::new(),
            startup_sent: false,
            scram: None,
            parameters: HashMap::new(),
            backend_key: None,
            connect_time: now,
            query_time: now,
            same_ver: false,
            tuning: false,
            tuned: false,
            run_tag: 0,
            last_split_tag: 0,
            split_params: Vec::new(),
            param_values: Vec::new(),
            param_formats: Vec::new(),
            submitted: false,
            binary_result: false,
            pending: None,
            result: None,
        }
    }

    pub(crate) fn connstr(&self) -> &ConnStr {
        &self.connstr
    }

    pub(crate) fn label(&self) -> String {
        self.connstr.to_string()
    }

    pub(crate) fn armed(&self) -> bool {
        self.run_tag != 0
    }

    /// Whether a query (or login) is in flight on the wire.
    pub(crate) fn in_flight(&self) -> bool {
        !matches!(
            self.state,
            ConnState::None | ConnState::Ready | ConnState::Done
        )
    }

    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// The socket interest of the current state, `None` for non-I/O states.
    pub(crate) fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::ConnectRead | ConnState::QueryRead => Some(Interest::READABLE),
            ConnState::ConnectWrite | ConnState::QueryWrite => Some(Interest::WRITABLE),
            ConnState::None | ConnState::Ready | ConnState::Done => None,
        }
    }

    pub(crate) fn cancel_target(&self) -> Option<(SocketAddr, i32, i32)> {
        match (self.peer, self.backend_key) {
            (Some(addr), Some((pid, key))) => Some((addr, pid, key)),
            _ => None,
        }
    }

    pub(crate) fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub(crate) fn take_result(&mut self) -> Option<QueryResult> {
        self.result.take()
    }

    /// Sizes the per-call vectors for a new call.
    pub(crate) fn reset_call_state(&mut self, arg_count: usize, param_count: usize) {
        self.clear_call_state();
        self.split_params = vec![None; arg_count];
        self.param_values = vec![None; param_count];
        self.param_formats = vec![0; param_count];
    }

    /// Clears everything scoped to one call and returns a finished
    /// connection to `Ready` for the next one.
    pub(crate) fn clear_call_state(&mut self) {
        self.run_tag = 0;
        self.last_split_tag = 0;
        self.split_params.clear();
        self.param_values.clear();
        self.param_formats.clear();
        self.submitted = false;
        self.binary_result = false;
        self.pending = None;
        self.result = None;
        if self.state == ConnState::Done {
            self.state = ConnState::Ready;
        }
    }

    /// Readies the connection for a call: reuses a healthy cached session,
    /// drops a stale or desynchronized one, and starts a connect when there
    /// is no usable socket.
    pub(crate) fn prepare(&mut self, ctx: &CallCtx<'_>, now: Instant) -> Result<()> {
        match self.state {
            ConnState::Ready => {
                if self.stale(ctx, now) {
                    self.graceful_close();
                }
            }
            ConnState::None => {}
            // Leftover from an aborted call; the session is mid-protocol
            // and cannot be resynchronized.
            _ => self.drop_stream(),
        }
        if self.state == ConnState::None {
            self.start_connect(ctx, now)?;
        }
        Ok(())
    }

    fn stale(&self, ctx: &CallCtx<'_>, now: Instant) -> bool {
        let Some(stream) = &self.stream else {
            return true;
        };
        if let Some(lifetime) = ctx.options.lifetime() {
            if now.duration_since(self.connect_time) >= lifetime {
                debug!(partition = %self.connstr, "cached connection exceeded its lifetime");
                return true;
            }
        }
        if now.duration_since(self.query_time) >= IDLE_CONN_CHECK {
            let mut probe = [0u8; 1];
            match stream.try_read(&mut probe) {
                Ok(_) => {
                    warn!(
                        partition = %self.connstr,
                        "idle connection had unexpected traffic, rebuilding"
                    );
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => return true,
            }
        }
        false
    }

    fn start_connect(&mut self, ctx: &CallCtx<'_>, now: Instant) -> Result<()> {
        let addr = stream::resolve(self.connstr.host(), self.connstr.port())
            .map_err(|e| e.with_partition(self.label()))?;
        let stream = stream::start_connect(addr, ctx.options)
            .map_err(|e| e.with_partition(self.label()))?;
        self.stream = Some(stream);
        self.peer = Some(addr);
        self.state = ConnState::ConnectWrite;
        self.connect_time = now;
        self.startup_sent = false;
        self.scram = None;
        self.parameters.clear();
        self.backend_key = None;
        self.same_ver = false;
        self.tuning = false;
        self.tuned = false;
        self.send_buf.clear();
        self.recv_buf.clear();
        debug!(partition = %self.connstr, %addr, "connecting");
        Ok(())
    }

    /// Closes the session, telling the backend first when the socket is
    /// still writable.
    fn graceful_close(&mut self) {
        if let Some(stream) = &self.stream {
            let mut buf = BytesMut::new();
            frontend::terminate(&mut buf);
            let _ = stream.try_write(&buf);
        }
        self.drop_stream();
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.peer = None;
        self.state = ConnState::None;
        self.startup_sent = false;
        self.scram = None;
        self.parameters.clear();
        self.backend_key = None;
        self.same_ver = false;
        self.tuning = false;
        self.tuned = false;
        self.send_buf.clear();
        self.recv_buf.clear();
    }

    /// Submits this call's query. Must only be called in `Ready`.
    pub(crate) fn submit_query(&mut self, ctx: &CallCtx<'_>) -> Result<()> {
        self.binary_result = ctx.binary_results && self.same_ver;
        protocol::extended_query(
            ctx.func.query.sql(),
            &self.param_values,
            &self.param_formats,
            i16::from(self.binary_result),
            &mut self.send_buf,
        )?;
        self.state = ConnState::QueryWrite;
        self.query_time = Instant::now();
        self.submitted = true;
        debug!(
            partition = %self.connstr,
            function = %ctx.func.name,
            binary = self.binary_result,
            "submitting query"
        );
        self.advance_query_write(ctx)
    }

    /// Advances the state machine after its socket reported readiness.
    pub(crate) fn advance(&mut self, ctx: &CallCtx<'_>) -> Result<()> {
        match self.state {
            ConnState::ConnectWrite => self.advance_connect_write(ctx),
            ConnState::ConnectRead => self.advance_connect_read(ctx),
            ConnState::QueryWrite => self.advance_query_write(ctx),
            ConnState::QueryRead => self.drain(ctx),
            ConnState::None | ConnState::Ready | ConnState::Done => Ok(()),
        }
    }

    /// Enforces the per-phase deadlines against the current state.
    pub(crate) fn check_timeouts(&self, options: &ClusterOptions, now: Instant) -> Result<()> {
        match self.state {
            ConnState::ConnectWrite | ConnState::ConnectRead => {
                if let Some(limit) = options.connect_deadline() {
                    if now.duration_since(self.connect_time) >= limit {
                        return Err(Error::timeout(TimeoutPhase::Connect)
                            .with_partition(self.label()));
                    }
                }
            }
            ConnState::QueryWrite | ConnState::QueryRead => {
                if let Some(limit) = options.query_deadline() {
                    if now.duration_since(self.query_time) >= limit {
                        return Err(
                            Error::timeout(TimeoutPhase::Query).with_partition(self.label())
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn advance_connect_write(&mut self, _ctx: &CallCtx<'_>) -> Result<()> {
        if !self.startup_sent {
            let stream = self.stream_ref()?;
            if let Some(err) = stream.take_error()? {
                return Err(Error::connection(format!("could not connect: {err}"))
                    .with_partition(self.label()));
            }
            match stream.peer_addr() {
                Ok(_) => {
                    let params = self.connstr.startup_params(&self.user);
                    protocol::startup(&params, &mut self.send_buf)?;
                    self.startup_sent = true;
                    debug!(partition = %self.connstr, "connected, logging in");
                }
                // Still connecting; wait for the next writability event.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => {
                    return Err(Error::connection(format!("could not connect: {e}"))
                        .with_partition(self.label()))
                }
            }
        }
        self.flush_send()?;
        if self.send_buf.is_empty() {
            self.state = ConnState::ConnectRead;
        }
        Ok(())
    }

    fn advance_connect_read(&mut self, ctx: &CallCtx<'_>) -> Result<()> {
        self.fill_recv()?;
        loop {
            let message = Message::parse(&mut self.recv_buf)
                .map_err(|e| Error::protocol(format!("malformed backend message: {e}")))?;
            let Some(message) = message else { break };
            match message {
                Message::AuthenticationOk => {}
                Message::AuthenticationCleartextPassword => {
                    let password = self.password()?.to_string();
                    frontend::password_message(password.as_bytes(), &mut self.send_buf)
                        .map_err(|e| Error::protocol(format!("could not encode password: {e}")))?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let password = self.password()?.to_string();
                    let hashed = authentication::md5_hash(
                        self.user.as_bytes(),
                        password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hashed.as_bytes(), &mut self.send_buf)
                        .map_err(|e| Error::protocol(format!("could not encode password: {e}")))?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next().map_err(|e| {
                        Error::protocol(format!("malformed SASL mechanism list: {e}"))
                    })? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            supported = true;
                        }
                    }
                    if !supported {
                        return Err(Error::connection(
                            "backend offered no supported SASL mechanism",
                        )
                        .with_partition(self.label()));
                    }
                    let password = self.password()?.to_string();
                    let scram =
                        ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(
                        sasl::SCRAM_SHA_256,
                        scram.message(),
                        &mut self.send_buf,
                    )
                    .map_err(|e| Error::protocol(format!("could not encode SASL response: {e}")))?;
                    self.scram = Some(scram);
                }
                Message::AuthenticationSaslContinue(body) => {
                    let scram = self
                        .scram
                        .as_mut()
                        .ok_or_else(|| Error::protocol("SASL continue without an exchange"))?;
                    scram.update(body.data()).map_err(|e| {
                        Error::connection(format!("SCRAM exchange failed: {e}"))
                    })?;
                    let response = scram.message().to_vec();
                    frontend::sasl_response(&response, &mut self.send_buf)
                        .map_err(|e| Error::protocol(format!("could not encode SASL response: {e}")))?;
                }
                Message::AuthenticationSaslFinal(body) => {
                    let mut scram = self
                        .scram
                        .take()
                        .ok_or_else(|| Error::protocol("SASL final without an exchange"))?;
                    scram.finish(body.data()).map_err(|e| {
                        Error::connection(format!("SCRAM verification failed: {e}"))
                    })?;
                }
                Message::AuthenticationKerberosV5
                | Message::AuthenticationScmCredential
                | Message::AuthenticationGss
                | Message::AuthenticationSspi => {
                    return Err(Error::connection(
                        "backend requested an unsupported authentication method",
                    )
                    .with_partition(self.label()))
                }
                Message::ParameterStatus(body) => {
                    let name = body
                        .name()
                        .map_err(|e| Error::protocol(format!("malformed parameter status: {e}")))?
                        .to_string();
                    let value = body
                        .value()
                        .map_err(|e| Error::protocol(format!("malformed parameter status: {e}")))?
                        .to_string();
                    self.parameters.insert(name, value);
                }
                Message::BackendKeyData(body) => {
                    self.backend_key = Some((body.process_id(), body.secret_key()));
                }
                Message::NoticeResponse(body) => self.forward_notice(ctx, &body),
                Message::ErrorResponse(body) => {
                    let cause = protocol::remote_error(&body, &ctx.func.name);
                    return Err(Error::connection(format!("login failed: {cause}"))
                        .with_partition(self.label()));
                }
                Message::ReadyForQuery(_) => {
                    self.state = ConnState::Ready;
                    self.query_time = Instant::now();
                    return self.on_ready(ctx);
                }
                _ => {
                    return Err(Error::protocol("unexpected message during login")
                        .with_partition(self.label()))
                }
            }
        }
        if !self.send_buf.is_empty() {
            self.flush_send()?;
            if !self.send_buf.is_empty() {
                self.state = ConnState::ConnectWrite;
            }
        }
        Ok(())
    }

    /// Runs every time the connection reaches `Ready` within a call, both
    /// after login and after a tuning round trip.
    fn on_ready(&mut self, ctx: &CallCtx<'_>) -> Result<()> {
        self.tuning = false;
        self.update_same_ver(ctx);
        if let Some(sql) = self.tuning_query(ctx) {
            if self.tuned {
                return Err(Error::connection(
                    "session settings still diverge after tuning",
                )
                .with_partition(self.label()));
            }
            self.tuned = true;
            self.tuning = true;
            protocol::simple_query(&sql, &mut self.send_buf)?;
            self.state = ConnState::QueryWrite;
            self.query_time = Instant::now();
            debug!(partition = %self.connstr, query = %sql, "tuning session");
        }
        Ok(())
    }

    fn tuning_query(&self, ctx: &CallCtx<'_>) -> Option<String> {
        let local = ctx.hooks.local_encoding();
        match self.parameters.get("client_encoding") {
            Some(remote) if !remote.eq_ignore_ascii_case(&local) => Some(format!(
                "set client_encoding = '{}'",
                local.replace('\'', "''")
            )),
            _ => None,
        }
    }

    fn update_same_ver(&mut self, ctx: &CallCtx<'_>) {
        let local = ctx.hooks.local_server_version();
        let remote = self.parameters.get("server_version");
        self.same_ver = match (major_minor(&local), remote.and_then(|v| major_minor(v))) {
            (Some(local), Some(remote)) => local == remote,
            _ => false,
        };
    }

    fn advance_query_write(&mut self, ctx: &CallCtx<'_>) -> Result<()> {
        self.flush_send()?;
        if self.send_buf.is_empty() {
            self.state = ConnState::QueryRead;
            return self.drain(ctx);
        }
        Ok(())
    }

    /// Consumes available input and pulls results until the backend is idle
    /// again or more bytes are needed.
    fn drain(&mut self, ctx: &CallCtx<'_>) -> Result<()> {
        self.fill_recv()?;
        loop {
            let message = Message::parse(&mut self.recv_buf)
                .map_err(|e| Error::protocol(format!("malformed backend message: {e}")))?;
            let Some(message) = message else { break };
            match message {
                Message::ParseComplete
                | Message::BindComplete
                | Message::NoData
                | Message::NotificationResponse(_) => {}
                Message::RowDescription(body) => {
                    if self.pending.is_some() {
                        return Err(Error::protocol("overlapping row descriptions")
                            .with_partition(self.label()));
                    }
                    let mut fields = body.fields();
                    let mut columns = Vec::new();
                    while let Some(field) = fields.next().map_err(|e| {
                        Error::protocol(format!("malformed row description: {e}"))
                    })? {
                        columns.push(Column {
                            name: field.name().to_string(),
                            type_oid: field.type_oid(),
                        });
                    }
                    self.pending = Some(QueryResult::new(columns, self.binary_result));
                }
                Message::DataRow(body) => {
                    let pending = self.pending.as_mut().ok_or_else(|| {
                        Error::protocol("data row without a row description")
                    })?;
                    let buffer = body.buffer();
                    let mut ranges = body.ranges();
                    let mut columns = Vec::new();
                    while let Some(range) = ranges
                        .next()
                        .map_err(|e| Error::protocol(format!("malformed data row: {e}")))?
                    {
                        columns.push(range.map(|r| Bytes::copy_from_slice(&buffer[r])));
                    }
                    pending.rows.push(Row { columns });
                }
                Message::CommandComplete(body) => {
                    let tag = body
                        .tag()
                        .map_err(|e| Error::protocol(format!("malformed command tag: {e}")))?
                        .to_string();
                    match self.pending.take() {
                        Some(finished) => {
                            if self.tuning {
                                return Err(Error::protocol("tuning query returned rows")
                                    .with_partition(self.label()));
                            }
                            if self.result.is_some() {
                                return Err(Error::protocol(
                                    "backend returned more than one tuple result",
                                )
                                .with_partition(self.label()));
                            }
                            self.result = Some(finished);
                        }
                        None => {
                            debug!(partition = %self.connstr, %tag, "discarding command result")
                        }
                    }
                }
                Message::EmptyQueryResponse => {}
                Message::ParameterStatus(body) => {
                    let name = body
                        .name()
                        .map_err(|e| Error::protocol(format!("malformed parameter status: {e}")))?
                        .to_string();
                    let value = body
                        .value()
                        .map_err(|e| Error::protocol(format!("malformed parameter status: {e}")))?
                        .to_string();
                    self.parameters.insert(name, value);
                }
                Message::NoticeResponse(body) => self.forward_notice(ctx, &body),
                Message::ErrorResponse(body) => {
                    return Err(protocol::remote_error(&body, &ctx.func.name)
                        .with_partition(self.label()))
                }
                Message::ReadyForQuery(_) => {
                    if self.tuning {
                        self.state = ConnState::Ready;
                        return self.on_ready(ctx);
                    }
                    self.state = ConnState::Done;
                    debug!(
                        partition = %self.connstr,
                        rows = self.result.as_ref().map(QueryResult::row_count).unwrap_or(0),
                        "query complete"
                    );
                    return Ok(());
                }
                _ => {
                    return Err(Error::protocol("unexpected message in result stream")
                        .with_partition(self.label()))
                }
            }
        }
        Ok(())
    }

    fn forward_notice(&self, ctx: &CallCtx<'_>, body: &NoticeResponseBody) {
        match protocol::notice(body, &ctx.func.name) {
            Ok(notice) => ctx.hooks.notice(&notice),
            Err(e) => {
                warn!(partition = %self.connstr, error = %e, "dropping malformed notice")
            }
        }
    }

    fn password(&self) -> Result<&str> {
        self.connstr
            .password()
            .ok_or_else(|| Error::connection("no password supplied").with_partition(self.label()))
    }

    fn stream_ref(&self) -> Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| Error::internal("connection has no socket"))
    }

    fn fill_recv(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::internal("connection has no socket"))?;
        loop {
            match stream.try_read_buf(&mut self.recv_buf) {
                Ok(0) => {
                    return Err(Error::connection("connection closed unexpectedly")
                        .with_partition(self.connstr.to_string()))
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::from(e).with_partition(self.connstr.to_string())),
            }
        }
    }

    fn flush_send(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::internal("connection has no socket"))?;
        while !self.send_buf.is_empty() {
            match stream.try_write(&self.send_buf) {
                Ok(0) => {
                    return Err(Error::connection("connection closed while writing")
                        .with_partition(self.connstr.to_string()))
                }
                Ok(n) => self.send_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::from(e).with_partition(self.connstr.to_string())),
            }
        }
        Ok(())
    }
}

/// Extracts the leading major.minor pair of a server version string,
/// tolerating suffixes like `"16.4 (Debian 16.4-1)"` or `"17devel"`.
fn major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Some((major, minor))
}
