//! A client connection: handshake, command round trips and server/session state.
//!
//! A [`Connection`] owns the socket, both packet buffers and everything the server reported
//! about itself and the session. Result sets and statements hold only a link flag back to their
//! connection and receive it as an explicit `&mut` argument; once the connection is closed or
//! dropped the flag is cleared and every dependant fails with `InvalidHandle`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

use crate::config::ClientConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::metrics;
use crate::protocol::constants::{Capabilities, Command, StatusFlags};
use crate::protocol::handshake::{self, HelloParams, ServerGreeting};
use crate::protocol::packet::PacketIo;
use crate::protocol::response::{
    self, EOF_HEADER, EofPacket, OkPacket, ProgressReport, Response, SessionStateRecord,
};
use crate::protocol::wire::Reader;
use crate::result::{ResultSet, RowFormat};
use crate::statement::Statement;

/// Called when an OK or EOF packet carries a status that intersects the registered mask.
/// Listeners receive plain values and cannot reach the connection.
pub trait StatusListener: Send {
    fn on_status(&mut self, status: StatusFlags);
}

/// Called for every progress report the server sends while a statement runs.
pub trait ProgressListener: Send {
    fn on_progress(&mut self, report: &ProgressReport);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Ready,
    /// A column count was read; metadata or rows are pending.
    HasResult,
    /// Rows are being fetched.
    Fetching,
}

/// Facts from the server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: String,
    pub is_mariadb: bool,
    pub thread_id: u32,
    pub capabilities: Capabilities,
    pub charset: u8,
    pub plugin: Option<String>,
}

impl From<&ServerGreeting> for ServerInfo {
    fn from(greeting: &ServerGreeting) -> Self {
        Self {
            version: greeting.version.clone(),
            is_mariadb: greeting.is_mariadb,
            thread_id: greeting.thread_id,
            capabilities: greeting.capabilities,
            charset: greeting.charset,
            plugin: greeting.plugin.clone(),
        }
    }
}

pub struct Connection<S> {
    io: PacketIo<S>,
    config: ClientConfig,
    state: ConnState,
    server: Option<ServerInfo>,
    capabilities: Capabilities,
    status: StatusFlags,
    warnings: u16,
    affected_rows: u64,
    last_insert_id: u64,
    column_count: u64,
    info: Vec<u8>,
    session_state: Vec<SessionStateRecord>,
    last_error: Option<Error>,
    link: Arc<AtomicBool>,
    status_listener: Option<(StatusFlags, Box<dyn StatusListener>)>,
    progress_listener: Option<Box<dyn ProgressListener>>,
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("server", &self.server)
            .field("capabilities", &self.capabilities)
            .field("status", &self.status)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Connection<TcpStream> {
    /// Opens a TCP connection and performs the handshake.
    #[instrument(skip(config), fields(user = %config.user))]
    pub async fn connect_tcp(host: &str, port: u16, config: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|err| Error::io(ErrorCode::InvalidSocketDescriptor, err))?;
        stream
            .set_nodelay(true)
            .map_err(|err| Error::io(ErrorCode::InvalidSocketDescriptor, err))?;
        Self::connect(stream, config).await
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream without talking to the server yet.
    pub fn new(stream: S, config: ClientConfig) -> Self {
        let mut io = PacketIo::new(stream, config.buffer_length);
        io.set_timeouts(config.read_timeout_ms, config.write_timeout_ms);
        Self {
            io,
            config,
            state: ConnState::Ready,
            server: None,
            capabilities: Capabilities::empty(),
            status: StatusFlags::empty(),
            warnings: 0,
            affected_rows: 0,
            last_insert_id: 0,
            column_count: 0,
            info: Vec::new(),
            session_state: Vec::new(),
            last_error: None,
            link: Arc::new(AtomicBool::new(true)),
            status_listener: None,
            progress_listener: None,
        }
    }

    /// Wraps `stream` and authenticates.
    pub async fn connect(stream: S, config: ClientConfig) -> Result<Self> {
        let mut conn = Self::new(stream, config);
        conn.handshake().await?;
        Ok(conn)
    }

    /// Reads the greeting, sends the client hello and waits for the authentication result.
    #[instrument(skip(self), fields(user = %self.config.user))]
    pub async fn handshake(&mut self) -> Result<()> {
        let result = self.handshake_inner().await;
        self.track(result)
    }

    async fn handshake_inner(&mut self) -> Result<()> {
        self.check_open()?;
        if self.server.is_some() {
            return Err(Error::new(ErrorCode::AlreadyInitialized));
        }

        self.io.read().await?;
        let greeting = handshake::decode_greeting(self.io.packet())?;

        let mut hello = BytesMut::with_capacity(self.config.buffer_length);
        let params = HelloParams {
            user: &self.config.user,
            password: self.config.password.as_deref(),
            database: self.config.database.as_deref(),
            default_plugin: &self.config.auth_plugin,
            charset: self.config.charset,
            max_packet_size: self.config.max_packet_size,
            connect_attrs: &self.config.connect_attrs,
            buffer_limit: self.config.buffer_length,
        };
        let negotiated = handshake::encode_client_hello(&greeting, &params, &mut hello)?;
        self.io.write(None, &hello).await?;

        self.io.read().await?;
        let packet = self.io.packet();
        if packet.first() == Some(&EOF_HEADER) {
            let mut r = Reader::new(packet);
            r.skip(1)?;
            let plugin = match r.get_null_terminated() {
                Ok(name) => String::from_utf8_lossy(name).into_owned(),
                Err(_) => String::from_utf8_lossy(r.get_rest()).into_owned(),
            };
            warn!(plugin = %plugin, "server requested an authentication switch");
            return Err(Error::unknown_auth_method(&plugin));
        }

        match response::classify(packet, negotiated)? {
            Response::Ok(ok) => {
                self.capabilities = negotiated;
                self.server = Some(ServerInfo::from(&greeting));
                self.status = greeting.status;
                self.apply_ok(ok);
                debug!(
                    version = %greeting.version,
                    thread_id = greeting.thread_id,
                    "authenticated"
                );
                Ok(())
            }
            Response::Error(err) => Err(err),
            other => Err(unexpected(&other)),
        }
    }

    /// Runs a text protocol query. Returns a result set when the statement produced rows.
    pub async fn query(&mut self, sql: &str) -> Result<Option<ResultSet>> {
        let result = self.query_inner(sql).await;
        self.track(result)
    }

    async fn query_inner(&mut self, sql: &str) -> Result<Option<ResultSet>> {
        self.check_command_ready()?;
        self.io.write(Some(Command::Query), sql.as_bytes()).await?;
        self.read_result(RowFormat::Text).await
    }

    /// Reads a command's response and, for a column count, the result set metadata.
    pub(crate) async fn read_result(&mut self, format: RowFormat) -> Result<Option<ResultSet>> {
        match self.read_response().await? {
            Response::Ok(_) | Response::Eof(_) => Ok(None),
            Response::ColumnCount(count) => {
                let result = ResultSet::read_metadata(self, count, format).await?;
                Ok(Some(result))
            }
            Response::LocalInfile(file) => Err(Error::with_message(
                ErrorCode::Unknown,
                format!(
                    "LOAD DATA LOCAL INFILE is not supported (requested '{}')",
                    String::from_utf8_lossy(&file)
                ),
            )),
            other => Err(unexpected(&other)),
        }
    }

    /// Prepares a statement on the server.
    pub async fn prepare(&mut self, sql: &str) -> Result<Statement> {
        let result = Statement::prepare(self, sql).await;
        self.track(result)
    }

    pub async fn ping(&mut self) -> Result<()> {
        let result = self.simple_command(Command::Ping, &[]).await;
        self.track(result)
    }

    /// Changes the default schema.
    pub async fn select_db(&mut self, database: &str) -> Result<()> {
        if database.is_empty() {
            return self.track(Err(Error::with_message(
                ErrorCode::NullValueParameter,
                "Database name must not be empty",
            )));
        }
        let result = self.simple_command(Command::InitDb, database.as_bytes()).await;
        if result.is_ok() {
            self.config.database = Some(database.to_string());
        }
        self.track(result)
    }

    async fn simple_command(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        self.check_command_ready()?;
        self.io.write(Some(command), payload).await?;
        match self.read_response().await? {
            Response::Ok(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Reads one response, delivering progress reports to the listener until a final packet
    /// arrives. OK and EOF packets update the connection state; server errors are returned.
    pub async fn read_response(&mut self) -> Result<Response> {
        loop {
            self.io.read().await?;
            let response = response::classify(self.io.packet(), self.capabilities)?;
            match response {
                Response::Progress(report) => {
                    debug!(stage = report.stage, max_stage = report.max_stage, progress = report.progress, "progress");
                    if let Some(listener) = self.progress_listener.as_mut() {
                        listener.on_progress(&report);
                    }
                }
                Response::Error(err) => return Err(err),
                Response::Ok(ok) => {
                    self.apply_ok(ok.clone());
                    return Ok(Response::Ok(ok));
                }
                Response::Eof(eof) => {
                    self.apply_eof(eof);
                    return Ok(Response::Eof(eof));
                }
                Response::ColumnCount(count) => {
                    self.column_count = count;
                    self.state = ConnState::HasResult;
                    return Ok(Response::ColumnCount(count));
                }
                Response::LocalInfile(file) => return Ok(Response::LocalInfile(file)),
            }
        }
    }

    /// Sends `COM_QUIT` and shuts the stream down. Dependent result sets and statements are
    /// invalidated even if the server is already gone.
    pub async fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.link.store(false, Ordering::Release);
        let quit = self.io.write(Some(Command::Quit), &[]).await;
        let shutdown = self.io.shutdown().await;
        debug!("connection closed");
        let result = quit.and(shutdown);
        self.track(result)
    }

    pub fn set_status_listener(&mut self, mask: StatusFlags, listener: impl StatusListener + 'static) {
        self.status_listener = Some((mask, Box::new(listener)));
    }

    pub fn clear_status_listener(&mut self) {
        self.status_listener = None;
    }

    pub fn set_progress_listener(&mut self, listener: impl ProgressListener + 'static) {
        self.progress_listener = Some(Box::new(listener));
    }

    pub fn clear_progress_listener(&mut self) {
        self.progress_listener = None;
    }

    pub(crate) async fn write_command(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        self.io.write(Some(command), payload).await
    }

    /// Reads the next packet of a multi-packet response.
    pub(crate) async fn read_packet(&mut self) -> Result<&[u8]> {
        self.io.read().await?;
        Ok(self.io.packet())
    }

    pub(crate) fn check_command_ready(&self) -> Result<()> {
        self.check_open()?;
        if self.server.is_none() {
            return Err(Error::with_message(
                ErrorCode::InvalidHandle,
                "Connection is not authenticated",
            ));
        }
        if self.state != ConnState::Ready {
            return Err(Error::with_message(
                ErrorCode::InvalidHandle,
                "Commands out of sync: a result set is still pending",
            ));
        }
        Ok(())
    }
}

impl<S> Connection<S> {
    fn apply_ok(&mut self, ok: OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warnings = ok.warnings;
        self.info = ok.info;
        if let Some(records) = ok.session_state {
            self.session_state = records;
        }
        self.set_status(ok.status);
        self.state = ConnState::Ready;
    }

    pub(crate) fn apply_eof(&mut self, eof: EofPacket) {
        self.warnings = eof.warnings;
        self.set_status(eof.status);
    }

    fn set_status(&mut self, status: StatusFlags) {
        self.status = status;
        if let Some((mask, listener)) = self.status_listener.as_mut() {
            if status.intersects(*mask) {
                listener.on_status(status);
            }
        }
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub(crate) fn link(&self) -> &Arc<AtomicBool> {
        &self.link
    }

    /// Whether `link` was handed out by this connection and the connection is still open.
    pub(crate) fn check_link(&self, link: &Arc<AtomicBool>) -> Result<()> {
        if !Arc::ptr_eq(&self.link, link) || !link.load(Ordering::Acquire) {
            return Err(Error::with_message(
                ErrorCode::InvalidHandle,
                "Handle does not belong to this open connection",
            ));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::with_message(ErrorCode::InvalidHandle, "Connection is closed"));
        }
        Ok(())
    }

    /// Records the outcome as the connection's last error.
    pub(crate) fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(err) => {
                if err.is(ErrorCode::MalformedPacket) {
                    metrics::record_malformed_packet();
                }
                self.last_error = Some(err.clone());
            }
        }
        result
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.link.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server.as_ref()
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.version.as_str())
    }

    pub fn thread_id(&self) -> Option<u32> {
        self.server.as_ref().map(|s| s.thread_id)
    }

    pub fn is_mariadb(&self) -> bool {
        self.server.as_ref().is_some_and(|s| s.is_mariadb)
    }

    /// Capabilities both sides agreed on.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn status(&self) -> StatusFlags {
        self.status
    }

    pub fn warning_count(&self) -> u16 {
        self.warnings
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    /// Column count of the most recent result set.
    pub fn column_count(&self) -> u64 {
        self.column_count
    }

    pub fn info(&self) -> &[u8] {
        &self.info
    }

    pub fn session_state(&self) -> &[SessionStateRecord] {
        &self.session_state
    }

    pub fn database(&self) -> Option<&str> {
        self.config.database.as_deref()
    }

    pub fn get_ref(&self) -> &PacketIo<S> {
        &self.io
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.link.store(false, Ordering::Release);
    }
}

#[track_caller]
fn unexpected(response: &Response) -> Error {
    let kind = match response {
        Response::Error(_) => "error",
        Response::Progress(_) => "progress report",
        Response::Eof(_) => "EOF",
        Response::LocalInfile(_) => "local infile request",
        Response::Ok(_) => "OK",
        Response::ColumnCount(_) => "result set",
    };
    Error::with_message(ErrorCode::MalformedPacket, format!("Unexpected {kind} packet"))
}
