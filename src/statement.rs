//! Server-side prepared statements.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::arena::Arena;
use crate::connection::Connection;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::buffer::PacketBuffer;
use crate::protocol::column::{ColumnDef, decode_column};
use crate::protocol::constants::Command;
use crate::protocol::response::{ERR_HEADER, Response, decode_error, is_row_eof};
use crate::protocol::stmt::{Bind, EXEC_HEADER_LEN, build_execute, decode_prepare_ok};
use crate::result::{ResultSet, RowFormat};

/// Supplies parameter values right before the execute payload is built.
pub trait ParamSource: Send {
    /// Replaces or updates `params`; the result must hold one bind per placeholder.
    fn fill(&mut self, params: &mut Vec<Bind>) -> Result<()>;
}

impl<F> ParamSource for F
where
    F: FnMut(&mut Vec<Bind>) -> Result<()> + Send,
{
    fn fill(&mut self, params: &mut Vec<Bind>) -> Result<()> {
        self(params)
    }
}

pub struct Statement {
    id: u32,
    param_count: u16,
    column_count: u16,
    warnings: u16,
    arena: Arena,
    param_defs: Vec<ColumnDef>,
    columns: Vec<ColumnDef>,
    binds: Vec<Bind>,
    exec_buf: PacketBuffer,
    exec_len: usize,
    param_source: Option<Box<dyn ParamSource>>,
    link: Arc<AtomicBool>,
    last_error: Option<Error>,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.id)
            .field("param_count", &self.param_count)
            .field("column_count", &self.column_count)
            .field("exec_len", &self.exec_len)
            .field("has_param_source", &self.param_source.is_some())
            .finish_non_exhaustive()
    }
}

impl Statement {
    /// Sends `COM_STMT_PREPARE` and reads the parameter and column definitions.
    pub(crate) async fn prepare<S>(conn: &mut Connection<S>, sql: &str) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if sql.is_empty() {
            return Err(Error::with_message(
                ErrorCode::NullValueParameter,
                "Statement text must not be empty",
            ));
        }
        conn.check_command_ready()?;
        conn.write_command(Command::StmtPrepare, sql.as_bytes()).await?;

        let prepared = {
            let packet = conn.read_packet().await?;
            if packet.first() == Some(&ERR_HEADER) {
                return match decode_error(packet)? {
                    Response::Error(err) => Err(err),
                    _ => Err(Error::malformed(0)),
                };
            }
            decode_prepare_ok(packet)?
        };

        let mut arena = Arena::new(conn.config().arena_prealloc);
        let param_defs = read_definitions(conn, prepared.param_count, &mut arena).await?;
        let columns = read_definitions(conn, prepared.column_count, &mut arena).await?;
        debug!(
            statement_id = prepared.statement_id,
            params = prepared.param_count,
            columns = prepared.column_count,
            "statement prepared"
        );

        Ok(Self {
            id: prepared.statement_id,
            param_count: prepared.param_count,
            column_count: prepared.column_count,
            warnings: prepared.warnings,
            arena,
            param_defs,
            columns,
            binds: Vec::new(),
            exec_buf: PacketBuffer::with_capacity(EXEC_HEADER_LEN),
            exec_len: 0,
            param_source: None,
            link: conn.link().clone(),
            last_error: None,
        })
    }

    /// Binds one value per placeholder.
    pub fn set_params(&mut self, binds: Vec<Bind>) -> Result<()> {
        let result = self.check_param_count(binds.len());
        if result.is_ok() {
            self.binds = binds;
        }
        self.track(result)
    }

    /// Registers a callback consulted by every [`Statement::fill_exec_buffer`].
    pub fn set_param_source(&mut self, source: impl ParamSource + 'static) -> Result<()> {
        if self.param_count == 0 {
            return self.track(Err(Error::new(ErrorCode::StmtWithoutParameters)));
        }
        self.param_source = Some(Box::new(source));
        Ok(())
    }

    pub fn clear_param_source(&mut self) {
        self.param_source = None;
    }

    /// Serializes the current parameters into the execute buffer.
    pub fn fill_exec_buffer(&mut self) -> Result<usize> {
        let result = self.fill_inner();
        self.track(result)
    }

    fn fill_inner(&mut self) -> Result<usize> {
        if let Some(source) = self.param_source.as_mut() {
            source.fill(&mut self.binds)?;
        }
        if self.param_count > 0 {
            self.check_param_count(self.binds.len())?;
        }
        self.exec_len = 0;
        self.exec_len = build_execute(self.id, &self.binds, &mut self.exec_buf)?;
        Ok(self.exec_len)
    }

    fn check_param_count(&self, given: usize) -> Result<()> {
        if self.param_count == 0 {
            return Err(Error::new(ErrorCode::StmtWithoutParameters));
        }
        if given != usize::from(self.param_count) {
            return Err(Error::with_message(
                ErrorCode::InvalidValue,
                format!("Statement expects {} parameters, got {given}", self.param_count),
            ));
        }
        Ok(())
    }

    /// Sends the filled execute buffer. Rows come back in the binary format.
    pub async fn execute<S>(&mut self, conn: &mut Connection<S>) -> Result<Option<ResultSet>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.execute_inner(conn).await;
        self.track(result)
    }

    async fn execute_inner<S>(&mut self, conn: &mut Connection<S>) -> Result<Option<ResultSet>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        conn.check_link(&self.link)?;
        if self.exec_len == 0 {
            return Err(Error::new(ErrorCode::StmtNotReady));
        }
        conn.check_command_ready()?;
        let payload = &self.exec_buf.pending()[..self.exec_len];
        conn.write_command(Command::StmtExecute, payload).await?;
        conn.read_result(RowFormat::Binary).await
    }

    /// Sends `COM_STMT_RESET`, discarding long data and any open cursor on the server.
    pub async fn reset<S>(&mut self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = async {
            conn.check_link(&self.link)?;
            conn.check_command_ready()?;
            conn.write_command(Command::StmtReset, &self.id.to_le_bytes()).await?;
            match conn.read_response().await? {
                Response::Ok(_) => Ok(()),
                _ => Err(Error::malformed(0)),
            }
        }
        .await;
        self.track(result)
    }

    /// Deallocates the statement on the server. The server sends no reply.
    pub async fn close<S>(self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if conn.check_link(&self.link).is_err() {
            return Ok(());
        }
        conn.write_command(Command::StmtClose, &self.id.to_le_bytes()).await?;
        debug!(statement_id = self.id, "statement closed");
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    pub fn column_count(&self) -> u16 {
        self.column_count
    }

    /// Warnings reported by the prepare response.
    pub fn warning_count(&self) -> u16 {
        self.warnings
    }

    /// Placeholder definitions announced by the server.
    pub fn param_defs(&self) -> &[ColumnDef] {
        &self.param_defs
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_name(&self, index: usize) -> Option<&[u8]> {
        self.columns.get(index).map(|c| self.arena.get(c.name))
    }

    pub fn params(&self) -> &[Bind] {
        &self.binds
    }

    /// Length of the last serialized execute payload, 0 before the first fill.
    pub fn exec_len(&self) -> usize {
        self.exec_len
    }

    /// Allocated size of the execute buffer, at least [`Statement::exec_len`].
    pub fn exec_capacity(&self) -> usize {
        self.exec_buf.capacity()
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }
}

/// Reads `count` definitions followed by their terminating EOF. Nothing is sent for a count of 0.
async fn read_definitions<S>(
    conn: &mut Connection<S>,
    count: u16,
    arena: &mut Arena,
) -> Result<Vec<ColumnDef>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let capabilities = conn.capabilities();
    let mut defs = Vec::with_capacity(usize::from(count));
    if count == 0 {
        return Ok(defs);
    }
    for _ in 0..count {
        let packet = conn.read_packet().await?;
        defs.push(decode_column(packet, capabilities, arena)?);
    }
    let packet = conn.read_packet().await?;
    if !is_row_eof(packet) {
        return Err(Error::malformed(0));
    }
    Ok(defs)
}
