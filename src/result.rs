//! Result sets produced by text queries and executed statements.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::arena::{Arena, ArenaSlice};
use crate::connection::{ConnState, Connection};
use crate::error::{Error, ErrorCode, Result};
use crate::metrics;
use crate::protocol::column::{ColumnDef, decode_column};
use crate::protocol::constants::FieldAttr;
use crate::protocol::response::{ERR_HEADER, Response, decode_eof, decode_error, is_row_eof};
use crate::protocol::row::{RowEvent, decode_binary_row, decode_text_row};
use crate::protocol::temporal::Temporal;
use crate::protocol::wire::Reader;

/// Columns a result set may announce; the server caps tables and select lists far below this.
const MAX_COLUMNS: u64 = u16::MAX as u64;

/// Row encoding used by a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    Text,
    Binary,
}

/// Columns and the current row of one result.
///
/// Column metadata lives in `arena` for the lifetime of the result. Row data lives in a second
/// arena that is reset before every fetch, so handles from the previous row stop being valid.
#[derive(Debug)]
pub struct ResultSet {
    arena: Arena,
    rows: Arena,
    columns: Vec<ColumnDef>,
    fields: Vec<Option<ArenaSlice>>,
    row_count: u64,
    eof: bool,
    format: RowFormat,
    link: Arc<AtomicBool>,
    last_error: Option<Error>,
}

impl ResultSet {
    /// Reads `count` column definitions and the EOF that closes them.
    pub(crate) async fn read_metadata<S>(
        conn: &mut Connection<S>,
        count: u64,
        format: RowFormat,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if count > MAX_COLUMNS {
            return Err(Error::with_message(
                ErrorCode::MalformedPacket,
                format!("Malformed packet (Offset 0): column count {count} exceeds {MAX_COLUMNS}"),
            ));
        }
        let count = usize::try_from(count).map_err(|_| Error::malformed(0))?;
        let capabilities = conn.capabilities();
        let prealloc = conn.config().arena_prealloc;
        let mut arena = Arena::new(prealloc);
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let packet = conn.read_packet().await?;
            columns.push(decode_column(packet, capabilities, &mut arena)?);
        }
        let eof = {
            let packet = conn.read_packet().await?;
            if !is_row_eof(packet) {
                return Err(Error::malformed(0));
            }
            decode_eof(packet)?
        };
        conn.apply_eof(eof);
        conn.set_state(ConnState::Fetching);
        debug!(columns = count, ?format, "result set opened");

        Ok(Self {
            arena,
            rows: Arena::new(prealloc),
            fields: Vec::with_capacity(count),
            columns,
            row_count: 0,
            eof: false,
            format,
            link: conn.link().clone(),
            last_error: None,
        })
    }

    /// Fetches the next row. Returns `false` once the server signalled the end of the result.
    ///
    /// Row data is released before the next row is read, so fields of the previous row are no
    /// longer available once this is called.
    pub async fn fetch_row<S>(&mut self, conn: &mut Connection<S>) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.fetch_inner(conn).await;
        self.track(result)
    }

    async fn fetch_inner<S>(&mut self, conn: &mut Connection<S>) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        conn.check_link(&self.link)?;
        if self.eof {
            return Ok(false);
        }

        self.fields.clear();
        self.rows.reset();
        let packet = conn.read_packet().await?;
        if packet.first() == Some(&ERR_HEADER) {
            let response = decode_error(packet)?;
            conn.set_state(ConnState::Ready);
            self.eof = true;
            return match response {
                Response::Error(err) => Err(err),
                _ => Err(Error::malformed(0)),
            };
        }
        let event = match self.format {
            RowFormat::Text => decode_text_row(packet, &mut self.columns, &mut self.rows, &mut self.fields),
            RowFormat::Binary => decode_binary_row(packet, &mut self.columns, &mut self.rows, &mut self.fields),
        }?;

        match event {
            RowEvent::Row => {
                self.row_count += 1;
                Ok(true)
            }
            RowEvent::End(eof) => {
                self.eof = true;
                conn.apply_eof(eof);
                conn.set_state(ConnState::Ready);
                metrics::record_rows_fetched(self.row_count);
                debug!(rows = self.row_count, "result set exhausted");
                Ok(false)
            }
        }
    }

    /// Reads and discards the remaining rows so the connection accepts commands again.
    pub async fn drain<S>(&mut self, conn: &mut Connection<S>) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = self.row_count;
        while self.fetch_row(conn).await? {}
        Ok(self.row_count - start)
    }

    /// Drains the result when its connection is still open, then releases both arenas.
    pub async fn close<S>(mut self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if conn.check_link(&self.link).is_ok() && !self.eof {
            self.drain(conn).await?;
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    pub fn format(&self) -> RowFormat {
        self.format
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&ColumnDef> {
        self.columns.get(index)
    }

    pub fn column_name(&self, index: usize) -> Option<&[u8]> {
        self.columns.get(index).map(|c| self.arena.get(c.name))
    }

    pub fn column_table(&self, index: usize) -> Option<&[u8]> {
        self.columns.get(index).map(|c| self.arena.get(c.table))
    }

    /// Extended metadata attribute of a column.
    pub fn column_attr(&self, index: usize, attr: FieldAttr) -> Result<Option<&[u8]>> {
        let column = self
            .columns
            .get(index)
            .ok_or_else(|| Error::with_message(ErrorCode::InvalidValue, format!("No column {index}")))?;
        Ok(column.attr(attr).map(|slice| self.arena.get(slice)))
    }

    /// Number of rows fetched so far.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Field of the current row, `None` for SQL NULL or a missing index.
    pub fn field(&self, index: usize) -> Option<&[u8]> {
        self.fields
            .get(index)
            .copied()
            .flatten()
            .map(|slice| self.rows.get(slice))
    }

    pub fn field_str(&self, index: usize) -> Option<std::borrow::Cow<'_, str>> {
        self.field(index).map(String::from_utf8_lossy)
    }

    /// All fields of the current row.
    pub fn fields(&self) -> impl Iterator<Item = Option<&[u8]>> {
        self.fields.iter().map(|f| f.map(|slice| self.rows.get(slice)))
    }

    /// Decodes a temporal field of a binary row.
    pub fn field_temporal(&self, index: usize) -> Result<Option<Temporal>> {
        if self.format != RowFormat::Binary {
            return Err(Error::with_message(
                ErrorCode::InvalidValue,
                "Temporal decoding applies to binary rows",
            ));
        }
        self.field(index)
            .map(|bytes| Temporal::decode(&mut Reader::new(bytes)))
            .transpose()
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Memory held by column metadata.
    pub fn metadata_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::protocol::column::ColumnFlags;
    use crate::protocol::column::tests::column_packet;
    use crate::protocol::constants::{Capabilities, ColumnType, MAX_FRAME_LEN, StatusFlags};
    use crate::protocol::frame::{Frame, FrameCodec};
    use crate::protocol::wire::WireWrite;
    use bytes::{BufMut, BytesMut};
    use futures::{SinkExt, StreamExt};
    use tokio::io::{DuplexStream, duplex};
    use tokio_util::codec::Framed;

    type Server = Framed<DuplexStream, FrameCodec>;

    fn greeting() -> Vec<u8> {
        let caps = Capabilities::CLIENT - Capabilities::MYSQL;
        let mut p = BytesMut::new();
        p.put_u8(10);
        p.put_null_terminated(b"5.5.5-10.6.4-MariaDB");
        p.put_u32_le(1);
        p.put_slice(b"12345678");
        p.put_u8(0);
        p.put_u16_le(caps.low() as u16);
        p.put_u8(45);
        p.put_u16_le(2);
        p.put_u16_le((caps.low() >> 16) as u16);
        p.put_u8(21);
        p.put_bytes(0, 6);
        p.put_u32_le(0);
        p.put_slice(b"9abcdefghijk");
        p.put_u8(0);
        p.put_null_terminated(b"mysql_native_password");
        p.to_vec()
    }

    async fn connected() -> (Connection<DuplexStream>, Server) {
        let (client, server) = duplex(64 * 1024);
        let mut server = Framed::new(server, FrameCodec);
        let script = async {
            server.send(Frame::new(0, greeting())).await.unwrap();
            server.next().await.unwrap().unwrap();
            server.send(Frame::new(2, vec![0, 0, 0, 2, 0, 0, 0])).await.unwrap();
        };
        let config = ClientConfig {
            user: "app".into(),
            ..ClientConfig::default()
        };
        let (conn, ()) = tokio::join!(Connection::connect(client, config), script);
        (conn.unwrap(), server)
    }

    fn eof(status: StatusFlags) -> Vec<u8> {
        let mut p = vec![0xFE, 0, 0];
        p.extend_from_slice(&status.bits().to_le_bytes());
        p
    }

    fn text_row(values: &[Option<&str>]) -> Vec<u8> {
        let mut p = BytesMut::new();
        for value in values {
            match value {
                Some(v) => p.put_lenenc_bytes(v.as_bytes()),
                None => p.put_u8(0xFB),
            }
        }
        p.to_vec()
    }

    async fn send_result(server: &mut Server, rows: &[Vec<u8>]) {
        server.next().await.unwrap().unwrap();
        let mut seq = 1;
        let mut packets = vec![
            vec![2],
            column_packet("id", ColumnType::Long, ColumnFlags::NOT_NULL),
            column_packet("name", ColumnType::VarString, ColumnFlags::empty()),
            eof(StatusFlags::AUTOCOMMIT),
        ];
        packets.extend(rows.iter().cloned());
        packets.push(eof(StatusFlags::AUTOCOMMIT));
        for packet in packets {
            server.send(Frame::new(seq, packet)).await.unwrap();
            seq = seq.wrapping_add(1);
        }
    }

    #[tokio::test]
    async fn test_fetch_text_rows() {
        let (mut conn, mut server) = connected().await;
        let rows = [text_row(&[Some("1"), Some("foo")]), text_row(&[Some("2"), None])];
        let (result, ()) = tokio::join!(conn.query("SELECT id, name FROM t"), send_result(&mut server, &rows));
        let mut rs = result.unwrap().unwrap();

        assert_eq!(conn.column_count(), 2);
        assert_eq!(conn.state(), ConnState::Fetching);
        assert_eq!(rs.column_name(1), Some(&b"name"[..]));
        assert_eq!(rs.column_table(0), Some(&b"t1"[..]));

        assert!(rs.fetch_row(&mut conn).await.unwrap());
        assert_eq!(rs.field(0), Some(&b"1"[..]));
        assert_eq!(rs.field_str(1).as_deref(), Some("foo"));

        assert!(rs.fetch_row(&mut conn).await.unwrap());
        assert_eq!(rs.fields().collect::<Vec<_>>(), vec![Some(&b"2"[..]), None]);
        assert_eq!(rs.columns()[1].max_length, 3);

        assert!(!rs.fetch_row(&mut conn).await.unwrap());
        assert!(rs.is_eof());
        assert_eq!(rs.row_count(), 2);
        assert_eq!(conn.state(), ConnState::Ready);
        assert!(!rs.fetch_row(&mut conn).await.unwrap());
    }

    #[tokio::test]
    async fn test_commands_out_of_sync_until_drained() {
        let (mut conn, mut server) = connected().await;
        let rows = [text_row(&[Some("1"), Some("a")])];
        let (result, ()) = tokio::join!(conn.query("SELECT 1"), send_result(&mut server, &rows));
        let mut rs = result.unwrap().unwrap();

        let err = conn.query("SELECT 2").await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidHandle));

        assert_eq!(rs.drain(&mut conn).await.unwrap(), 1);
        assert_eq!(conn.state(), ConnState::Ready);
    }

    #[tokio::test]
    async fn test_server_error_mid_result() {
        let (mut conn, mut server) = connected().await;
        let mut err = vec![0xFF, 0x0D, 0x05, b'#'];
        err.extend_from_slice(b"70100Query execution was interrupted");
        let rows = [text_row(&[Some("1"), Some("a")]), err];
        let script = async {
            send_result(&mut server, &rows).await;
        };
        let (result, ()) = tokio::join!(conn.query("SELECT SLEEP(10)"), script);
        let mut rs = result.unwrap().unwrap();
        assert!(rs.fetch_row(&mut conn).await.unwrap());
        let err = rs.fetch_row(&mut conn).await.unwrap_err();
        assert_eq!(err.number(), 1293);
        assert_eq!(rs.last_error().unwrap().sqlstate(), "70100");
        assert_eq!(conn.state(), ConnState::Ready);
    }

    #[tokio::test]
    async fn test_fetch_after_close_is_invalid_handle() {
        let (mut conn, mut server) = connected().await;
        let rows = [text_row(&[Some("1"), Some("a")])];
        let (result, ()) = tokio::join!(conn.query("SELECT 1"), send_result(&mut server, &rows));
        let mut rs = result.unwrap().unwrap();

        conn.close().await.unwrap();
        let err = rs.fetch_row(&mut conn).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidHandle));
        assert!(rs.last_error().is_some());
        assert_eq!(rs.column_name(0), Some(&b"id"[..]));
    }

    #[tokio::test]
    async fn test_fetch_on_other_connection_is_invalid_handle() {
        let (mut conn, mut server) = connected().await;
        let (mut other, _other_server) = connected().await;
        let rows = [text_row(&[Some("1"), Some("a")])];
        let (result, ()) = tokio::join!(conn.query("SELECT 1"), send_result(&mut server, &rows));
        let mut rs = result.unwrap().unwrap();

        let err = rs.fetch_row(&mut other).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidHandle));
    }

    #[tokio::test]
    async fn test_missing_metadata_eof_is_malformed() {
        let (mut conn, mut server) = connected().await;
        let script = async {
            server.next().await.unwrap().unwrap();
            server.send(Frame::new(1, vec![1])).await.unwrap();
            server
                .send(Frame::new(2, column_packet("id", ColumnType::Long, ColumnFlags::empty())))
                .await
                .unwrap();
            server.send(Frame::new(3, text_row(&[Some("1")]))).await.unwrap();
        };
        let (result, ()) = tokio::join!(conn.query("SELECT 1"), script);
        assert!(result.unwrap_err().is(ErrorCode::MalformedPacket));
        assert!(conn.last_error().unwrap().is(ErrorCode::MalformedPacket));
    }

    #[tokio::test]
    async fn test_column_attr_out_of_range() {
        let (mut conn, mut server) = connected().await;
        let (result, ()) = tokio::join!(conn.query("SELECT 1"), send_result(&mut server, &[]));
        let rs = result.unwrap().unwrap();
        assert_eq!(rs.column_attr(0, FieldAttr::Format).unwrap(), None);
        assert!(rs.column_attr(5, FieldAttr::Format).unwrap_err().is(ErrorCode::InvalidValue));
        assert!(rs.field_temporal(0).unwrap_err().is(ErrorCode::InvalidValue));
        assert!(rs.metadata_bytes() > 0);
    }

    #[tokio::test]
    async fn test_oversized_column_count_is_rejected() {
        let (mut conn, mut server) = connected().await;
        let script = async {
            server.next().await.unwrap().unwrap();
            server.send(Frame::new(1, [0xFDu8, 0xFF, 0xFF, 0xFF])).await.unwrap();
        };
        let (result, ()) = tokio::join!(conn.query("SELECT *"), script);
        let err = result.unwrap_err();
        assert!(err.is(ErrorCode::MalformedPacket));
        assert!(err.message().contains("16777215"));
    }

    #[tokio::test]
    async fn test_eight_byte_column_count_in_full_frame() {
        let (mut conn, mut server) = connected().await;
        let script = async {
            server.next().await.unwrap().unwrap();
            let mut packet = vec![0u8; MAX_FRAME_LEN];
            packet[0] = 0xFE;
            packet[1..9].fill(0xFF);
            server.send(Frame::new(1, packet)).await.unwrap();
            server.send(Frame::new(2, Vec::<u8>::new())).await.unwrap();
        };
        let (result, ()) = tokio::join!(conn.query("SELECT *"), script);
        let err = result.unwrap_err();
        assert!(err.is(ErrorCode::MalformedPacket));
        assert!(conn.last_error().unwrap().is(ErrorCode::MalformedPacket));
    }
}
