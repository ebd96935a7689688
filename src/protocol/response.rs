//! Server response classification and status packet decoding.
//!
//! Every response to a command is classified by its first byte into exactly one [`Response`].
//! Decoders build owned values and never touch connection state, so a malformed packet leaves
//! the connection as it was.

use crate::error::{Error, Result};
use crate::protocol::constants::{Capabilities, MAX_FRAME_LEN, SessionStateType, StatusFlags};
use crate::protocol::wire::Reader;

pub const OK_HEADER: u8 = 0x00;
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;

/// Error number that marks an error packet as a progress report.
const PROGRESS_NUMBER: u16 = 0xFFFF;

/// Rows end on an EOF header in a packet shorter than this.
pub const ROW_EOF_MAX_LEN: usize = 9;

/// One session state change pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateRecord {
    pub kind: SessionStateType,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: StatusFlags,
    pub warnings: u16,
    pub info: Vec<u8>,
    /// Present when the server reported a session state change.
    pub session_state: Option<Vec<SessionStateRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: StatusFlags,
}

/// Progress of a long running statement (MariaDB).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub stage: u8,
    pub max_stage: u8,
    /// Progress within the stage in thousandths of a percent.
    pub progress: u32,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Response {
    Error(Error),
    Progress(ProgressReport),
    Eof(EofPacket),
    /// The server asks for a local file; carries the requested file name.
    LocalInfile(Vec<u8>),
    Ok(OkPacket),
    /// First packet of a result set.
    ColumnCount(u64),
}

/// Classifies a complete response packet.
#[track_caller]
pub fn classify(packet: &[u8], capabilities: Capabilities) -> Result<Response> {
    let first = *packet.first().ok_or_else(|| Error::malformed(0))?;
    match first {
        ERR_HEADER => decode_error(packet),
        EOF_HEADER if packet.len() < MAX_FRAME_LEN => Ok(Response::Eof(decode_eof(packet)?)),
        LOCAL_INFILE_HEADER => Ok(Response::LocalInfile(packet[1..].to_vec())),
        OK_HEADER => Ok(Response::Ok(decode_ok(packet, capabilities)?)),
        _ => Ok(Response::ColumnCount(Reader::new(packet).get_lenenc_int()?)),
    }
}

/// Whether a packet read inside a result set marks its end.
pub fn is_row_eof(packet: &[u8]) -> bool {
    packet.first() == Some(&EOF_HEADER) && packet.len() < ROW_EOF_MAX_LEN
}

/// Decodes an error packet into either a server error or a progress report.
#[track_caller]
pub fn decode_error(packet: &[u8]) -> Result<Response> {
    let mut r = Reader::new(packet);
    r.skip(1)?;
    let number = r.get_u16()?;

    if number == PROGRESS_NUMBER {
        // number of strings, always 1
        r.skip(1)?;
        let stage = r.get_u8()?;
        let max_stage = r.get_u8()?;
        let progress = r.get_u24()?;
        let info = r.get_lenenc_bytes()?.to_vec();
        return Ok(Response::Progress(ProgressReport {
            stage,
            max_stage,
            progress,
            info,
        }));
    }

    let mut sqlstate = String::new();
    if r.peek_u8() == Some(b'#') {
        r.skip(1)?;
        sqlstate = String::from_utf8_lossy(r.get_bytes(5)?).into_owned();
    }
    let message = String::from_utf8_lossy(r.get_rest()).into_owned();
    crate::metrics::record_server_error(number);
    Ok(Response::Error(Error::server(number, &sqlstate, message)))
}

/// EOF packet: header, warnings, status. Pre-4.1 servers send the header alone.
#[track_caller]
pub fn decode_eof(packet: &[u8]) -> Result<EofPacket> {
    let mut r = Reader::new(packet);
    r.skip(1)?;
    if r.remaining() < 4 {
        return Ok(EofPacket::default());
    }
    let warnings = r.get_u16()?;
    let status = StatusFlags::from_bits_truncate(r.get_u16()?);
    Ok(EofPacket { warnings, status })
}

#[track_caller]
pub fn decode_ok(packet: &[u8], capabilities: Capabilities) -> Result<OkPacket> {
    let mut r = Reader::new(packet);
    r.skip(1)?;
    let affected_rows = r.get_lenenc_int()?;
    let last_insert_id = r.get_lenenc_int()?;
    r.ensure(4)?;
    let status = StatusFlags::from_bits_truncate(r.get_u16()?);
    let warnings = r.get_u16()?;

    let mut ok = OkPacket {
        affected_rows,
        last_insert_id,
        status,
        warnings,
        ..OkPacket::default()
    };
    if r.is_empty() {
        return Ok(ok);
    }

    if !capabilities.contains(Capabilities::SESSION_TRACKING) {
        ok.info = r.get_rest().to_vec();
        return Ok(ok);
    }

    ok.info = r.get_lenenc_bytes()?.to_vec();
    if status.contains(StatusFlags::SESSION_STATE_CHANGED) {
        ok.session_state = Some(decode_session_state(&mut r)?);
    }
    Ok(ok)
}

#[track_caller]
fn decode_session_state(r: &mut Reader<'_>) -> Result<Vec<SessionStateRecord>> {
    let len = r.get_lenenc_int()?;
    let len = usize::try_from(len).map_err(|_| Error::malformed(r.offset()))?;
    let mut block = r.sub_reader(len)?;

    let mut records = Vec::new();
    while !block.is_empty() {
        let kind = SessionStateType::from(block.get_u8()?);
        if kind == SessionStateType::Gtid {
            block.get_lenenc_int()?;
        }
        let value = block.get_lenenc_bytes()?.to_vec();
        records.push(SessionStateRecord { kind, value });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::wire::WireWrite;
    use bytes::{BufMut, BytesMut};

    fn tracking() -> Capabilities {
        Capabilities::CLIENT
    }

    #[test]
    fn test_ok_packet_minimal() {
        let packet = [0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00];
        let Response::Ok(ok) = classify(&packet, tracking()).unwrap() else {
            panic!("expected OK");
        };
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 0);
        assert!(ok.status.contains(StatusFlags::AUTOCOMMIT));
        assert_eq!(ok.warnings, 0);
        assert!(ok.session_state.is_none());
    }

    #[test]
    fn test_ok_packet_truncated_status() {
        let err = decode_ok(&[0x00, 0x01, 0x00, 0x02], tracking()).unwrap_err();
        assert!(err.is(ErrorCode::MalformedPacket));
        assert_eq!(err.message(), "Malformed packet (Offset 3)");
    }

    #[test]
    fn test_ok_packet_with_session_state() {
        let mut records = BytesMut::new();
        records.put_u8(1); // schema
        records.put_lenenc_bytes(b"test");
        records.put_u8(3); // gtid
        records.put_lenenc_int(0);
        records.put_lenenc_bytes(b"0-1-42");

        let mut packet = BytesMut::new();
        packet.put_u8(0x00);
        packet.put_lenenc_int(0);
        packet.put_lenenc_int(0);
        packet.put_u16_le((StatusFlags::AUTOCOMMIT | StatusFlags::SESSION_STATE_CHANGED).bits());
        packet.put_u16_le(1);
        packet.put_lenenc_bytes(b"");
        packet.put_lenenc_bytes(&records);

        let ok = decode_ok(&packet, tracking()).unwrap();
        assert_eq!(ok.warnings, 1);
        let state = ok.session_state.unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state[0].kind, SessionStateType::Schema);
        assert_eq!(state[0].value, b"test");
        assert_eq!(state[1].kind, SessionStateType::Gtid);
        assert_eq!(state[1].value, b"0-1-42");
    }

    #[test]
    fn test_session_state_overrun_is_malformed() {
        let mut packet = BytesMut::new();
        packet.put_u8(0x00);
        packet.put_lenenc_int(0);
        packet.put_lenenc_int(0);
        packet.put_u16_le(StatusFlags::SESSION_STATE_CHANGED.bits());
        packet.put_u16_le(0);
        packet.put_lenenc_bytes(b"");
        packet.put_lenenc_int(20);
        packet.put_slice(&[1, 2, b'a']);
        assert!(decode_ok(&packet, tracking()).is_err());
    }

    #[test]
    fn test_ok_info_without_session_tracking() {
        let mut packet = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        packet.extend_from_slice(b"Rows matched: 1");
        let ok = decode_ok(&packet, Capabilities::PROTOCOL_41).unwrap();
        assert_eq!(ok.info, b"Rows matched: 1");
    }

    #[test]
    fn test_error_packet() {
        let mut packet = vec![0xFF, 0x15, 0x04, b'#'];
        packet.extend_from_slice(b"28000Access denied for user");
        let Response::Error(err) = classify(&packet, tracking()).unwrap() else {
            panic!("expected error");
        };
        assert_eq!(err.number(), 1045);
        assert_eq!(err.sqlstate(), "28000");
        assert_eq!(err.message(), "Access denied for user");
        assert!(err.is_server_error());
    }

    #[test]
    fn test_error_packet_without_sqlstate() {
        let mut packet = vec![0xFF, 0x10, 0x04];
        packet.extend_from_slice(b"Too many connections");
        let Response::Error(err) = decode_error(&packet).unwrap() else {
            panic!("expected error");
        };
        assert_eq!(err.number(), 1040);
        assert_eq!(err.sqlstate(), "HY000");
    }

    #[test]
    fn test_progress_packet() {
        let mut packet = BytesMut::new();
        packet.put_slice(&[0xFF, 0xFF, 0xFF, 1, 2, 3]);
        packet.put_u24_le(50_000);
        packet.put_lenenc_bytes(b"copy to tmp table");
        let Response::Progress(progress) = classify(&packet, tracking()).unwrap() else {
            panic!("expected progress");
        };
        assert_eq!(progress.stage, 2);
        assert_eq!(progress.max_stage, 3);
        assert_eq!(progress.progress, 50_000);
        assert_eq!(progress.info, b"copy to tmp table");
    }

    #[test]
    fn test_eof_and_column_count() {
        let Response::Eof(eof) = classify(&[0xFE, 0x01, 0x00, 0x22, 0x00], tracking()).unwrap() else {
            panic!("expected EOF");
        };
        assert_eq!(eof.warnings, 1);
        assert!(eof.status.contains(StatusFlags::AUTOCOMMIT));

        assert!(matches!(classify(&[0x02], tracking()).unwrap(), Response::ColumnCount(2)));
        assert!(matches!(
            classify(&[0xFC, 0x2C, 0x01], tracking()).unwrap(),
            Response::ColumnCount(300)
        ));
        assert!(matches!(
            classify(b"\xFBdata.csv", tracking()).unwrap(),
            Response::LocalInfile(name) if name == b"data.csv"
        ));
        assert!(classify(&[], tracking()).is_err());
    }

    #[test]
    fn test_row_eof_detection() {
        assert!(is_row_eof(&[0xFE, 0, 0, 2, 0]));
        assert!(!is_row_eof(&[0xFE, 1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(!is_row_eof(&[0x01, b'1']));
    }
}
