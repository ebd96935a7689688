//! Binary protocol codec for prepared statements.
//!
//! Covers the per-type store length table shared with binary row decoding, parameter binds,
//! the `COM_STMT_EXECUTE` payload and the prepare response header.

use bytes::BufMut;

use crate::error::{Error, ErrorCode, Result};
use crate::protocol::buffer::PacketBuffer;
use crate::protocol::constants::ColumnType;
use crate::protocol::temporal::{Temporal, TemporalKind};
use crate::protocol::wire::{Reader, WireWrite, lenenc_len};

/// Statement id, cursor flags and iteration count.
pub const EXEC_HEADER_LEN: usize = 9;

/// Capacity reserved per temporal parameter: length byte plus the longest body.
const TEMPORAL_RESERVE: usize = 14;

/// Extra capacity reserved per variable-length parameter for its length prefix.
const LENENC_RESERVE: usize = 9;

/// Type flag sent after a parameter's type code.
const UNSIGNED_FLAG: u8 = 0x80;

/// Fixed binary width of a type, `None` for temporal and length-encoded types.
pub fn store_len(column_type: ColumnType) -> Option<usize> {
    match column_type {
        ColumnType::Tiny => Some(1),
        ColumnType::Short | ColumnType::Year => Some(2),
        ColumnType::Int24 | ColumnType::Long => Some(4),
        ColumnType::LongLong => Some(8),
        ColumnType::Float => Some(4),
        ColumnType::Double => Some(8),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Temporal(Temporal),
    Bytes(Vec<u8>),
}

/// One statement parameter: the wire type to send and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    pub column_type: ColumnType,
    pub unsigned: bool,
    pub value: BindValue,
}

impl Bind {
    pub fn new(column_type: ColumnType, value: BindValue) -> Self {
        Self {
            column_type,
            unsigned: false,
            value,
        }
    }

    pub fn null() -> Self {
        Self::new(ColumnType::Null, BindValue::Null)
    }

    pub fn tiny(value: i8) -> Self {
        Self::new(ColumnType::Tiny, BindValue::Int(value.into()))
    }

    pub fn short(value: i16) -> Self {
        Self::new(ColumnType::Short, BindValue::Int(value.into()))
    }

    pub fn long(value: i32) -> Self {
        Self::new(ColumnType::Long, BindValue::Int(value.into()))
    }

    pub fn longlong(value: i64) -> Self {
        Self::new(ColumnType::LongLong, BindValue::Int(value))
    }

    pub fn ulonglong(value: u64) -> Self {
        Self::new(ColumnType::LongLong, BindValue::UInt(value)).unsigned()
    }

    pub fn float(value: f32) -> Self {
        Self::new(ColumnType::Float, BindValue::Float(value))
    }

    pub fn double(value: f64) -> Self {
        Self::new(ColumnType::Double, BindValue::Double(value))
    }

    pub fn string(value: impl Into<Vec<u8>>) -> Self {
        Self::new(ColumnType::VarString, BindValue::Bytes(value.into()))
    }

    pub fn blob(value: impl Into<Vec<u8>>) -> Self {
        Self::new(ColumnType::Blob, BindValue::Bytes(value.into()))
    }

    /// Binds a date, datetime or time; the wire type follows the value's shape.
    pub fn temporal(value: Temporal) -> Self {
        let column_type = match value.kind {
            TemporalKind::Date => ColumnType::Date,
            TemporalKind::Time => ColumnType::Time,
            TemporalKind::DateTime | TemporalKind::Invalid => ColumnType::DateTime,
        };
        Self::new(column_type, BindValue::Temporal(value))
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn is_null(&self) -> bool {
        self.column_type == ColumnType::Null || self.value == BindValue::Null
    }

    /// Capacity reserved for this parameter's value.
    fn reserve_len(&self) -> usize {
        match (store_len(self.column_type), &self.value) {
            (Some(len), _) => len,
            (None, BindValue::Bytes(bytes)) => bytes.len() + LENENC_RESERVE,
            (None, _) => TEMPORAL_RESERVE,
        }
    }

    /// Exact encoded length; rejects values that do not fit the declared type.
    #[track_caller]
    fn encoded_len(&self, index: usize) -> Result<usize> {
        let column_type = self.column_type;
        match (&self.value, store_len(column_type)) {
            (BindValue::Int(_) | BindValue::UInt(_), Some(len))
                if !matches!(column_type, ColumnType::Float | ColumnType::Double) =>
            {
                Ok(len)
            }
            (BindValue::Float(_) | BindValue::Double(_), Some(len))
                if matches!(column_type, ColumnType::Float | ColumnType::Double) =>
            {
                Ok(len)
            }
            (BindValue::Temporal(value), None) if column_type.is_temporal() => value
                .wire_len()
                .map(|len| 1 + usize::from(len))
                .ok_or_else(|| invalid_param(index, "invalid temporal value")),
            (BindValue::Bytes(bytes), None) if !column_type.is_temporal() => {
                Ok(lenenc_len(bytes.len() as u64) + bytes.len())
            }
            _ => Err(invalid_param(
                index,
                &format!("value does not match type {column_type:?}"),
            )),
        }
    }

    /// Writes the value; `encoded_len` must have accepted it.
    fn put_value<B: BufMut + ?Sized>(&self, out: &mut B) -> Result<()> {
        match &self.value {
            BindValue::Int(v) => put_fixed(out, &v.to_le_bytes(), self.column_type),
            BindValue::UInt(v) => put_fixed(out, &v.to_le_bytes(), self.column_type),
            BindValue::Float(v) => put_real(out, f64::from(*v), self.column_type),
            BindValue::Double(v) => put_real(out, *v, self.column_type),
            BindValue::Temporal(value) => {
                value.encode(out)?;
            }
            BindValue::Bytes(bytes) => out.put_lenenc_bytes(bytes),
            BindValue::Null => {}
        }
        Ok(())
    }
}

fn put_fixed<B: BufMut + ?Sized>(out: &mut B, le_bytes: &[u8; 8], column_type: ColumnType) {
    let len = store_len(column_type).unwrap_or(8);
    out.put_slice(&le_bytes[..len]);
}

fn put_real<B: BufMut + ?Sized>(out: &mut B, value: f64, column_type: ColumnType) {
    if column_type == ColumnType::Float {
        out.put_f32_le(value as f32);
    } else {
        out.put_f64_le(value);
    }
}

#[track_caller]
fn invalid_param(index: usize, detail: &str) -> Error {
    Error::with_message(ErrorCode::InvalidValue, format!("Parameter {index}: {detail}"))
}

/// Builds the execute payload (without command byte) into `buf` and returns its length.
///
/// `buf` grows to the estimated size in aligned steps and never shrinks, so its capacity can
/// exceed the returned length after an earlier, larger execution.
#[track_caller]
pub fn build_execute(statement_id: u32, params: &[Bind], buf: &mut PacketBuffer) -> Result<usize> {
    let null_len = params.len().div_ceil(8);
    let mut reserve = EXEC_HEADER_LEN;
    let mut exact = EXEC_HEADER_LEN;
    if !params.is_empty() {
        reserve += null_len + 1 + 2 * params.len();
        exact += null_len + 1;
    }
    for (index, param) in params.iter().enumerate() {
        reserve += param.reserve_len();
        if !param.is_null() {
            exact += 2 + param.encoded_len(index)?;
        }
    }

    buf.clear();
    buf.ensure_capacity(reserve.max(exact));
    let mut out: &mut [u8] = buf.as_mut_slice();
    let capacity = out.len();

    out.put_u32_le(statement_id);
    out.put_u8(0);
    out.put_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; null_len];
        for (index, _) in params.iter().enumerate().filter(|(_, p)| p.is_null()) {
            null_bitmap[index / 8] |= 1 << (index % 8);
        }
        out.put_slice(&null_bitmap);
        out.put_u8(1);

        for param in params.iter().filter(|p| !p.is_null()) {
            out.put_u8(param.column_type as u8);
            out.put_u8(if param.unsigned { UNSIGNED_FLAG } else { 0 });
        }
        for param in params.iter().filter(|p| !p.is_null()) {
            param.put_value(&mut out)?;
        }
    }

    let written = capacity - out.len();
    buf.advance_end(written)?;
    Ok(written)
}

/// Header of a successful prepare response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub column_count: u16,
    pub param_count: u16,
    pub warnings: u16,
}

#[track_caller]
pub fn decode_prepare_ok(packet: &[u8]) -> Result<PrepareOk> {
    let mut r = Reader::new(packet);
    if r.get_u8()? != 0x00 {
        return Err(Error::malformed(0));
    }
    let statement_id = r.get_u32()?;
    let column_count = r.get_u16()?;
    let param_count = r.get_u16()?;
    r.skip(1)?;
    let warnings = r.get_u16()?;
    Ok(PrepareOk {
        statement_id,
        column_count,
        param_count,
        warnings,
    })
}
