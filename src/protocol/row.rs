//! Text and binary result row decoding.
//!
//! A row is validated completely before any field is copied into the arena or any column's
//! maximum length is updated.

use crate::arena::{Arena, ArenaSlice};
use crate::error::{Error, Result};
use crate::protocol::column::ColumnDef;
use crate::protocol::response::{EofPacket, decode_eof, is_row_eof};
use crate::protocol::stmt::store_len;
use crate::protocol::wire::{NULL_MARKER, Reader};

/// Bits preceding the first column in a binary row's null bitmap.
const BINARY_NULL_OFFSET: usize = 2;

const BINARY_ROW_HEADER: u8 = 0x00;

/// Outcome of decoding one packet inside a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEvent {
    /// A row was stored into the field vector.
    Row,
    /// The result set ended.
    End(EofPacket),
}

/// Decodes a text protocol row: one length-encoded string or NULL marker per column.
#[track_caller]
pub fn decode_text_row(
    packet: &[u8],
    columns: &mut [ColumnDef],
    arena: &mut Arena,
    fields: &mut Vec<Option<ArenaSlice>>,
) -> Result<RowEvent> {
    if is_row_eof(packet) {
        return Ok(RowEvent::End(decode_eof(packet)?));
    }

    let mut r = Reader::new(packet);
    let mut values = Vec::with_capacity(columns.len());
    for _ in 0..columns.len() {
        if r.peek_u8() == Some(NULL_MARKER) {
            r.skip(1)?;
            values.push(None);
        } else {
            values.push(Some(r.get_lenenc_bytes()?));
        }
    }

    store(values, columns, arena, fields);
    Ok(RowEvent::Row)
}

/// Decodes a binary protocol row produced by an executed statement.
#[track_caller]
pub fn decode_binary_row(
    packet: &[u8],
    columns: &mut [ColumnDef],
    arena: &mut Arena,
    fields: &mut Vec<Option<ArenaSlice>>,
) -> Result<RowEvent> {
    if is_row_eof(packet) {
        return Ok(RowEvent::End(decode_eof(packet)?));
    }

    let mut r = Reader::new(packet);
    if r.get_u8()? != BINARY_ROW_HEADER {
        return Err(Error::malformed(0));
    }
    let null_bitmap = r.get_bytes((columns.len() + 7 + BINARY_NULL_OFFSET) / 8)?;

    let mut values = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let bit = index + BINARY_NULL_OFFSET;
        if null_bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(None);
            continue;
        }
        let value = match store_len(column.column_type) {
            Some(len) => r.get_bytes(len)?,
            None if column.column_type.is_temporal() => {
                let len = r.peek_u8().ok_or_else(|| Error::malformed(r.offset()))?;
                r.get_bytes(1 + usize::from(len))?
            }
            None => r.get_lenenc_bytes()?,
        };
        values.push(Some(value));
    }

    store(values, columns, arena, fields);
    Ok(RowEvent::Row)
}

fn store(
    values: Vec<Option<&[u8]>>,
    columns: &mut [ColumnDef],
    arena: &mut Arena,
    fields: &mut Vec<Option<ArenaSlice>>,
) {
    fields.clear();
    for (value, column) in values.into_iter().zip(columns.iter_mut()) {
        fields.push(value.map(|bytes| {
            column.max_length = column.max_length.max(bytes.len());
            arena.alloc_copy(bytes)
        }));
    }
}
