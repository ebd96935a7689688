//! Column definition packets.

use bitflags::bitflags;

use crate::arena::{Arena, ArenaSlice};
use crate::error::{Error, Result};
use crate::protocol::constants::{Capabilities, ColumnType, FieldAttr};
use crate::protocol::wire::Reader;

/// Declared length of the fixed trailer.
const FIXED_FIELDS_LEN: u8 = 0x0C;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ColumnFlags: u16 {
        const NOT_NULL = 1;
        const PRIMARY_KEY = 1 << 1;
        const UNIQUE_KEY = 1 << 2;
        const MULTIPLE_KEY = 1 << 3;
        const BLOB = 1 << 4;
        const UNSIGNED = 1 << 5;
        const ZEROFILL = 1 << 6;
        const BINARY = 1 << 7;
        const ENUM = 1 << 8;
        const AUTO_INCREMENT = 1 << 9;
        const TIMESTAMP = 1 << 10;
        const SET = 1 << 11;
        const NO_DEFAULT_VALUE = 1 << 12;
        const ON_UPDATE_NOW = 1 << 13;
        const NUM = 1 << 15;
    }
}

/// One decoded column. Names live in the result set's arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub catalog: ArenaSlice,
    pub schema: ArenaSlice,
    /// Table alias as written in the query.
    pub table: ArenaSlice,
    pub org_table: ArenaSlice,
    /// Column alias as written in the query.
    pub name: ArenaSlice,
    pub org_name: ArenaSlice,
    /// Extended metadata indexed by [`FieldAttr::index`].
    pub attrs: [Option<ArenaSlice>; FieldAttr::COUNT],
    pub charset: u16,
    /// Display length declared by the server.
    pub length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
    /// Largest field seen in this column so far.
    pub max_length: usize,
}

impl ColumnDef {
    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(ColumnFlags::UNSIGNED)
    }

    pub fn attr(&self, attr: FieldAttr) -> Option<ArenaSlice> {
        self.attrs[attr.index()]
    }
}

/// Decodes a column definition, copying its strings into `arena` once the whole packet has
/// been validated.
#[track_caller]
pub fn decode_column(packet: &[u8], capabilities: Capabilities, arena: &mut Arena) -> Result<ColumnDef> {
    let mut r = Reader::new(packet);
    let mut names = [&[][..]; 6];
    for name in names.iter_mut() {
        *name = r.get_lenenc_bytes()?;
    }

    let mut attrs: [Option<&[u8]>; FieldAttr::COUNT] = [None; FieldAttr::COUNT];
    if capabilities.contains(Capabilities::EXTENDED_METADATA) {
        let len = usize::try_from(r.get_lenenc_int()?).map_err(|_| Error::malformed(r.offset()))?;
        let mut block = r.sub_reader(len)?;
        while !block.is_empty() {
            let tag = block.get_u8()?;
            let value = block.get_lenenc_bytes()?;
            if let Ok(attr) = FieldAttr::try_from(tag) {
                attrs[attr.index()] = Some(value);
            }
        }
    }

    let marker_at = r.offset();
    if r.get_u8()? != FIXED_FIELDS_LEN {
        return Err(Error::malformed(marker_at));
    }
    r.ensure(usize::from(FIXED_FIELDS_LEN))?;
    let charset = r.get_u16()?;
    let length = r.get_u32()?;
    let type_at = r.offset();
    let column_type = ColumnType::try_from(r.get_u8()?).map_err(|_| Error::malformed(type_at))?;
    let flags = ColumnFlags::from_bits_retain(r.get_u16()?);
    let decimals = r.get_u8()?;
    r.skip(2)?;

    let [catalog, schema, table, org_table, name, org_name] = names.map(|s| arena.alloc_copy(s));
    Ok(ColumnDef {
        catalog,
        schema,
        table,
        org_table,
        name,
        org_name,
        attrs: attrs.map(|value| value.map(|v| arena.alloc_copy(v))),
        charset,
        length,
        column_type,
        flags,
        decimals,
        max_length: 0,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::wire::WireWrite;
    use bytes::{BufMut, BytesMut};

    /// Column packet as sent by a server without extended metadata.
    pub(crate) fn column_packet(name: &str, column_type: ColumnType, flags: ColumnFlags) -> Vec<u8> {
        let mut p = BytesMut::new();
        for s in ["def", "test", "t1", "t1", name, name] {
            p.put_lenenc_bytes(s.as_bytes());
        }
        p.put_u8(0x0C);
        p.put_u16_le(45);
        p.put_u32_le(11);
        p.put_u8(column_type as u8);
        p.put_u16_le(flags.bits());
        p.put_u8(0);
        p.put_u16_le(0);
        p.to_vec()
    }

    #[test]
    fn test_decode_column() {
        let mut arena = Arena::default();
        let packet = column_packet("id", ColumnType::Long, ColumnFlags::NOT_NULL | ColumnFlags::UNSIGNED);
        let col = decode_column(&packet, Capabilities::CLIENT, &mut arena).unwrap();
        assert_eq!(arena.get(col.catalog), b"def");
        assert_eq!(arena.get(col.schema), b"test");
        assert_eq!(arena.get(col.name), b"id");
        assert_eq!(col.charset, 45);
        assert_eq!(col.length, 11);
        assert_eq!(col.column_type, ColumnType::Long);
        assert!(col.is_unsigned());
        assert_eq!(col.attr(FieldAttr::Format), None);
    }

    #[test]
    fn test_decode_column_extended_metadata() {
        let mut p = BytesMut::new();
        for s in ["def", "test", "t", "t", "doc", "doc"] {
            p.put_lenenc_bytes(s.as_bytes());
        }
        let mut meta = BytesMut::new();
        meta.put_u8(0);
        meta.put_lenenc_bytes(b"json");
        meta.put_u8(1);
        meta.put_lenenc_bytes(b"compact");
        p.put_lenenc_bytes(&meta);
        p.put_slice(&[0x0C, 45, 0, 0xFF, 0xFF, 0, 0, 0xFC, 0x90, 0, 0, 0, 0]);

        let mut arena = Arena::default();
        let col = decode_column(&p, Capabilities::CLIENT | Capabilities::EXTENDED_METADATA, &mut arena)
            .unwrap();
        assert_eq!(arena.get(col.attr(FieldAttr::DataTypeName).unwrap()), b"json");
        assert_eq!(arena.get(col.attr(FieldAttr::Format).unwrap()), b"compact");
        assert_eq!(col.column_type, ColumnType::Blob);
        assert!(col.flags.contains(ColumnFlags::BLOB | ColumnFlags::BINARY));
    }

    #[test]
    fn test_wrong_trailer_marker() {
        let mut packet = column_packet("id", ColumnType::Long, ColumnFlags::empty());
        let marker = packet.len() - 13;
        packet[marker] = 0x0B;
        let err = decode_column(&packet, Capabilities::CLIENT, &mut Arena::default()).unwrap_err();
        assert!(err.is(ErrorCode::MalformedPacket));
        assert_eq!(err.message(), format!("Malformed packet (Offset {marker})"));
    }

    #[test]
    fn test_truncated_trailer_leaves_arena_untouched() {
        let packet = column_packet("id", ColumnType::Long, ColumnFlags::empty());
        let mut arena = Arena::default();
        let err = decode_column(&packet[..packet.len() - 3], Capabilities::CLIENT, &mut arena).unwrap_err();
        assert!(err.is(ErrorCode::MalformedPacket));
        assert_eq!(arena.used_bytes(), 0);
    }
}
