//! Protocol constants: capability and status flag sets, command bytes and type codes.

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};

/// Largest payload a single physical frame can carry.
pub const MAX_FRAME_LEN: usize = 0xFF_FFFF;

/// Frame header: 3 byte length followed by a sequence number.
pub const FRAME_HEADER_LEN: usize = 4;

/// Length of the `mysql_native_password` digest and of the server scramble.
pub const SCRAMBLE_LEN: usize = 20;

/// Version prefix MariaDB servers send for replication compatibility.
pub const MARIADB_VERSION_PREFIX: &[u8] = b"5.5.5-";

/// utf8mb4_general_ci
pub const UTF8MB4: u8 = 45;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

bitflags! {
    /// Client/server capabilities. The low 32 bits are shared with MySQL, the high 32 bits are
    /// MariaDB extensions exchanged separately in the greeting and the client hello.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u64 {
        /// Set by MySQL servers; MariaDB clears it to announce extended capabilities.
        const MYSQL = 1;
        const FOUND_ROWS = 1 << 1;
        const LONG_FLAG = 1 << 2;
        const CONNECT_WITH_DB = 1 << 3;
        const NO_SCHEMA = 1 << 4;
        const COMPRESS = 1 << 5;
        const ODBC = 1 << 6;
        const LOCAL_FILES = 1 << 7;
        const IGNORE_SPACE = 1 << 8;
        const PROTOCOL_41 = 1 << 9;
        const INTERACTIVE = 1 << 10;
        const TLS = 1 << 11;
        const IGNORE_SIGPIPE = 1 << 12;
        const TRANSACTIONS = 1 << 13;
        const RESERVED = 1 << 14;
        const SECURE_CONNECTION = 1 << 15;
        const MULTI_STATEMENTS = 1 << 16;
        const MULTI_RESULTS = 1 << 17;
        const PS_MULTI_RESULTS = 1 << 18;
        const PLUGIN_AUTH = 1 << 19;
        const CONNECT_ATTRS = 1 << 20;
        const PLUGIN_AUTH_LENENC_CLIENT_DATA = 1 << 21;
        const CAN_HANDLE_EXPIRED_PASSWORDS = 1 << 22;
        const SESSION_TRACKING = 1 << 23;
        const TLS_VERIFY_SERVER_CERT = 1 << 30;
        const REMEMBER_OPTIONS = 1 << 31;

        const PROGRESS = 1 << 32;
        const COM_MULTI = 1 << 33;
        const STMT_BULK_OPERATIONS = 1 << 34;
        const EXTENDED_METADATA = 1 << 35;
        const CACHE_METADATA = 1 << 36;
    }
}

impl Capabilities {
    /// Capabilities this client always requests.
    pub const CLIENT: Capabilities = Capabilities::MYSQL
        .union(Capabilities::LONG_FLAG)
        .union(Capabilities::TRANSACTIONS)
        .union(Capabilities::SECURE_CONNECTION)
        .union(Capabilities::MULTI_RESULTS)
        .union(Capabilities::PS_MULTI_RESULTS)
        .union(Capabilities::PROTOCOL_41)
        .union(Capabilities::PLUGIN_AUTH)
        .union(Capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA)
        .union(Capabilities::SESSION_TRACKING)
        .union(Capabilities::CONNECT_ATTRS);

    /// MariaDB extensions announced when the server is not plain MySQL.
    pub const MARIADB: Capabilities = Capabilities::PROGRESS
        .union(Capabilities::STMT_BULK_OPERATIONS)
        .union(Capabilities::EXTENDED_METADATA);

    pub fn from_halves(low: u32, high: u32) -> Self {
        Capabilities::from_bits_truncate(u64::from(low) | (u64::from(high) << 32))
    }

    pub fn low(self) -> u32 {
        (self.bits() & 0xFFFF_FFFF) as u32
    }

    pub fn high(self) -> u32 {
        (self.bits() >> 32) as u32
    }
}

bitflags! {
    /// Server status flags carried by OK and EOF packets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u16 {
        const IN_TRANS = 1;
        const AUTOCOMMIT = 1 << 1;
        const MORE_RESULTS_EXIST = 1 << 3;
        const NO_GOOD_INDEX_USED = 1 << 4;
        const NO_INDEX_USED = 1 << 5;
        const CURSOR_EXISTS = 1 << 6;
        const LAST_ROW_SENT = 1 << 7;
        const DB_DROPPED = 1 << 8;
        const NO_BACKSLASH_ESCAPES = 1 << 9;
        const METADATA_CHANGED = 1 << 10;
        const QUERY_WAS_SLOW = 1 << 11;
        const PS_OUT_PARAMS = 1 << 12;
        const IN_TRANS_READONLY = 1 << 13;
        const SESSION_STATE_CHANGED = 1 << 14;
    }
}

/// Command bytes. `None` on the write path means "no command byte" (handshake replies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Ping = 0x0E,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtClose = 0x19,
    StmtReset = 0x1A,
}

/// Column and parameter type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl ColumnType {
    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            ColumnType::Date
                | ColumnType::NewDate
                | ColumnType::DateTime
                | ColumnType::Timestamp
                | ColumnType::Time
        )
    }
}

impl TryFrom<u8> for ColumnType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        let ty = match code {
            0x00 => ColumnType::Decimal,
            0x01 => ColumnType::Tiny,
            0x02 => ColumnType::Short,
            0x03 => ColumnType::Long,
            0x04 => ColumnType::Float,
            0x05 => ColumnType::Double,
            0x06 => ColumnType::Null,
            0x07 => ColumnType::Timestamp,
            0x08 => ColumnType::LongLong,
            0x09 => ColumnType::Int24,
            0x0A => ColumnType::Date,
            0x0B => ColumnType::Time,
            0x0C => ColumnType::DateTime,
            0x0D => ColumnType::Year,
            0x0E => ColumnType::NewDate,
            0x0F => ColumnType::VarChar,
            0x10 => ColumnType::Bit,
            0xF5 => ColumnType::Json,
            0xF6 => ColumnType::NewDecimal,
            0xF7 => ColumnType::Enum,
            0xF8 => ColumnType::Set,
            0xF9 => ColumnType::TinyBlob,
            0xFA => ColumnType::MediumBlob,
            0xFB => ColumnType::LongBlob,
            0xFC => ColumnType::Blob,
            0xFD => ColumnType::VarString,
            0xFE => ColumnType::String,
            0xFF => ColumnType::Geometry,
            other => {
                return Err(Error::with_message(
                    ErrorCode::InvalidValue,
                    format!("Unknown column type {other:#04x}"),
                ));
            }
        };
        Ok(ty)
    }
}

/// Kind of a session state change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStateType {
    SystemVariables,
    Schema,
    StateChange,
    Gtid,
    TransactionCharacteristics,
    TransactionState,
    Other(u8),
}

impl From<u8> for SessionStateType {
    fn from(code: u8) -> Self {
        match code {
            0 => SessionStateType::SystemVariables,
            1 => SessionStateType::Schema,
            2 => SessionStateType::StateChange,
            3 => SessionStateType::Gtid,
            4 => SessionStateType::TransactionCharacteristics,
            5 => SessionStateType::TransactionState,
            other => SessionStateType::Other(other),
        }
    }
}

/// Extended column metadata tags (MariaDB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldAttr {
    DataTypeName = 0,
    Format = 1,
}

impl FieldAttr {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for FieldAttr {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(FieldAttr::DataTypeName),
            1 => Ok(FieldAttr::Format),
            other => Err(Error::with_message(
                ErrorCode::UnknownFieldAttribute,
                format!("Unknown field attribute {other}"),
            )),
        }
    }
}
