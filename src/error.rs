//! Structured client and server errors.
//!
//! Client-side failures use numbers from 2000 upwards so they never collide with error numbers
//! a server reports through an error packet. Server errors keep the server's own number and
//! SQLSTATE verbatim.

use std::fmt;
use std::io;
use std::panic::Location;
use std::sync::Arc;
use thiserror::Error;

/// SQLSTATE used when neither the client nor the server supplies a more specific one.
pub const DEFAULT_SQLSTATE: &str = "HY000";

/// SQLSTATE attached to failed socket reads and writes.
pub const COMM_SQLSTATE: &str = "08001";

/// Client error numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 2000,
    InvalidPointer = 2001,
    InvalidHandle = 2002,
    InvalidSocketDescriptor = 2003,
    OutOfMemory = 2004,
    MalformedPacket = 2005,
    UnknownAuthMethod = 2006,
    InvalidHandleType = 2007,
    InvalidOption = 2008,
    CommRead = 2009,
    CommWrite = 2010,
    NullValueParameter = 2011,
    AlreadyInitialized = 2012,
    InvalidBufferSize = 2013,
    UnsupportedServerVersion = 2014,
    InvalidValue = 2015,
    UnknownFieldAttribute = 2016,
    NoResult = 2017,
    StmtWithoutParameters = 2018,
    StmtNotReady = 2019,
}

impl ErrorCode {
    const ALL: [ErrorCode; 20] = [
        ErrorCode::Unknown,
        ErrorCode::InvalidPointer,
        ErrorCode::InvalidHandle,
        ErrorCode::InvalidSocketDescriptor,
        ErrorCode::OutOfMemory,
        ErrorCode::MalformedPacket,
        ErrorCode::UnknownAuthMethod,
        ErrorCode::InvalidHandleType,
        ErrorCode::InvalidOption,
        ErrorCode::CommRead,
        ErrorCode::CommWrite,
        ErrorCode::NullValueParameter,
        ErrorCode::AlreadyInitialized,
        ErrorCode::InvalidBufferSize,
        ErrorCode::UnsupportedServerVersion,
        ErrorCode::InvalidValue,
        ErrorCode::UnknownFieldAttribute,
        ErrorCode::NoResult,
        ErrorCode::StmtWithoutParameters,
        ErrorCode::StmtNotReady,
    ];

    pub fn number(self) -> u16 {
        self as u16
    }

    pub fn from_number(number: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.number() == number)
    }

    /// Message used when the failing site has nothing more specific to say.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Unknown error",
            ErrorCode::InvalidPointer => "Invalid or missing argument",
            ErrorCode::InvalidHandle => "Invalid handle",
            ErrorCode::InvalidSocketDescriptor => "Invalid socket descriptor",
            ErrorCode::OutOfMemory => "Failed to allocate memory",
            ErrorCode::MalformedPacket => "Malformed packet",
            ErrorCode::UnknownAuthMethod => "Unknown or unsupported authentication method",
            ErrorCode::InvalidHandleType => "Invalid handle type",
            ErrorCode::InvalidOption => "Invalid or unknown option",
            ErrorCode::CommRead => "Error while reading from server",
            ErrorCode::CommWrite => "Error while writing to server",
            ErrorCode::NullValueParameter => "Parameter must not be empty",
            ErrorCode::AlreadyInitialized => "Handle is already initialized",
            ErrorCode::InvalidBufferSize => "Invalid buffer size",
            ErrorCode::UnsupportedServerVersion => "Unsupported server version",
            ErrorCode::InvalidValue => "Invalid value",
            ErrorCode::UnknownFieldAttribute => "Unknown field attribute",
            ErrorCode::NoResult => "No result set available",
            ErrorCode::StmtWithoutParameters => "Statement has no parameters",
            ErrorCode::StmtNotReady => "Statement is not ready for execution",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_message())
    }
}

/// Where an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Detected by this crate at the given source location.
    Client { file: &'static str, line: u32 },
    /// Reported by the server in an error packet.
    Server,
}

impl Origin {
    fn caller(location: &'static Location<'static>) -> Self {
        Origin::Client {
            file: location.file(),
            line: location.line(),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("[{number}] ({sqlstate}) {message}")]
pub struct Error {
    number: u16,
    sqlstate: String,
    message: String,
    origin: Origin,
    #[source]
    source: Option<Arc<io::Error>>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Client error with the code's default message.
    #[track_caller]
    pub fn new(code: ErrorCode) -> Self {
        Self::with_message(code, code.default_message())
    }

    #[track_caller]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            number: code.number(),
            sqlstate: DEFAULT_SQLSTATE.to_string(),
            message: message.into(),
            origin: Origin::caller(Location::caller()),
            source: None,
        }
    }

    /// Bounds check failure while decoding, `offset` is relative to the packet start.
    #[track_caller]
    pub fn malformed(offset: usize) -> Self {
        Self::with_message(
            ErrorCode::MalformedPacket,
            format!("Malformed packet (Offset {offset})"),
        )
    }

    #[track_caller]
    pub fn out_of_memory(bytes: usize) -> Self {
        Self::with_message(
            ErrorCode::OutOfMemory,
            format!("Failed to allocate memory ({bytes} Bytes)."),
        )
    }

    #[track_caller]
    pub fn unknown_auth_method(plugin: &str) -> Self {
        Self::with_message(
            ErrorCode::UnknownAuthMethod,
            format!("Unknown or unsupported authentication method: '{plugin}'"),
        )
    }

    /// Socket failure or timeout, `code` is either `CommRead` or `CommWrite`.
    #[track_caller]
    pub fn io(code: ErrorCode, err: io::Error) -> Self {
        let mut error = Self::with_message(code, format!("{}: {}", code.default_message(), err));
        error.sqlstate = COMM_SQLSTATE.to_string();
        error.source = Some(Arc::new(err));
        error
    }

    /// Error decoded from a server error packet.
    pub fn server(number: u16, sqlstate: &str, message: impl Into<String>) -> Self {
        let sqlstate = if sqlstate.is_empty() {
            DEFAULT_SQLSTATE
        } else {
            sqlstate
        };
        Self {
            number,
            sqlstate: sqlstate.to_string(),
            message: message.into(),
            origin: Origin::Server,
            source: None,
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    /// The client code, `None` for server errors.
    pub fn code(&self) -> Option<ErrorCode> {
        match self.origin {
            Origin::Server => None,
            Origin::Client { .. } => ErrorCode::from_number(self.number),
        }
    }

    pub fn sqlstate(&self) -> &str {
        &self.sqlstate
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_server_error(&self) -> bool {
        self.origin == Origin::Server
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }
}

impl From<io::Error> for Error {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Error::io(ErrorCode::CommRead, err)
    }
}
