//! Client side of the MySQL/MariaDB wire protocol.
//!
//! The crate speaks the protocol over any tokio `AsyncRead + AsyncWrite` stream: handshake and
//! native password authentication, text queries, prepared statements with binary parameters and
//! rows, and the status/progress notifications MariaDB servers push.

pub mod arena;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod result;
pub mod statement;
pub mod telemetry;

pub use config::{ClientConfig, ConnOption, OptionType, OptionValue};
pub use connection::{ConnState, Connection, ProgressListener, ServerInfo, StatusListener};
pub use error::{Error, ErrorCode, Origin, Result};
pub use protocol::constants::{Capabilities, ColumnType, FieldAttr, StatusFlags};
pub use protocol::response::{ProgressReport, SessionStateRecord};
pub use protocol::stmt::{Bind, BindValue};
pub use protocol::temporal::Temporal;
pub use result::{ResultSet, RowFormat};
pub use statement::{ParamSource, Statement};
