use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::arena::DEFAULT_PREALLOC;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::constants::{NATIVE_PASSWORD_PLUGIN, UTF8MB4};

/// Connection settings. Every field has a default so a partial YAML file is enough.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    /// Plugin used when the server does not name one in its greeting.
    #[serde(default = "default_auth_plugin")]
    pub auth_plugin: String,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Initial size of the read and write buffers.
    #[serde(default = "default_buffer_length")]
    pub buffer_length: usize,
    /// Milliseconds, 0 waits forever.
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u32,
    /// Milliseconds, 0 waits forever.
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u32,
    #[serde(default = "default_arena_prealloc")]
    pub arena_prealloc: usize,
    #[serde(default = "default_charset")]
    pub charset: u8,
    /// Sent in the client hello as `[key, value]` pairs, in order.
    #[serde(default = "default_connect_attrs")]
    pub connect_attrs: Vec<(String, String)>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub tls_ca: Option<String>,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
}

fn default_auth_plugin() -> String {
    NATIVE_PASSWORD_PLUGIN.to_string()
}

fn default_max_packet_size() -> u32 {
    0x4000_0000
}

fn default_buffer_length() -> usize {
    0x2000
}

fn default_timeout_ms() -> u32 {
    1000
}

fn default_arena_prealloc() -> usize {
    DEFAULT_PREALLOC
}

fn default_charset() -> u8 {
    UTF8MB4
}

fn default_connect_attrs() -> Vec<(String, String)> {
    vec![
        ("_client_name".to_string(), env!("CARGO_PKG_NAME").to_string()),
        ("_client_version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ("_os".to_string(), std::env::consts::OS.to_string()),
        ("_platform".to_string(), std::env::consts::ARCH.to_string()),
    ]
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: None,
            database: None,
            auth_plugin: default_auth_plugin(),
            max_packet_size: default_max_packet_size(),
            buffer_length: default_buffer_length(),
            read_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            arena_prealloc: default_arena_prealloc(),
            charset: default_charset(),
            connect_attrs: default_connect_attrs(),
            tls: false,
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ClientConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

/// Value kinds of the option store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Str,
    Int8,
    Int32,
    Int64,
    Flag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// `None` clears an optional string.
    Str(Option<String>),
    Int8(u8),
    Int32(u32),
    Int64(u64),
    Flag(bool),
}

impl OptionValue {
    pub fn option_type(&self) -> OptionType {
        match self {
            OptionValue::Str(_) => OptionType::Str,
            OptionValue::Int8(_) => OptionType::Int8,
            OptionValue::Int32(_) => OptionType::Int32,
            OptionValue::Int64(_) => OptionType::Int64,
            OptionValue::Flag(_) => OptionType::Flag,
        }
    }
}

/// Symbolic keys of [`ClientConfig`] fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnOption {
    User,
    Password,
    Database,
    AuthPlugin,
    MaxPacketSize,
    BufferLength,
    ReadTimeout,
    WriteTimeout,
    ArenaPrealloc,
    Charset,
    Tls,
    TlsCa,
    TlsCert,
    TlsKey,
}

impl ConnOption {
    pub const ALL: [ConnOption; 14] = [
        ConnOption::User,
        ConnOption::Password,
        ConnOption::Database,
        ConnOption::AuthPlugin,
        ConnOption::MaxPacketSize,
        ConnOption::BufferLength,
        ConnOption::ReadTimeout,
        ConnOption::WriteTimeout,
        ConnOption::ArenaPrealloc,
        ConnOption::Charset,
        ConnOption::Tls,
        ConnOption::TlsCa,
        ConnOption::TlsCert,
        ConnOption::TlsKey,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConnOption::User => "user",
            ConnOption::Password => "password",
            ConnOption::Database => "database",
            ConnOption::AuthPlugin => "auth_plugin",
            ConnOption::MaxPacketSize => "max_packet_size",
            ConnOption::BufferLength => "buffer_length",
            ConnOption::ReadTimeout => "read_timeout",
            ConnOption::WriteTimeout => "write_timeout",
            ConnOption::ArenaPrealloc => "arena_prealloc",
            ConnOption::Charset => "charset",
            ConnOption::Tls => "tls",
            ConnOption::TlsCa => "tls_ca",
            ConnOption::TlsCert => "tls_cert",
            ConnOption::TlsKey => "tls_key",
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            ConnOption::Password => &["passwd"],
            ConnOption::Database => &["db", "schema"],
            ConnOption::AuthPlugin => &["default_auth"],
            ConnOption::ReadTimeout => &["read_timeout_ms"],
            ConnOption::WriteTimeout => &["write_timeout_ms"],
            ConnOption::Charset => &["character_set"],
            ConnOption::Tls => &["ssl"],
            ConnOption::TlsCa => &["ssl_ca"],
            ConnOption::TlsCert => &["ssl_cert"],
            ConnOption::TlsKey => &["ssl_key"],
            _ => &[],
        }
    }

    /// Looks an option up by name or alias, ignoring case.
    #[track_caller]
    pub fn from_name(key: &str) -> Result<Self> {
        let key = key.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|option| option.name() == key || option.aliases().contains(&key.as_str()))
            .ok_or_else(|| {
                Error::with_message(ErrorCode::InvalidOption, format!("Unknown option '{key}'"))
            })
    }

    pub fn option_type(self) -> OptionType {
        match self {
            ConnOption::User
            | ConnOption::Password
            | ConnOption::Database
            | ConnOption::AuthPlugin
            | ConnOption::TlsCa
            | ConnOption::TlsCert
            | ConnOption::TlsKey => OptionType::Str,
            ConnOption::Charset => OptionType::Int8,
            ConnOption::MaxPacketSize | ConnOption::ReadTimeout | ConnOption::WriteTimeout => {
                OptionType::Int32
            }
            ConnOption::BufferLength | ConnOption::ArenaPrealloc => OptionType::Int64,
            ConnOption::Tls => OptionType::Flag,
        }
    }
}

impl fmt::Display for ConnOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[track_caller]
fn invalid_value(option: ConnOption, detail: impl fmt::Display) -> Error {
    Error::with_message(
        ErrorCode::InvalidValue,
        format!("Invalid value for option '{option}': {detail}"),
    )
}

#[track_caller]
fn to_usize(option: ConnOption, value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| invalid_value(option, value))
}

impl ClientConfig {
    /// Sets one option. The value's type must match [`ConnOption::option_type`].
    #[track_caller]
    pub fn set(&mut self, option: ConnOption, value: OptionValue) -> Result<()> {
        if value.option_type() != option.option_type() {
            return Err(invalid_value(
                option,
                format!("expected {:?}, got {:?}", option.option_type(), value.option_type()),
            ));
        }
        match (option, value) {
            (ConnOption::User, OptionValue::Str(v)) => self.user = v.unwrap_or_default(),
            (ConnOption::Password, OptionValue::Str(v)) => self.password = v,
            (ConnOption::Database, OptionValue::Str(v)) => self.database = v,
            (ConnOption::AuthPlugin, OptionValue::Str(v)) => {
                self.auth_plugin = v.unwrap_or_else(default_auth_plugin)
            }
            (ConnOption::TlsCa, OptionValue::Str(v)) => self.tls_ca = v,
            (ConnOption::TlsCert, OptionValue::Str(v)) => self.tls_cert = v,
            (ConnOption::TlsKey, OptionValue::Str(v)) => self.tls_key = v,
            (ConnOption::Charset, OptionValue::Int8(v)) => self.charset = v,
            (ConnOption::MaxPacketSize, OptionValue::Int32(v)) => self.max_packet_size = v,
            (ConnOption::ReadTimeout, OptionValue::Int32(v)) => self.read_timeout_ms = v,
            (ConnOption::WriteTimeout, OptionValue::Int32(v)) => self.write_timeout_ms = v,
            (ConnOption::BufferLength, OptionValue::Int64(v)) => {
                if v == 0 {
                    return Err(invalid_value(option, "must not be 0"));
                }
                self.buffer_length = to_usize(option, v)?
            }
            (ConnOption::ArenaPrealloc, OptionValue::Int64(v)) => {
                self.arena_prealloc = to_usize(option, v)?
            }
            (ConnOption::Tls, OptionValue::Flag(v)) => self.tls = v,
            (option, value) => return Err(invalid_value(option, format!("{value:?}"))),
        }
        Ok(())
    }

    /// Parses `value` according to the option's type and sets it.
    #[track_caller]
    pub fn set_by_name(&mut self, key: &str, value: &str) -> Result<()> {
        let option = ConnOption::from_name(key)?;
        let parsed = match option.option_type() {
            OptionType::Str => OptionValue::Str((!value.is_empty()).then(|| value.to_string())),
            OptionType::Int8 => OptionValue::Int8(value.parse().map_err(|e| invalid_value(option, e))?),
            OptionType::Int32 => {
                OptionValue::Int32(value.parse().map_err(|e| invalid_value(option, e))?)
            }
            OptionType::Int64 => {
                OptionValue::Int64(value.parse().map_err(|e| invalid_value(option, e))?)
            }
            OptionType::Flag => OptionValue::Flag(parse_flag(value).ok_or_else(|| {
                invalid_value(option, format!("'{value}' is not a boolean"))
            })?),
        };
        self.set(option, parsed)
    }

    pub fn get(&self, option: ConnOption) -> OptionValue {
        match option {
            ConnOption::User => OptionValue::Str(Some(self.user.clone())),
            ConnOption::Password => OptionValue::Str(self.password.clone()),
            ConnOption::Database => OptionValue::Str(self.database.clone()),
            ConnOption::AuthPlugin => OptionValue::Str(Some(self.auth_plugin.clone())),
            ConnOption::TlsCa => OptionValue::Str(self.tls_ca.clone()),
            ConnOption::TlsCert => OptionValue::Str(self.tls_cert.clone()),
            ConnOption::TlsKey => OptionValue::Str(self.tls_key.clone()),
            ConnOption::Charset => OptionValue::Int8(self.charset),
            ConnOption::MaxPacketSize => OptionValue::Int32(self.max_packet_size),
            ConnOption::ReadTimeout => OptionValue::Int32(self.read_timeout_ms),
            ConnOption::WriteTimeout => OptionValue::Int32(self.write_timeout_ms),
            ConnOption::BufferLength => OptionValue::Int64(self.buffer_length as u64),
            ConnOption::ArenaPrealloc => OptionValue::Int64(self.arena_prealloc as u64),
            ConnOption::Tls => OptionValue::Flag(self.tls),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
