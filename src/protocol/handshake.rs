//! Connection phase: server greeting, client hello and credential digest.

use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::protocol::constants::{
    Capabilities, MARIADB_VERSION_PREFIX, NATIVE_PASSWORD_PLUGIN, SCRAMBLE_LEN, StatusFlags,
};
use crate::protocol::response::{self, ERR_HEADER, Response};
use crate::protocol::wire::{Reader, WireWrite, lenenc_len};

const PROTOCOL_VERSION: u8 = 10;

/// Fixed part following the version string: thread id, scramble head, filler, capabilities,
/// charset, status, capabilities, scramble length and reserved bytes.
const GREETING_FIXED_LEN: usize = 33;

/// Room kept free at the end of the hello buffer.
const HELLO_RESERVE: usize = 4;

/// Initial handshake packet sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerGreeting {
    pub protocol: u8,
    /// Version without the MariaDB replication prefix.
    pub version: String,
    pub is_mariadb: bool,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    /// Merged capabilities, including MariaDB extensions when the server announced them.
    pub capabilities: Capabilities,
    pub charset: u8,
    pub status: StatusFlags,
    pub scramble_len: u8,
    pub plugin: Option<String>,
}

/// Decodes the greeting. An error packet sent instead is returned as the server's error.
#[track_caller]
pub fn decode_greeting(packet: &[u8]) -> Result<ServerGreeting> {
    if packet.first() == Some(&ERR_HEADER) {
        return match response::decode_error(packet)? {
            Response::Error(err) => Err(err),
            _ => Err(Error::malformed(1)),
        };
    }

    let mut r = Reader::new(packet);
    let protocol = r.get_u8()?;
    if protocol != PROTOCOL_VERSION {
        return Err(Error::with_message(
            ErrorCode::UnsupportedServerVersion,
            format!("Unsupported protocol version {protocol}"),
        ));
    }

    let mut version = r.get_null_terminated()?;
    let is_mariadb = version.starts_with(MARIADB_VERSION_PREFIX);
    if is_mariadb {
        version = &version[MARIADB_VERSION_PREFIX.len()..];
    }
    let version = String::from_utf8_lossy(version).into_owned();

    r.ensure(GREETING_FIXED_LEN)?;
    let thread_id = r.get_u32()?;
    let mut scramble = r.get_bytes(8)?.to_vec();
    r.skip(1)?;
    let cap_low = r.get_u16()?;
    let charset = r.get_u8()?;
    let status = StatusFlags::from_bits_truncate(r.get_u16()?);
    let cap_high = r.get_u16()?;
    let scramble_len = r.get_u8()?;
    r.skip(6)?;
    let mariadb_caps = r.get_u32()?;

    let mut capabilities =
        Capabilities::from_halves(u32::from(cap_low) | (u32::from(cap_high) << 16), 0);
    if !capabilities.contains(Capabilities::MYSQL) {
        capabilities |= Capabilities::from_halves(0, mariadb_caps);
    }

    if capabilities.contains(Capabilities::SECURE_CONNECTION) {
        let tail = usize::from(scramble_len).saturating_sub(9).max(12);
        scramble.extend_from_slice(r.get_bytes(tail)?);
        r.skip(1)?;
    }

    let plugin = if capabilities.contains(Capabilities::PLUGIN_AUTH) {
        Some(String::from_utf8_lossy(r.get_null_terminated()?).into_owned())
    } else {
        None
    };

    debug!(
        version = %version,
        is_mariadb,
        thread_id,
        plugin = plugin.as_deref().unwrap_or("-"),
        "server greeting"
    );

    Ok(ServerGreeting {
        protocol,
        version,
        is_mariadb,
        thread_id,
        scramble,
        capabilities,
        charset,
        status,
        scramble_len,
        plugin,
    })
}

/// Client side inputs of the hello packet.
#[derive(Debug, Clone)]
pub struct HelloParams<'a> {
    pub user: &'a str,
    pub password: Option<&'a str>,
    pub database: Option<&'a str>,
    /// Plugin used when the server did not name one.
    pub default_plugin: &'a str,
    pub charset: u8,
    pub max_packet_size: u32,
    pub connect_attrs: &'a [(String, String)],
    /// Largest hello packet the client is willing to build.
    pub buffer_limit: usize,
}

/// Encodes the client hello into `out` and returns the negotiated capabilities.
#[track_caller]
pub fn encode_client_hello(
    greeting: &ServerGreeting,
    params: &HelloParams<'_>,
    out: &mut BytesMut,
) -> Result<Capabilities> {
    let mut flags = Capabilities::CLIENT;
    if params.database.is_some() {
        flags |= Capabilities::CONNECT_WITH_DB;
    }
    let server_is_mysql = greeting.capabilities.contains(Capabilities::MYSQL);
    if !server_is_mysql {
        flags.remove(Capabilities::MYSQL);
    }

    out.put_u32_le(flags.low());
    out.put_u32_le(params.max_packet_size);
    out.put_u8(params.charset);
    out.put_bytes(0, 19);
    out.put_u32_le(if server_is_mysql {
        0
    } else {
        Capabilities::MARIADB.high()
    });

    out.put_null_terminated(params.user.as_bytes());

    let plugin = greeting.plugin.as_deref().unwrap_or(params.default_plugin);
    match params.password.filter(|p| !p.is_empty()) {
        None => out.put_u8(0),
        Some(password) => {
            if !greeting
                .capabilities
                .contains(Capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA)
            {
                return Err(Error::with_message(
                    ErrorCode::UnsupportedServerVersion,
                    "Server does not support length-encoded authentication data",
                ));
            }
            let mut digest = [0u8; SCRAMBLE_LEN];
            let len = authenticate(plugin, password.as_bytes(), &greeting.scramble, &mut digest)?;
            out.put_lenenc_bytes(&digest[..len]);
        }
    }

    if let Some(db) = params.database {
        out.put_null_terminated(db.as_bytes());
    }
    out.put_null_terminated(plugin.as_bytes());

    let attrs_len: usize = params
        .connect_attrs
        .iter()
        .map(|(k, v)| {
            lenenc_len(k.len() as u64) + k.len() + lenenc_len(v.len() as u64) + v.len()
        })
        .sum();
    let needed = out.len() + lenenc_len(attrs_len as u64) + attrs_len;
    if needed > params.buffer_limit.saturating_sub(HELLO_RESERVE) {
        return Err(Error::out_of_memory(needed));
    }
    out.put_lenenc_int(attrs_len as u64);
    for (key, value) in params.connect_attrs {
        out.put_lenenc_bytes(key.as_bytes());
        out.put_lenenc_bytes(value.as_bytes());
    }

    let negotiated = (flags | Capabilities::MARIADB) & greeting.capabilities;
    debug!(capabilities = ?negotiated, plugin, "client hello encoded");
    Ok(negotiated)
}

/// Computes the auth response for `plugin` into `out` and returns its length.
#[track_caller]
pub fn authenticate(plugin: &str, password: &[u8], scramble: &[u8], out: &mut [u8]) -> Result<usize> {
    match plugin {
        NATIVE_PASSWORD_PLUGIN => native_password(password, scramble, out),
        other => Err(Error::unknown_auth_method(other)),
    }
}

fn sha1(parts: &[&[u8]]) -> [u8; SCRAMBLE_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))`
#[track_caller]
pub fn native_password(password: &[u8], scramble: &[u8], out: &mut [u8]) -> Result<usize> {
    if out.len() < SCRAMBLE_LEN {
        return Err(Error::with_message(
            ErrorCode::InvalidBufferSize,
            format!("Invalid buffer size {} (need {SCRAMBLE_LEN})", out.len()),
        ));
    }
    let scramble = &scramble[..scramble.len().min(SCRAMBLE_LEN)];

    let stage1 = sha1(&[password]);
    let stage2 = sha1(&[&stage1]);
    let salted = sha1(&[scramble, &stage2]);

    for (dst, (a, b)) in out.iter_mut().zip(stage1.iter().zip(salted.iter())) {
        *dst = a ^ b;
    }
    Ok(SCRAMBLE_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting_packet(version: &[u8], caps: Capabilities, plugin: Option<&str>) -> Vec<u8> {
        let mut p = BytesMut::new();
        p.put_u8(10);
        p.put_null_terminated(version);
        p.put_u32_le(42);
        p.put_slice(b"abcdefgh");
        p.put_u8(0);
        p.put_u16_le(caps.low() as u16);
        p.put_u8(45);
        p.put_u16_le(StatusFlags::AUTOCOMMIT.bits());
        p.put_u16_le((caps.low() >> 16) as u16);
        p.put_u8(21);
        p.put_bytes(0, 6);
        p.put_u32_le(caps.high());
        p.put_slice(b"ijklmnop1234");
        p.put_u8(0);
        if let Some(plugin) = plugin {
            p.put_null_terminated(plugin.as_bytes());
        }
        p.to_vec()
    }

    fn mariadb_caps() -> Capabilities {
        (Capabilities::CLIENT | Capabilities::MARIADB | Capabilities::CONNECT_WITH_DB)
            - Capabilities::MYSQL
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn params<'a>(attrs: &'a [(String, String)]) -> HelloParams<'a> {
        HelloParams {
            user: "root",
            password: Some("secret"),
            database: Some("test"),
            default_plugin: NATIVE_PASSWORD_PLUGIN,
            charset: 45,
            max_packet_size: 0x4000_0000,
            connect_attrs: attrs,
            buffer_limit: 0x2000,
        }
    }

    #[test]
    fn test_decode_mariadb_greeting() {
        let packet = greeting_packet(
            b"5.5.5-10.5.8-MariaDB",
            mariadb_caps(),
            Some("mysql_native_password"),
        );
        let greeting = decode_greeting(&packet).unwrap();
        assert!(greeting.is_mariadb);
        assert_eq!(greeting.version, "10.5.8-MariaDB");
        assert_eq!(greeting.thread_id, 42);
        assert_eq!(greeting.scramble.len(), 20);
        assert_eq!(greeting.scramble, b"abcdefghijklmnop1234");
        assert_eq!(greeting.plugin.as_deref(), Some("mysql_native_password"));
        assert!(greeting.capabilities.contains(Capabilities::PROGRESS));
    }

    #[test]
    fn test_decode_mysql_greeting_ignores_extension() {
        let packet = greeting_packet(
            b"8.0.36",
            Capabilities::CLIENT | Capabilities::PROGRESS,
            Some("mysql_native_password"),
        );
        let greeting = decode_greeting(&packet).unwrap();
        assert!(!greeting.is_mariadb);
        assert_eq!(greeting.version, "8.0.36");
        assert!(!greeting.capabilities.contains(Capabilities::PROGRESS));
    }

    #[test]
    fn test_greeting_plugin_without_terminator() {
        let mut packet = greeting_packet(b"10.6.0", mariadb_caps(), None);
        packet.extend_from_slice(b"mysql_native");
        let err = decode_greeting(&packet).unwrap_err();
        assert!(err.is(ErrorCode::MalformedPacket));
    }

    #[test]
    fn test_greeting_truncated_fixed_part() {
        let packet = greeting_packet(b"10.6.0", mariadb_caps(), None);
        let err = decode_greeting(&packet[..20]).unwrap_err();
        assert!(err.is(ErrorCode::MalformedPacket));
        assert_eq!(err.message(), "Malformed packet (Offset 8)");
    }

    #[test]
    fn test_greeting_wrong_protocol() {
        let mut packet = greeting_packet(b"10.6.0", mariadb_caps(), None);
        packet[0] = 9;
        let err = decode_greeting(&packet).unwrap_err();
        assert!(err.is(ErrorCode::UnsupportedServerVersion));
    }

    #[test]
    fn test_greeting_error_packet() {
        let mut packet = vec![0xFF, 0x13, 0x04, b'#'];
        packet.extend_from_slice(b"HY000Host blocked");
        let err = decode_greeting(&packet).unwrap_err();
        assert_eq!(err.number(), 1043);
        assert!(err.is_server_error());
    }

    #[test]
    fn test_native_password_digest() {
        let mut out = [0u8; 20];
        let len = native_password(b"secret", b"abcdefghijklmnop1234", &mut out).unwrap();
        assert_eq!(len, 20);
        assert_eq!(out.to_vec(), hex("d5a46779c2e245550e0294c597c2a265b2548c92"));
    }

    #[test]
    fn test_native_password_small_buffer() {
        let mut out = [0u8; 19];
        let err = native_password(b"secret", b"abcdefghijklmnop1234", &mut out).unwrap_err();
        assert!(err.is(ErrorCode::InvalidBufferSize));
    }

    #[test]
    fn test_unknown_plugin() {
        let mut out = [0u8; 20];
        let err = authenticate("caching_sha2_password", b"x", b"s", &mut out).unwrap_err();
        assert!(err.is(ErrorCode::UnknownAuthMethod));
        assert!(err.message().contains("caching_sha2_password"));
    }

    #[test]
    fn test_client_hello_layout() {
        let greeting = decode_greeting(&greeting_packet(
            b"5.5.5-10.5.8-MariaDB",
            mariadb_caps(),
            Some("mysql_native_password"),
        ))
        .unwrap();
        let attrs = vec![("_client_name".to_string(), "mariadb-wire".to_string())];
        let mut out = BytesMut::new();
        let negotiated = encode_client_hello(&greeting, &params(&attrs), &mut out).unwrap();

        let mut r = Reader::new(&out);
        let flags = Capabilities::from_halves(r.get_u32().unwrap(), 0);
        assert!(!flags.contains(Capabilities::MYSQL));
        assert!(flags.contains(Capabilities::CONNECT_WITH_DB));
        assert_eq!(r.get_u32().unwrap(), 0x4000_0000);
        assert_eq!(r.get_u8().unwrap(), 45);
        assert_eq!(r.get_bytes(19).unwrap(), &[0u8; 19]);
        assert_eq!(r.get_u32().unwrap(), Capabilities::MARIADB.high());
        assert_eq!(r.get_null_terminated().unwrap(), b"root");
        assert_eq!(
            r.get_lenenc_bytes().unwrap().to_vec(),
            hex("d5a46779c2e245550e0294c597c2a265b2548c92")
        );
        assert_eq!(r.get_null_terminated().unwrap(), b"test");
        assert_eq!(r.get_null_terminated().unwrap(), b"mysql_native_password");
        let mut block = {
            let len = r.get_lenenc_int().unwrap() as usize;
            r.sub_reader(len).unwrap()
        };
        assert_eq!(block.get_lenenc_bytes().unwrap(), b"_client_name");
        assert_eq!(block.get_lenenc_bytes().unwrap(), b"mariadb-wire");
        assert!(r.is_empty());

        assert!(negotiated.contains(Capabilities::SESSION_TRACKING));
        assert!(negotiated.contains(Capabilities::PROGRESS));
        assert!(!negotiated.contains(Capabilities::MYSQL));
    }

    #[test]
    fn test_client_hello_without_password() {
        let greeting = decode_greeting(&greeting_packet(b"8.0.36", Capabilities::CLIENT, None)).unwrap();
        let mut p = params(&[]);
        p.password = None;
        p.database = None;
        let mut out = BytesMut::new();
        let negotiated = encode_client_hello(&greeting, &p, &mut out).unwrap();
        // flags, max packet, charset, filler, extension, "root\0", empty auth
        assert_eq!(out[32 + 5], 0);
        assert_eq!(&out[28..32], &[0, 0, 0, 0]);
        assert!(negotiated.contains(Capabilities::MYSQL));
        assert!(!negotiated.contains(Capabilities::CONNECT_WITH_DB));
    }

    #[test]
    fn test_client_hello_requires_lenenc_auth() {
        let caps = mariadb_caps() - Capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA;
        let greeting = decode_greeting(&greeting_packet(b"10.1.0", caps, Some("mysql_native_password")))
            .unwrap();
        let err = encode_client_hello(&greeting, &params(&[]), &mut BytesMut::new()).unwrap_err();
        assert!(err.is(ErrorCode::UnsupportedServerVersion));
    }

    #[test]
    fn test_client_hello_attribute_overflow() {
        let greeting = decode_greeting(&greeting_packet(
            b"10.6.0",
            mariadb_caps(),
            Some("mysql_native_password"),
        ))
        .unwrap();
        let attrs = vec![("_big".to_string(), "x".repeat(300))];
        let mut p = params(&attrs);
        p.buffer_limit = 256;
        let err = encode_client_hello(&greeting, &p, &mut BytesMut::new()).unwrap_err();
        assert!(err.is(ErrorCode::OutOfMemory));
        assert!(err.message().starts_with("Failed to allocate memory ("));
    }
}
