//! Protocol counters recorded through the `metrics` facade.
//!
//! Nothing is exported by the crate itself; an application that installs a recorder gets:
//! - frames and bytes moved in each direction
//! - read/write timeouts
//! - malformed packets and server error packets
//! - rows fetched from result sets

use metrics::counter;

/// Record a logical packet written to the server
pub fn record_packet_written(bytes: usize) {
    counter!("mariadb_wire_packets_written_total").increment(1);
    counter!("mariadb_wire_bytes_written_total").increment(bytes as u64);
}

/// Record a logical packet read from the server
pub fn record_packet_read(bytes: usize) {
    counter!("mariadb_wire_packets_read_total").increment(1);
    counter!("mariadb_wire_bytes_read_total").increment(bytes as u64);
}

/// Record a socket timeout, `direction` is "read" or "write"
pub fn record_io_timeout(direction: &'static str) {
    counter!("mariadb_wire_io_timeouts_total", "direction" => direction).increment(1);
}

/// Record a packet rejected by a bounds check
pub fn record_malformed_packet() {
    counter!("mariadb_wire_malformed_packets_total").increment(1);
}

/// Record an error packet sent by the server
pub fn record_server_error(number: u16) {
    counter!("mariadb_wire_server_errors_total", "number" => number.to_string()).increment(1);
}

/// Record rows delivered by a result set
pub fn record_rows_fetched(count: u64) {
    counter!("mariadb_wire_rows_fetched_total").increment(count);
}
