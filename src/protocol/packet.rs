//! Packet framing over an async byte stream.
//!
//! A logical packet is one or more frames of at most [`MAX_FRAME_LEN`] bytes, each preceded by a
//! 3 byte length and a sequence number. A frame shorter than the limit ends the packet, so a
//! payload that is an exact multiple of the limit is followed by an empty frame.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::metrics;
use crate::protocol::buffer::PacketBuffer;
use crate::protocol::constants::{Command, FRAME_HEADER_LEN, MAX_FRAME_LEN};

/// Converts a millisecond setting into a timeout, 0 meaning "wait forever".
pub fn timeout_from_millis(ms: u32) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(u64::from(ms)))
}

fn frame_len(header: &[u8]) -> usize {
    usize::from(header[0]) | (usize::from(header[1]) << 8) | (usize::from(header[2]) << 16)
}

fn frame_header(len: usize, sequence: u8) -> [u8; FRAME_HEADER_LEN] {
    let len = len as u32;
    [len as u8, (len >> 8) as u8, (len >> 16) as u8, sequence]
}

/// Owns the stream and the read/write buffers of one connection.
#[derive(Debug)]
pub struct PacketIo<S> {
    stream: S,
    read_buf: PacketBuffer,
    write_buf: PacketBuffer,
    /// Length of the logical packet at the start of the read window.
    packet_len: usize,
    sequence: u8,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl<S> PacketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, buffer_length: usize) -> Self {
        Self {
            stream,
            read_buf: PacketBuffer::with_capacity(buffer_length),
            write_buf: PacketBuffer::with_capacity(buffer_length),
            packet_len: 0,
            sequence: 0,
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// Sets both timeouts in milliseconds; 0 waits indefinitely.
    pub fn set_timeouts(&mut self, read_ms: u32, write_ms: u32) {
        self.read_timeout = timeout_from_millis(read_ms);
        self.write_timeout = timeout_from_millis(write_ms);
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Sequence number expected on the next frame read.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn read_capacity(&self) -> usize {
        self.read_buf.capacity()
    }

    pub fn write_capacity(&self) -> usize {
        self.write_buf.capacity()
    }

    /// Writes one logical packet. The command byte, if any, is sent as the first payload byte
    /// and the sequence restarts at 0; replies without a command continue at 1.
    pub async fn write(&mut self, command: Option<Command>, payload: &[u8]) -> Result<()> {
        let command = command.map(|c| c as u8);
        let prefix: &[u8] = match &command {
            Some(byte) => std::slice::from_ref(byte),
            None => &[],
        };
        let total = prefix.len() + payload.len();
        let mut sequence: u8 = if command.is_some() { 0 } else { 1 };

        self.write_buf.clear();
        let mut offset = 0;
        loop {
            let len = (total - offset).min(MAX_FRAME_LEN);
            self.write_bytes(&frame_header(len, sequence)).await?;
            sequence = sequence.wrapping_add(1);

            let (from, to) = (offset, offset + len);
            if from < prefix.len() {
                self.write_bytes(&prefix[from..to.min(prefix.len())]).await?;
            }
            if to > prefix.len() {
                let start = from.max(prefix.len()) - prefix.len();
                let stop = to - prefix.len();
                self.write_bytes(&payload[start..stop]).await?;
            }
            offset = to;

            if len < MAX_FRAME_LEN {
                break;
            }
        }
        self.flush().await?;

        self.sequence = sequence;
        metrics::record_packet_written(total);
        trace!(len = total, command = ?command, "packet written");
        Ok(())
    }

    /// Copies into the write buffer, sending it whenever it fills up.
    async fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            if self.write_buf.free() == 0 {
                self.flush().await?;
            }
            let n = self.write_buf.fill_from(bytes);
            bytes = &bytes[n..];
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let stream = &mut self.stream;
        let data = self.write_buf.pending();
        let send = async move {
            stream.write_all(data).await?;
            stream.flush().await
        };
        let result = match self.write_timeout {
            Some(limit) => match timeout(limit, send).await {
                Ok(result) => result,
                Err(_) => {
                    metrics::record_io_timeout("write");
                    Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))
                }
            },
            None => send.await,
        };
        self.write_buf.clear();
        result.map_err(|err| Error::io(ErrorCode::CommWrite, err))
    }

    /// Reads the next logical packet and returns its length; the payload is available through
    /// [`PacketIo::packet`] until the next call. Bytes already buffered past the packet are
    /// kept for the following read.
    pub async fn read(&mut self) -> Result<usize> {
        self.read_buf.consume(self.packet_len)?;
        self.packet_len = 0;

        let mut total = 0;
        loop {
            self.fill(total + FRAME_HEADER_LEN).await?;
            let header = self.read_buf.window(total, FRAME_HEADER_LEN);
            let len = frame_len(header);
            let sequence = header[3];
            if sequence != self.sequence {
                warn!(expected = self.sequence, received = sequence, "packet sequence mismatch");
            }
            self.sequence = sequence.wrapping_add(1);

            if total == 0 {
                self.read_buf.consume(FRAME_HEADER_LEN)?;
            } else {
                self.read_buf.remove(total, FRAME_HEADER_LEN)?;
            }

            self.fill(total + len).await?;
            total += len;
            if len < MAX_FRAME_LEN {
                break;
            }
        }

        self.packet_len = total;
        metrics::record_packet_read(total);
        trace!(len = total, "packet read");
        Ok(total)
    }

    /// Payload of the packet returned by the last [`PacketIo::read`].
    pub fn packet(&self) -> &[u8] {
        self.read_buf.window(0, self.packet_len)
    }

    /// Makes sure at least `needed` bytes are pending in the read buffer.
    async fn fill(&mut self, needed: usize) -> Result<()> {
        while self.read_buf.len() < needed {
            if self.read_buf.pos() + needed > self.read_buf.capacity() {
                self.read_buf.compact();
                self.read_buf.ensure_capacity(needed);
            }

            let read_timeout = self.read_timeout;
            let recv = self.stream.read(self.read_buf.unfilled_mut());
            let result = match read_timeout {
                Some(limit) => match timeout(limit, recv).await {
                    Ok(result) => result,
                    Err(_) => {
                        metrics::record_io_timeout("read");
                        Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                    }
                },
                None => recv.await,
            };
            let n = result.map_err(|err| Error::io(ErrorCode::CommRead, err))?;
            if n == 0 {
                return Err(Error::io(
                    ErrorCode::CommRead,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server"),
                ));
            }
            self.read_buf.advance_end(n)?;
        }
        Ok(())
    }

    /// Complete frames buffered after the current packet.
    pub fn buffered_packets(&self) -> u32 {
        self.buffered_frames().count() as u32
    }

    /// 1-based index of the first buffered error frame that is not a progress report, or 0.
    pub fn buffered_error_packet(&self) -> u32 {
        self.buffered_frames()
            .position(|frame| {
                frame.len() > 2 && frame[0] == 0xFF && (frame[1], frame[2]) != (0xFF, 0xFF)
            })
            .map_or(0, |index| index as u32 + 1)
    }

    fn buffered_frames(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut rest = &self.read_buf.pending()[self.packet_len..];
        std::iter::from_fn(move || {
            if rest.len() < FRAME_HEADER_LEN {
                return None;
            }
            let len = frame_len(rest);
            if rest.len() < FRAME_HEADER_LEN + len {
                return None;
            }
            let frame = &rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
            rest = &rest[FRAME_HEADER_LEN + len..];
            Some(frame)
        })
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|err| Error::io(ErrorCode::CommWrite, err))
    }
}
