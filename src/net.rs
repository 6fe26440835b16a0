//! Framed messages over plain TCP.
//!
//! The envelope's `len` field makes messages self-delimiting on a byte
//! stream, so "framing" is just a header write followed by the body. The
//! agent side talks through a [`Flow`]: a lazily-connected, self-healing
//! handle where a failed send costs the current batch and nothing else.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, warn};

use tally_protocol::wire::{MsgHeader, HEADER_LEN};

/// Upper bound accepted for one message, matching the storage side's input
/// cap.
pub const MESSAGE_MAX: usize = 10 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Write one framed message: header (with `len` filled in) then body.
pub fn write_message(
    stream: &mut TcpStream,
    mut header: MsgHeader,
    body: &[u8],
) -> io::Result<()> {
    header.len = (HEADER_LEN + body.len()) as u32;

    let mut head = [0u8; HEADER_LEN];
    header.write_into(&mut head);
    stream.write_all(&head)?;
    stream.write_all(body)?;
    stream.flush()
}

/// Read one framed message. Errors with `UnexpectedEof` on a cleanly
/// closed peer and `InvalidData` on a nonsensical length field.
pub fn read_message(stream: &mut TcpStream) -> io::Result<(MsgHeader, BytesMut)> {
    let mut head = [0u8; HEADER_LEN];
    stream.read_exact(&mut head)?;
    let header = MsgHeader::read_from(&head)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short header"))?;

    let total = header.len as usize;
    if total < HEADER_LEN || total > MESSAGE_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message length {total} out of range"),
        ));
    }

    let mut body = BytesMut::zeroed(total - HEADER_LEN);
    stream.read_exact(&mut body)?;
    Ok((header, body))
}

/// One outbound peer connection with a monotonically increasing `syn`.
///
/// Connection state is an implementation detail: `send` connects on
/// demand and tears the socket down on any error so the next call starts
/// fresh. Callers treat errors as "this batch is lost", which is the
/// pipeline's delivery contract.
pub struct Flow {
    name: &'static str,
    addr: String,
    stream: Option<TcpStream>,
    next_syn: u32,
}

impl Flow {
    pub fn new(name: &'static str, addr: String) -> Flow {
        Flow {
            name,
            addr,
            stream: None,
            next_syn: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn connect(&mut self) -> io::Result<&mut TcpStream> {
        if self.stream.is_none() {
            let mut last_err = None;
            for addr in std::net::ToSocketAddrs::to_socket_addrs(self.addr.as_str())? {
                match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                    Ok(stream) => {
                        debug!(message = "flow connected", flow = self.name, peer = %addr);
                        self.stream = Some(stream);
                        last_err = None;
                        break;
                    }
                    Err(err) => last_err = Some(err),
                }
            }
            if let Some(err) = last_err {
                return Err(err);
            }
            if self.stream.is_none() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} resolved to no addresses", self.addr),
                ));
            }
        }
        Ok(self.stream.as_mut().expect("just connected"))
    }

    /// Send one message, returning the `syn` it carried.
    pub fn send(&mut self, cmd: u16, body: &[u8]) -> io::Result<u32> {
        let syn = self.next_syn;
        let header = MsgHeader::request(cmd, syn);

        let result = self
            .connect()
            .and_then(|stream| write_message(stream, header, body));

        match result {
            Ok(()) => {
                self.next_syn = self.next_syn.wrapping_add(1);
                Ok(syn)
            }
            Err(err) => {
                warn!(
                    message = "flow send failed, dropping connection",
                    flow = self.name,
                    error = %err,
                );
                self.stream = None;
                Err(err)
            }
        }
    }

    /// Send one message and wait up to `timeout` for the peer's next
    /// message back.
    pub fn request(
        &mut self,
        cmd: u16,
        body: &[u8],
        timeout: Duration,
    ) -> io::Result<(MsgHeader, BytesMut)> {
        self.send(cmd, body)?;

        let stream = self.stream.as_mut().expect("sent on a live stream");
        stream.set_read_timeout(Some(timeout))?;
        let result = read_message(stream);
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.set_read_timeout(None);
        }

        if result.is_err() {
            self.stream = None;
        }
        result
    }
}
