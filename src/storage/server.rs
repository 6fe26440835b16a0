//! The storage service: accepts agent connections, persists shipped
//! buckets, and answers queries.
//!
//! One thread per connection; handlers share nothing mutable: the store
//! writer holds only its base directory and appends go to files keyed by
//! identity, so concurrent saves never interleave within a frame.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use snafu::{ResultExt, Snafu};
use tracing::{debug, error, info, warn};

use tally_protocol::wire::{cmd, status, MsgHeader, SystemStatsRequest};
use tally_protocol::{drain_frames, Frequency, HostAddr, Reader, Record, Writer};

use crate::config::{ConfigError, StorageConfig};
use crate::net::{read_message, write_message, MESSAGE_MAX};

use super::query;
use super::writer::StoreWriter;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(display("storage configuration: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("failed to bind {addr}: {source}"))]
    Bind { addr: String, source: io::Error },

    #[snafu(display("failed to prepare listener: {source}"))]
    Listener { source: io::Error },
}

struct Shared {
    writer: StoreWriter,
    stored_freq: Frequency,
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    pub fn bind(config: StorageConfig) -> Result<Server, ServerError> {
        let stored_freq = config.stored_freq().context(ConfigSnafu)?;
        let listener = TcpListener::bind(&config.listen_addr).context(BindSnafu {
            addr: config.listen_addr.clone(),
        })?;
        // accept is polled so the shutdown channel gets a look-in
        listener.set_nonblocking(true).context(ListenerSnafu)?;

        info!(
            message = "storage listening",
            addr = %config.listen_addr,
            stats_dir = %config.stats_dir.display(),
            stored_frequency = %stored_freq,
        );

        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                writer: StoreWriter::new(config.stats_dir),
                stored_freq,
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` fires or closes. Connection threads finish
    /// their in-flight request and exit when their peer hangs up.
    pub fn run(self, shutdown: Receiver<()>) {
        loop {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(message = "connection accepted", peer = %peer);
                    // the listener is non-blocking; the stream must not be
                    let _ = stream.set_nonblocking(false);

                    let shared = Arc::clone(&self.shared);
                    let spawned = thread::Builder::new()
                        .name("stat-conn".into())
                        .spawn(move || serve_connection(stream, shared));
                    if let Err(err) = spawned {
                        error!(message = "failed to spawn connection thread", error = %err);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    error!(message = "accept failed", error = %err);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }

        info!(message = "storage stopping");
    }
}

fn serve_connection(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut next_syn: u32 = 0;

    loop {
        let (header, body) = match read_message(&mut stream) {
            Ok(message) => message,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(message = "peer disconnected");
                return;
            }
            Err(err) => {
                warn!(message = "failed to read request", error = %err);
                return;
            }
        };

        let result = match header.cmd {
            cmd::SAVE_STATS_REQ => on_save(&shared, &header, body, &mut stream, &mut next_syn),
            cmd::GET_SYSTEM_STATS_REQ => {
                on_query(&shared, &header, &body, &mut stream, &mut next_syn)
            }
            cmd::REPORT_HOSTINFO_REQ => on_host_info(&header, &body, &mut stream, &mut next_syn),
            other => {
                warn!(message = "unknown command", cmd = other);
                respond(
                    &mut stream,
                    header.cmd,
                    &mut next_syn,
                    header.syn,
                    status::UNKNOWN_COMMAND,
                    &[],
                )
            }
        };

        if let Err(err) = result {
            warn!(message = "failed to write response", error = %err);
            return;
        }
    }
}

fn respond(
    stream: &mut TcpStream,
    cmd: u16,
    next_syn: &mut u32,
    ack: u32,
    code: i32,
    payload: &[u8],
) -> io::Result<()> {
    let mut body = BytesMut::with_capacity(4 + payload.len());
    body.extend_from_slice(&code.to_le_bytes());
    body.extend_from_slice(payload);

    let header = MsgHeader::response(cmd, *next_syn, ack);
    *next_syn = next_syn.wrapping_add(1);
    write_message(stream, header, &body)
}

fn on_save(
    shared: &Shared,
    header: &MsgHeader,
    mut body: BytesMut,
    stream: &mut TcpStream,
    next_syn: &mut u32,
) -> io::Result<()> {
    let mut saved = 0usize;
    let mut failed = 0usize;

    let drained = drain_frames(&mut body, |record| match record {
        Record::MergedGauge(_) | Record::MergedLcall(_) | Record::MergedRcall(_) => {
            match shared.writer.save(&record) {
                Ok(()) => saved += 1,
                Err(err) => {
                    failed += 1;
                    warn!(message = "failed to persist merged record", error = %err);
                }
            }
        }
        other => {
            failed += 1;
            warn!(
                message = "item record in a save request",
                kind = ?other.kind(),
            );
        }
    });

    let code = match drained {
        Ok(_) if failed == 0 && body.is_empty() => status::OK,
        Ok(_) => {
            if !body.is_empty() {
                warn!(
                    message = "save request ends mid-frame",
                    dangling = body.len(),
                );
            }
            status::SAVE_FAILED
        }
        Err(err) => {
            warn!(message = "corrupt save request", error = %err);
            status::SAVE_FAILED
        }
    };

    debug!(
        message = "save request handled",
        syn = header.syn,
        saved,
        failed,
    );
    respond(
        stream,
        cmd::SAVE_STATS_RSP,
        next_syn,
        header.syn,
        code,
        &[],
    )
}

fn on_query(
    shared: &Shared,
    header: &MsgHeader,
    body: &[u8],
    stream: &mut TcpStream,
    next_syn: &mut u32,
) -> io::Result<()> {
    let mut reader = Reader::new(body);
    let request = match SystemStatsRequest::parse(&mut reader) {
        Ok(request) => request,
        Err(err) => {
            warn!(message = "unreadable query", syn = header.syn, error = %err);
            return respond(
                stream,
                cmd::GET_SYSTEM_STATS_RSP,
                next_syn,
                header.syn,
                status::MISSING_PARAMETER,
                &[],
            );
        }
    };

    match query::system_stats(shared.writer.base_dir(), shared.stored_freq, &request) {
        Ok(combiner) => {
            let mut payload = BytesMut::new();
            let mut writer = Writer::new(&mut payload, MESSAGE_MAX);
            match combiner.encode(&mut writer) {
                Ok(()) => respond(
                    stream,
                    cmd::GET_SYSTEM_STATS_RSP,
                    next_syn,
                    header.syn,
                    status::OK,
                    &payload,
                ),
                Err(err) => {
                    error!(message = "response too large to encode", error = %err);
                    respond(
                        stream,
                        cmd::GET_SYSTEM_STATS_RSP,
                        next_syn,
                        header.syn,
                        status::ENCODE_FAILED,
                        &[],
                    )
                }
            }
        }
        Err(err) => {
            warn!(message = "query failed", syn = header.syn, error = %err);
            respond(
                stream,
                cmd::GET_SYSTEM_STATS_RSP,
                next_syn,
                header.syn,
                status::QUERY_FAILED,
                &[],
            )
        }
    }
}

fn on_host_info(
    header: &MsgHeader,
    body: &[u8],
    stream: &mut TcpStream,
    next_syn: &mut u32,
) -> io::Result<()> {
    let mut reader = Reader::new(body);
    let name = reader.get_string(255).unwrap_or_default();
    let host = HostAddr::parse(&mut reader)
        .map(|h| h.to_string())
        .unwrap_or_default();
    info!(message = "host reported", name = %name, host = %host);

    respond(
        stream,
        cmd::REPORT_HOSTINFO_RSP,
        next_syn,
        header.syn,
        status::OK,
        &[],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Flow;
    use std::sync::mpsc;
    use tally_merge::Combiner;
    use tally_protocol::iids;
    use tally_protocol::record::{GaugeKind, MergedGauge};
    use tally_protocol::types::{LocalKey, StatId};
    use tally_protocol::FreqUnit;

    const T: i64 = 1_622_548_800_000; // 2021-06-01 12:00:00 UTC

    fn merged_gauge(ts: i64, value: i64) -> MergedGauge {
        MergedGauge {
            timestamp: ts,
            host: HostAddr::V4([10, 0, 0, 1]),
            sid: StatId::new(1, 2, iids::LOADAVG_1),
            freq: Frequency::new(FreqUnit::Minute, 1),
            kind: GaugeKind::Snapshot,
            value,
        }
    }

    #[test]
    fn save_then_query_round_trips_through_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(StorageConfig {
            stats_dir: dir.path().to_owned(),
            listen_addr: "127.0.0.1:0".into(),
            stored_frequency: "1m".into(),
        })
        .unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stop_rx) = mpsc::channel();
        let running = std::thread::spawn(move || server.run(stop_rx));

        let mut flow = Flow::new("storage", addr.to_string());

        // ship two buckets of one gauge series
        let mut body = BytesMut::new();
        let mut writer = Writer::new(&mut body, MESSAGE_MAX);
        Record::MergedGauge(merged_gauge(T, 5))
            .encode(&mut writer)
            .unwrap();
        Record::MergedGauge(merged_gauge(T + 3_600_000, 7))
            .encode(&mut writer)
            .unwrap();

        let (header, rsp) = flow
            .request(cmd::SAVE_STATS_REQ, &body, Duration::from_secs(5))
            .unwrap();
        assert_eq!(header.cmd, cmd::SAVE_STATS_RSP);
        assert_eq!(Reader::new(&rsp).get_i32().unwrap(), status::OK);

        // query them back over a two-hour window, per host
        let request = SystemStatsRequest {
            context: tally_protocol::wire::QueryContext::Resource,
            total_view: false,
            start: T,
            end: T + 2 * 3_600_000,
            span: Frequency::new(FreqUnit::Hour, 1),
            pid: 1,
            mid: 2,
            iids: vec![iids::LOADAVG_1],
            hosts: vec![],
        };
        let mut req_body = BytesMut::new();
        let mut writer = Writer::new(&mut req_body, 4096);
        request.encode(&mut writer).unwrap();

        let (header, rsp) = flow
            .request(cmd::GET_SYSTEM_STATS_REQ, &req_body, Duration::from_secs(5))
            .unwrap();
        assert_eq!(header.cmd, cmd::GET_SYSTEM_STATS_RSP);

        let mut reader = Reader::new(&rsp);
        assert_eq!(reader.get_i32().unwrap(), status::OK);
        let combiner = Combiner::parse(&mut reader).unwrap();
        assert_eq!(combiner.period_count(), 2);

        let key = LocalKey::new(
            HostAddr::V4([10, 0, 0, 1]),
            StatId::new(0, 0, iids::LOADAVG_1),
        );
        assert_eq!(combiner.gauges()[0][&key].value, 5);
        assert_eq!(combiner.gauges()[1][&key].value, 7);

        drop(stop);
        running.join().unwrap();
    }

    #[test]
    fn malformed_query_gets_missing_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(StorageConfig {
            stats_dir: dir.path().to_owned(),
            listen_addr: "127.0.0.1:0".into(),
            stored_frequency: "1m".into(),
        })
        .unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stop_rx) = mpsc::channel();
        let running = std::thread::spawn(move || server.run(stop_rx));

        let mut flow = Flow::new("storage", addr.to_string());
        let (header, rsp) = flow
            .request(cmd::GET_SYSTEM_STATS_REQ, &[1, 2, 3], Duration::from_secs(5))
            .unwrap();
        assert_eq!(header.cmd, cmd::GET_SYSTEM_STATS_RSP);
        assert_eq!(
            Reader::new(&rsp).get_i32().unwrap(),
            status::MISSING_PARAMETER
        );

        drop(stop);
        running.join().unwrap();
    }
}
