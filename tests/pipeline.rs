//! End-to-end exercises over real temp directories and sockets: client
//! emit → tailer → merger → storage → query.

use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tally::agent::shipper::BatchShipper;
use tally::agent::tailer::{Tailer, TailerConfig};
use tally::net::Flow;
use tally::storage::server::Server;
use tally_client::StatsLogger;
use tally_merge::{GaugeMap, LcallMap, MergedSink, RcallMap};
use tally_protocol::iids;
use tally_protocol::record::GaugeKind;
use tally_protocol::types::{HostAddr, LocalKey, StatId};
use tally_protocol::wire::{cmd, status, QueryContext, SystemStatsRequest};
use tally_protocol::{Frequency, FreqUnit, Reader, Writer};

// 2021-06-01 12:00:00 UTC; hour-aligned, middle of the local day in any
// timezone close enough to matter
const T: i64 = 1_622_548_800_000;
const MINUTE: i64 = 60_000;
const DAY: i64 = 86_400_000;

#[derive(Clone, Default)]
struct SharedSink {
    gauges: Arc<Mutex<Vec<GaugeMap>>>,
}

impl SharedSink {
    fn total_records(&self) -> usize {
        self.gauges.lock().unwrap().iter().map(|m| m.len()).sum()
    }
}

impl MergedSink for SharedSink {
    fn save_gauges(&mut self, gauges: GaugeMap) {
        self.gauges.lock().unwrap().push(gauges);
    }
    fn save_lcalls(&mut self, _: LcallMap) {}
    fn save_rcalls(&mut self, _: RcallMap) {}
}

fn tailer_config(dir: &Path) -> TailerConfig {
    TailerConfig {
        directory: dir.to_owned(),
        prefix: "svc".into(),
        check_interval: Duration::from_millis(10),
        merge_freq: Frequency::new(FreqUnit::Minute, 1),
        cached_periods: 2,
    }
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn cursor_content(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("svc_cursor.pt")).unwrap_or_default()
}

#[test]
fn tailer_rolls_over_after_two_quiet_passes() {
    let dir = tempfile::tempdir().unwrap();
    let logger = StatsLogger::new(1, 2, HostAddr::V4([127, 0, 0, 1]), dir.path().join("svc"))
        .unwrap();

    // day one: three whole frames
    for i in 0..3 {
        logger
            .log_gauge_at(T + i * MINUTE, 100, GaugeKind::Snapshot, i)
            .unwrap();
    }
    let day1 = logger.log_path(T).unwrap();

    // day two: ten bytes of a frame, writer still mid-append
    logger
        .log_gauge_at(T + DAY, 100, GaugeKind::Snapshot, 9)
        .unwrap();
    let day2 = logger.log_path(T + DAY).unwrap();
    let full = std::fs::read(&day2).unwrap();
    std::fs::write(&day2, &full[..10]).unwrap();

    let day1_name = day1.file_name().unwrap().to_str().unwrap().to_owned();
    let day2_name = day2.file_name().unwrap().to_str().unwrap().to_owned();

    let sink = SharedSink::default();
    let (stop, stop_rx) = mpsc::channel::<()>();
    let tailer = Tailer::new(tailer_config(dir.path()), sink.clone(), stop_rx).unwrap();
    let join = std::thread::spawn(move || tailer.run());

    // it must consume day one and move on to day two at offset zero
    wait_until("rollover cursor", || {
        cursor_content(dir.path()) == format!("{day2_name} 0")
    });
    assert_ne!(day1_name, day2_name);

    drop(stop);
    join.join().unwrap();

    // the exit flush delivers what day one held
    assert_eq!(sink.total_records(), 3);
}

#[test]
fn restarting_from_the_cursor_produces_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let logger = StatsLogger::new(1, 2, HostAddr::V4([127, 0, 0, 1]), dir.path().join("svc"))
        .unwrap();
    for i in 0..5 {
        logger
            .log_gauge_at(T + i * MINUTE, 100, GaugeKind::Snapshot, i)
            .unwrap();
    }
    let log_size = std::fs::metadata(logger.log_path(T).unwrap()).unwrap().len();
    let log_name = logger
        .log_path(T)
        .unwrap()
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();

    // first run: read to EOF
    let first_sink = SharedSink::default();
    let (stop, stop_rx) = mpsc::channel::<()>();
    let tailer = Tailer::new(tailer_config(dir.path()), first_sink.clone(), stop_rx).unwrap();
    let join = std::thread::spawn(move || tailer.run());
    wait_until("first consume", || {
        cursor_content(dir.path()) == format!("{log_name} {log_size}")
    });
    drop(stop);
    join.join().unwrap();
    assert_eq!(first_sink.total_records(), 5);

    // second run over the unchanged file: cursor holds, nothing is re-read
    let second_sink = SharedSink::default();
    let (stop, stop_rx) = mpsc::channel::<()>();
    let tailer = Tailer::new(tailer_config(dir.path()), second_sink.clone(), stop_rx).unwrap();
    let join = std::thread::spawn(move || tailer.run());
    std::thread::sleep(Duration::from_millis(200));
    drop(stop);
    join.join().unwrap();

    assert_eq!(second_sink.total_records(), 0);
    assert_eq!(cursor_content(dir.path()), format!("{log_name} {log_size}"));
}

#[test]
fn emit_to_query_through_the_wire() {
    let log_dir = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();

    let server = Server::bind(tally::config::StorageConfig {
        stats_dir: store_dir.path().to_owned(),
        listen_addr: "127.0.0.1:0".into(),
        stored_frequency: "1m".into(),
    })
    .unwrap();
    let addr = server.local_addr().unwrap();
    let (server_stop, server_stop_rx) = mpsc::channel::<()>();
    let server_join = std::thread::spawn(move || server.run(server_stop_rx));

    let logger = StatsLogger::new(
        1,
        2,
        HostAddr::V4([127, 0, 0, 1]),
        log_dir.path().join("svc"),
    )
    .unwrap();
    // two samples in one bucket, then one far enough ahead to flush it
    logger
        .log_gauge_at(T, iids::LOADAVG_1, GaugeKind::Snapshot, 40)
        .unwrap();
    logger
        .log_gauge_at(T + 30_000, iids::LOADAVG_1, GaugeKind::Snapshot, 42)
        .unwrap();
    logger
        .log_gauge_at(T + 10 * MINUTE, iids::LOADAVG_1, GaugeKind::Snapshot, 7)
        .unwrap();

    let shipper = BatchShipper::new(Flow::new("storage", addr.to_string()));
    let (stop, stop_rx) = mpsc::channel::<()>();
    let tailer = Tailer::new(tailer_config(log_dir.path()), shipper, stop_rx).unwrap();
    let join = std::thread::spawn(move || tailer.run());

    // the flushed bucket lands in the partition tree
    let mut flow = Flow::new("query", addr.to_string());
    let request = SystemStatsRequest {
        context: QueryContext::Resource,
        total_view: false,
        start: T,
        end: T + 60 * MINUTE,
        span: Frequency::new(FreqUnit::Minute, 1),
        pid: 1,
        mid: 2,
        iids: vec![iids::LOADAVG_1],
        hosts: vec![],
    };
    let mut req_body = bytes::BytesMut::new();
    let mut writer = Writer::new(&mut req_body, 4096);
    request.encode(&mut writer).unwrap();

    let key = LocalKey::new(
        HostAddr::V4([127, 0, 0, 1]),
        StatId::new(0, 0, iids::LOADAVG_1),
    );
    let mut last_value = None;
    wait_until("merged bucket visible to queries", || {
        let (header, rsp) = match flow.request(
            cmd::GET_SYSTEM_STATS_REQ,
            &req_body,
            Duration::from_secs(2),
        ) {
            Ok(reply) => reply,
            Err(_) => return false,
        };
        assert_eq!(header.cmd, cmd::GET_SYSTEM_STATS_RSP);

        let mut reader = Reader::new(&rsp);
        if reader.get_i32().unwrap_or(-1) != status::OK {
            return false;
        }
        let combiner = match tally_merge::Combiner::parse(&mut reader) {
            Ok(combiner) => combiner,
            Err(_) => return false,
        };
        match combiner.gauges()[0].get(&key) {
            Some(gauge) => {
                last_value = Some(gauge.value);
                true
            }
            None => false,
        }
    });

    // snapshot semantics: the later arrival within the bucket won
    assert_eq!(last_value, Some(42));

    drop(stop);
    join.join().unwrap();
    drop(server_stop);
    server_join.join().unwrap();
}
