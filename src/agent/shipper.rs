//! Turns flushed merger buckets into `SAVE_STATS_REQ` messages.
//!
//! Records are packed at most [`BATCH_RECORDS_MAX`] to a message; a full
//! message is dispatched immediately and a fresh one started. Delivery is
//! lossy: the merger has already advanced past these records, so a failed
//! send is logged and the batch is gone.

use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, warn};

use tally_merge::{GaugeMap, LcallMap, MergedSink, RcallMap};
use tally_protocol::wire::cmd;
use tally_protocol::{Reader, Record, Writer};

use crate::net::Flow;

/// Merged records per outbound message.
pub const BATCH_RECORDS_MAX: usize = 100;

/// Byte cap per outbound message body.
const MESSAGE_CAP: usize = 256 * 1024;

/// How long to wait for the storage side to acknowledge a batch.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BatchShipper {
    flow: Flow,
}

impl BatchShipper {
    pub fn new(flow: Flow) -> BatchShipper {
        BatchShipper { flow }
    }

    fn ship(&mut self, records: impl Iterator<Item = Record>) {
        let mut body = BytesMut::new();
        let mut scratch = BytesMut::new();
        let mut count = 0usize;

        for record in records {
            scratch.clear();
            let mut writer = Writer::new(&mut scratch, MESSAGE_CAP);
            if let Err(err) = record.encode(&mut writer) {
                warn!(
                    message = "merged record larger than a message, dropping it",
                    error = %err,
                );
                continue;
            }

            if count > 0 && body.len() + scratch.len() > MESSAGE_CAP {
                self.dispatch(&mut body, &mut count);
            }
            body.extend_from_slice(&scratch);
            count += 1;

            if count >= BATCH_RECORDS_MAX {
                self.dispatch(&mut body, &mut count);
            }
        }

        if count > 0 {
            self.dispatch(&mut body, &mut count);
        }
    }

    fn dispatch(&mut self, body: &mut BytesMut, count: &mut usize) {
        let payload = body.split();
        let records = *count;
        *count = 0;

        match self
            .flow
            .request(cmd::SAVE_STATS_REQ, &payload, ACK_TIMEOUT)
        {
            Ok((header, rsp)) => {
                let status = Reader::new(&rsp).get_i32().unwrap_or(-1);
                debug!(
                    message = "batch acknowledged",
                    records,
                    bytes = payload.len(),
                    ack = header.ack,
                    status,
                );
            }
            Err(err) => {
                warn!(
                    message = "failed to ship batch, records lost",
                    records,
                    bytes = payload.len(),
                    error = %err,
                );
            }
        }
    }
}

impl MergedSink for BatchShipper {
    fn save_gauges(&mut self, gauges: GaugeMap) {
        self.ship(gauges.into_values().map(Record::MergedGauge));
    }

    fn save_lcalls(&mut self, lcalls: LcallMap) {
        self.ship(lcalls.into_values().map(Record::MergedLcall));
    }

    fn save_rcalls(&mut self, rcalls: RcallMap) {
        self.ship(rcalls.into_values().map(Record::MergedRcall));
    }
}
