//! Reserved item-id ranges for host resource metrics.
//!
//! Resource series share one id space per host: CPU ids encode a core
//! number and a counter kind, network and disk ids likewise encode an
//! interface/device number, and `99` in the number position means the
//! whole-host total.

/// CPU counter kinds within a `1000 + 10*cpu_no + kind` id.
pub const CPU_SYS: u16 = 0;
pub const CPU_USR: u16 = 1;
pub const CPU_IDLE: u16 = 2;
pub const CPU_WAIT: u16 = 3;
pub const CPU_STEAL: u16 = 4;

/// Pseudo core numbers: whole-machine total and per-core expansion.
pub const CPU_NO_TOTAL: u16 = 99;
pub const CPU_NO_CORES: u16 = 98;

pub const MEM_USED: u16 = 2000;
pub const MEM_FREE: u16 = 2001;
pub const MEM_CACHED: u16 = 2002;
pub const MEM_BUFFERS: u16 = 2003;
pub const SWAP_USED: u16 = 2010;
pub const SWAP_FREE: u16 = 2011;

pub const LOADAVG_1: u16 = 2020;
pub const LOADAVG_5: u16 = 2021;
pub const LOADAVG_15: u16 = 2022;

/// Network counter kinds within a `2100 + 10*if_no + kind` id.
pub const NET_IN_BYTES: u16 = 0;
pub const NET_IN_PKTS: u16 = 1;
pub const NET_OUT_BYTES: u16 = 2;
pub const NET_OUT_PKTS: u16 = 3;
pub const NET_CONN_ESTABLISHED: u16 = 4;
pub const NET_CONN_WAIT: u16 = 5;

pub const NET_NO_ALL: u16 = 99;

/// Disk counter kinds within a `3000 + 10*disk_no + kind` id.
pub const DISK_R_CALLS: u16 = 0;
pub const DISK_R_MERGED: u16 = 1;
pub const DISK_R_BYTES: u16 = 2;
pub const DISK_R_TIME: u16 = 3;
pub const DISK_W_CALLS: u16 = 4;
pub const DISK_W_MERGED: u16 = 5;
pub const DISK_W_BYTES: u16 = 6;
pub const DISK_W_TIME: u16 = 7;
pub const DISK_Q_SIZE: u16 = 8;
pub const DISK_UTIL: u16 = 9;

pub const DISK_NO_ALL: u16 = 99;

pub const fn cpu_iid(cpu_no: u16, kind: u16) -> u16 {
    1000 + cpu_no * 10 + kind
}

pub const fn net_iid(if_no: u16, kind: u16) -> u16 {
    2100 + if_no * 10 + kind
}

pub const fn disk_iid(disk_no: u16, kind: u16) -> u16 {
    3000 + disk_no * 10 + kind
}

pub const fn is_cpu(iid: u16) -> bool {
    iid >= 1000 && iid < 2000
}

pub const fn cpu_no(iid: u16) -> u16 {
    (iid - 1000) / 10
}

pub const fn is_memory(iid: u16) -> bool {
    iid >= 2000 && iid < 2020
}

pub const fn is_load_avg(iid: u16) -> bool {
    iid >= 2020 && iid < 2030
}

pub const fn is_network(iid: u16) -> bool {
    iid >= 2100 && iid < 3000
}

pub const fn net_no(iid: u16) -> u16 {
    (iid - 2100) / 10
}

pub const fn is_disk(iid: u16) -> bool {
    iid >= 3000 && iid < 4000
}

pub const fn disk_no(iid: u16) -> u16 {
    (iid - 3000) / 10
}

/// Resource metric families a query can select over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricFamily {
    Cpu,
    Memory,
    LoadAvg,
    Network,
    Disk,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 5] = [
        MetricFamily::Cpu,
        MetricFamily::Memory,
        MetricFamily::LoadAvg,
        MetricFamily::Network,
        MetricFamily::Disk,
    ];

    pub fn of(iid: u16) -> Option<MetricFamily> {
        if is_cpu(iid) {
            Some(MetricFamily::Cpu)
        } else if is_memory(iid) {
            Some(MetricFamily::Memory)
        } else if is_load_avg(iid) {
            Some(MetricFamily::LoadAvg)
        } else if is_network(iid) {
            Some(MetricFamily::Network)
        } else if is_disk(iid) {
            Some(MetricFamily::Disk)
        } else {
            None
        }
    }
}
