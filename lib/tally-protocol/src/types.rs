//! Identities and result payloads shared by every record kind.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::buf::{CorruptSnafu, DecodeError, EncodeError, Reader, Writer};

const FNV_SEED: u64 = 2_166_136_261;
const FNV_PRIME: u64 = 16_777_619;

/// A host address as it appears on the wire: a version tag followed by the
/// raw address octets. Octets are kept in network order end to end; they are
/// never reinterpreted as an integer except for hash mixing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostAddr {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl HostAddr {
    /// The zeroed address used by roll-up projections ("any host").
    pub const ANY: HostAddr = HostAddr::V4([0; 4]);

    pub fn ver(&self) -> u8 {
        match self {
            HostAddr::V4(_) => 4,
            HostAddr::V6(_) => 6,
        }
    }

    pub fn parse(reader: &mut Reader<'_>) -> Result<HostAddr, DecodeError> {
        let ver = reader.get_u8()?;
        match ver {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(reader.get_bytes(4)?);
                Ok(HostAddr::V4(octets))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(reader.get_bytes(16)?);
                Ok(HostAddr::V6(octets))
            }
            _ => CorruptSnafu {
                offset: reader.position(),
                reason: "host address version is neither 4 nor 6",
            }
            .fail(),
        }
    }

    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        writer.put_u8(self.ver())?;
        match self {
            HostAddr::V4(octets) => writer.put_bytes(octets),
            HostAddr::V6(octets) => writer.put_bytes(octets),
        }
    }

    /// The 32-bit word mixed into key hashes. IPv6 addresses are not mixed;
    /// equality still compares all octets, so v6 keys collide in hash buckets
    /// but never merge by accident.
    fn hash_word(&self) -> Option<u32> {
        match self {
            HostAddr::V4(octets) => Some(u32::from_le_bytes(*octets)),
            HostAddr::V6(_) => None,
        }
    }

    fn fnv_mix(&self, mut h: u64) -> u64 {
        if let Some(word) = self.hash_word() {
            h ^= u64::from(word);
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddr::V4(octets) => Ipv4Addr::from(*octets).fmt(f),
            HostAddr::V6(octets) => Ipv6Addr::from(*octets).fmt(f),
        }
    }
}

impl FromStr for HostAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<IpAddr>()? {
            IpAddr::V4(v4) => HostAddr::V4(v4.octets()),
            IpAddr::V6(v6) => HostAddr::V6(v6.octets()),
        })
    }
}

impl From<Ipv4Addr> for HostAddr {
    fn from(addr: Ipv4Addr) -> Self {
        HostAddr::V4(addr.octets())
    }
}

/// The `(product, module, item)` triple identifying a stat series. Zero in
/// any field means "any" at query time; emitted records carry concrete ids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatId {
    pub pid: u16,
    pub mid: u16,
    pub iid: u16,
}

impl StatId {
    pub const fn new(pid: u16, mid: u16, iid: u16) -> Self {
        StatId { pid, mid, iid }
    }

    pub fn parse(reader: &mut Reader<'_>) -> Result<StatId, DecodeError> {
        Ok(StatId {
            pid: reader.get_u16()?,
            mid: reader.get_u16()?,
            iid: reader.get_u16()?,
        })
    }

    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        writer.put_u16(self.pid)?;
        writer.put_u16(self.mid)?;
        writer.put_u16(self.iid)
    }

    fn fnv_mix(&self, mut h: u64) -> u64 {
        h ^= (u64::from(self.pid) << 16) | u64::from(self.mid);
        h = h.wrapping_mul(FNV_PRIME);
        h ^= u64::from(self.iid);
        h.wrapping_mul(FNV_PRIME)
    }
}

impl fmt::Display for StatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}-{:04x}-{:04x}", self.pid, self.mid, self.iid)
    }
}

/// Identity of a locally-observed series: the emitting host plus its id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalKey {
    pub host: HostAddr,
    pub sid: StatId,
}

impl LocalKey {
    pub const fn new(host: HostAddr, sid: StatId) -> Self {
        LocalKey { host, sid }
    }

    fn fnv(&self) -> u64 {
        self.sid.fnv_mix(self.host.fnv_mix(FNV_SEED))
    }
}

impl Hash for LocalKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fnv());
    }
}

/// Identity of a remote-call series: caller then callee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RcallKey {
    pub src: LocalKey,
    pub dst: LocalKey,
}

impl RcallKey {
    pub const fn new(src: LocalKey, dst: LocalKey) -> Self {
        RcallKey { src, dst }
    }

    fn fnv(&self) -> u64 {
        let h = self.src.sid.fnv_mix(self.src.host.fnv_mix(FNV_SEED));
        self.dst.sid.fnv_mix(self.dst.host.fnv_mix(h))
    }
}

impl Hash for RcallKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fnv());
    }
}

/// One observed call outcome: response time in microseconds plus request and
/// response sizes in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallResult {
    pub rsp_time_us: u32,
    pub in_bytes: u32,
    pub out_bytes: u32,
}

impl CallResult {
    pub const fn new(rsp_time_us: u32, in_bytes: u32, out_bytes: u32) -> Self {
        CallResult {
            rsp_time_us,
            in_bytes,
            out_bytes,
        }
    }

    pub fn parse(reader: &mut Reader<'_>) -> Result<CallResult, DecodeError> {
        Ok(CallResult {
            rsp_time_us: reader.get_u32()?,
            in_bytes: reader.get_u32()?,
            out_bytes: reader.get_u32()?,
        })
    }

    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        writer.put_u32(self.rsp_time_us)?;
        writer.put_u32(self.in_bytes)?;
        writer.put_u32(self.out_bytes)
    }
}

/// The aggregate of many [`CallResult`]s sharing a retcode: an exact count
/// plus running means of each field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergedResult {
    pub count: u32,
    pub rsp_time_us: u32,
    pub in_bytes: u32,
    pub out_bytes: u32,
}

impl MergedResult {
    /// The aggregate of a single observation.
    pub fn first(r: CallResult) -> Self {
        MergedResult {
            count: 1,
            rsp_time_us: r.rsp_time_us,
            in_bytes: r.in_bytes,
            out_bytes: r.out_bytes,
        }
    }

    /// Fold `other` into `self` by weighted mean. Intermediates are u64 so
    /// `mean * count` cannot overflow, and the division rounds to nearest,
    /// which keeps the merge commutative to within one unit.
    pub fn absorb(&mut self, other: MergedResult) {
        let c1 = u64::from(self.count);
        let c2 = u64::from(other.count);
        if c2 == 0 {
            return;
        }
        if c1 == 0 {
            *self = other;
            return;
        }

        let total = c1 + c2;
        let mean = |a: u32, b: u32| -> u32 {
            let sum = u64::from(a) * c1 + u64::from(b) * c2;
            ((sum + total / 2) / total) as u32
        };

        self.rsp_time_us = mean(self.rsp_time_us, other.rsp_time_us);
        self.in_bytes = mean(self.in_bytes, other.in_bytes);
        self.out_bytes = mean(self.out_bytes, other.out_bytes);
        self.count = self.count.saturating_add(other.count);
    }

    /// Fold a single raw observation into the aggregate.
    pub fn absorb_sample(&mut self, r: CallResult) {
        self.absorb(MergedResult::first(r));
    }

    pub fn parse(reader: &mut Reader<'_>) -> Result<MergedResult, DecodeError> {
        Ok(MergedResult {
            count: reader.get_u32()?,
            rsp_time_us: reader.get_u32()?,
            in_bytes: reader.get_u32()?,
            out_bytes: reader.get_u32()?,
        })
    }

    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        writer.put_u32(self.count)?;
        writer.put_u32(self.rsp_time_us)?;
        writer.put_u32(self.in_bytes)?;
        writer.put_u32(self.out_bytes)
    }
}
