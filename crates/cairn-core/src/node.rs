//! Node records — the JSON announcement one host makes about itself.
//!
//! The same record travels two routes: inside UDP packets (where `ip_addr`
//! and `time_ns` are carried in the body) and as an object-store body
//! (where the store supplies both through the key and the modification
//! time, so the fields are omitted).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Default UDP port for peer-to-peer announcements.
pub const DEFAULT_PORT: u16 = 17106;

/// Feature name → raw JSON value.
///
/// Values are kept as the source document's own bytes; equality between two
/// maps is textual. The sorted keys make every encoding of a given map
/// deterministic.
pub type FeatureMap = BTreeMap<String, Box<RawValue>>;

/// One host's announcement.
///
/// Every field is omitted from serialization when empty so that a goodbye
/// packet (no features) and a storage body (no addressing) stay minimal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    /// Textual IPv4 or IPv6 address. Wire packets only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_addr: String,

    /// Nanoseconds since the Unix epoch. Wire packets only; the
    /// object-store variant takes its timestamp from object metadata.
    #[serde(default, skip_serializing_if = "time_is_zero")]
    pub time_ns: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: FeatureMap,
}

fn time_is_zero(ns: &i64) -> bool {
    *ns == 0
}

/// Textual equality of two feature maps: same names, same raw value bytes.
pub fn features_equal(a: &FeatureMap, b: &FeatureMap) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((ka, va), (kb, vb))| ka == kb && va.get() == vb.get())
}

/// A feature name is non-empty ASCII matching `[A-Za-z0-9_-]+`.
pub fn is_valid_feature_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Serialize with tab indentation and a trailing newline — the format used
/// both for object-store bodies and for materialized state files.
pub fn to_pretty_json<T>(value: &T) -> serde_json::Result<Vec<u8>>
where
    T: ?Sized + Serialize,
{
    let mut data = Vec::with_capacity(128);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut data, formatter);
    value.serialize(&mut ser)?;
    data.push(b'\n');
    Ok(data)
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_nanos() as i64
}

/// Whether an address is acceptable as a peer identity: not loopback,
/// link-local, multicast, broadcast or unspecified.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || is_unicast_link_local(v6))
        }
    }
}

fn is_unicast_link_local(v6: &Ipv6Addr) -> bool {
    v6.segments()[0] & 0xffc0 == 0xfe80
}
