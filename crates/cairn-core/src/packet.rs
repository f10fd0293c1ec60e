//! Announcement packet codec — the cairn wire format.
//!
//! Frame layout:
//!
//! ```text
//! [0]        mode id (1 byte)
//! [1..M-20]  DEFLATE-compressed JSON node record (preset dictionary)
//! [M-20..M]  HMAC-SHA1 over bytes [0..M-20] with the mode secret
//! ```
//!
//! Both endpoints must share the preset dictionary and the mode table.
//! Changing either breaks the wire format for the whole fleet.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

use crate::node::Node;

type HmacSha1 = Hmac<Sha1>;

/// A shared UDP packet configuration: the id byte selects which secret the
/// receiver verifies with. Several receive modes may be accepted at once;
/// exactly one mode is used for sending.
#[derive(Debug, Clone)]
pub struct PacketMode {
    pub id: u8,
    pub secret: Vec<u8>,
}

impl PacketMode {
    pub fn new(id: u8, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            secret: secret.into(),
        }
    }
}

/// Preset dictionary for DEFLATE. The literal JSON vocabulary of the node
/// record (including the `"names"` fragment of the historical wire schema,
/// kept so the dictionary bytes stay identical across versions).
pub const COMPRESSION_DICT: &[u8] =
    br#"{"ip_addr":","time_ns":,"names":[","],"features":{":true,"}}}"#;

pub const MODE_ID_LEN: usize = 1;
pub const DIGEST_LEN: usize = 20;

/// Mode byte, at least one compressed byte, and the MAC.
pub const MIN_PACKET_LEN: usize = MODE_ID_LEN + 1 + DIGEST_LEN;

/// Largest datagram assumed to survive any sane path MTU.
pub const SAFE_DATAGRAM_SIZE: usize = 512;

/// Above this a packet is worth an INFO log; above SAFE_DATAGRAM_SIZE an
/// ERROR. Transmission is never refused.
pub const LARGE_DATAGRAM_SIZE: usize = SAFE_DATAGRAM_SIZE - SAFE_DATAGRAM_SIZE / 4;

/// UDP receive buffer size.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet is too short: {0} bytes")]
    TooShort(usize),

    #[error("packet has unknown mode: {0}")]
    UnknownMode(u8),

    #[error("packet is inauthentic (mode {0})")]
    Inauthentic(u8),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("bad packet address: {0}")]
    BadAddress(String),

    #[error("packet address {0} doesn't match origin {1}")]
    BadOrigin(String, IpAddr),
}

/// Encode one node record into a complete frame.
pub fn encode(node: &Node, mode: &PacketMode) -> Result<Vec<u8>, PacketError> {
    let json = serde_json::to_vec(node).map_err(|e| PacketError::Malformed(e.to_string()))?;

    let mut frame = Vec::with_capacity(MODE_ID_LEN + json.len() / 2 + DIGEST_LEN + 16);
    frame.push(mode.id);
    deflate_into(&json, &mut frame)?;

    let mut mac = HmacSha1::new_from_slice(&mode.secret).expect("HMAC accepts any key length");
    mac.update(&frame);
    frame.extend_from_slice(&mac.finalize().into_bytes());

    Ok(frame)
}

/// Decode and authenticate one frame against the receive-mode table.
pub fn decode(data: &[u8], modes: &HashMap<u8, PacketMode>) -> Result<Node, PacketError> {
    if data.len() < MIN_PACKET_LEN {
        return Err(PacketError::TooShort(data.len()));
    }

    let mode_id = data[0];
    let mode = modes
        .get(&mode_id)
        .ok_or(PacketError::UnknownMode(mode_id))?;

    let (message, digest) = data.split_at(data.len() - DIGEST_LEN);

    let mut mac = HmacSha1::new_from_slice(&mode.secret).expect("HMAC accepts any key length");
    mac.update(message);
    mac.verify_slice(digest)
        .map_err(|_| PacketError::Inauthentic(mode_id))?;

    let json = inflate(&message[MODE_ID_LEN..])?;
    serde_json::from_slice(&json).map_err(|e| PacketError::Malformed(e.to_string()))
}

/// Require that the address a node claims matches where its packet came from.
pub fn verify_origin(node: &Node, origin: &SocketAddr) -> Result<(), PacketError> {
    let ip: IpAddr = node
        .ip_addr
        .parse()
        .map_err(|_| PacketError::BadAddress(node.ip_addr.clone()))?;

    if ip != origin.ip().to_canonical() {
        return Err(PacketError::BadOrigin(node.ip_addr.clone(), origin.ip()));
    }

    Ok(())
}

fn deflate_into(input: &[u8], out: &mut Vec<u8>) -> Result<(), PacketError> {
    let mut compress = Compress::new(Compression::default(), false);
    compress
        .set_dictionary(COMPRESSION_DICT)
        .map_err(|e| PacketError::Malformed(e.to_string()))?;

    loop {
        let consumed = compress.total_in() as usize;
        if out.capacity() == out.len() {
            out.reserve(input.len() / 2 + 64);
        }

        let status = compress
            .compress_vec(&input[consumed..], out, FlushCompress::Finish)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;

        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {}
        }
    }
}

fn inflate(input: &[u8]) -> Result<Vec<u8>, PacketError> {
    let mut decompress = Decompress::new(false);
    decompress
        .set_dictionary(COMPRESSION_DICT)
        .map_err(|e| PacketError::Malformed(e.to_string()))?;
    let mut out = Vec::with_capacity(input.len() * 4 + 64);

    loop {
        let consumed = decompress.total_in() as usize;
        let produced = out.len();
        if out.capacity() == out.len() {
            out.reserve(256);
        }

        let status = decompress
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;

        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                if decompress.total_in() as usize == input.len() && out.len() == produced {
                    return Err(PacketError::Malformed("truncated deflate stream".into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FeatureMap;

    fn test_mode() -> PacketMode {
        PacketMode::new(0, b"swordfish".to_vec())
    }

    fn mode_table(modes: &[PacketMode]) -> HashMap<u8, PacketMode> {
        modes.iter().map(|m| (m.id, m.clone())).collect()
    }

    fn test_node() -> Node {
        let mut features = FeatureMap::new();
        features.insert("foo".into(), serde_json::from_str("true").unwrap());
        features.insert("weight".into(), serde_json::from_str("10").unwrap());
        Node {
            ip_addr: "10.0.0.1".into(),
            time_ns: 1_400_000_000_000_000_000,
            features,
        }
    }

    #[test]
    fn round_trip() {
        let mode = test_mode();
        let node = test_node();

        let frame = encode(&node, &mode).unwrap();
        let recovered = decode(&frame, &mode_table(&[mode])).unwrap();

        assert_eq!(recovered.ip_addr, node.ip_addr);
        assert_eq!(recovered.time_ns, node.time_ns);
        assert!(crate::node::features_equal(&recovered.features, &node.features));
    }

    #[test]
    fn round_trip_with_secondary_receive_mode() {
        let send = PacketMode::new(7, b"new-secret".to_vec());
        let old = PacketMode::new(0, b"old-secret".to_vec());

        let frame = encode(&test_node(), &send).unwrap();
        let recovered = decode(&frame, &mode_table(&[old, send])).unwrap();
        assert_eq!(recovered.ip_addr, "10.0.0.1");
    }

    #[test]
    fn encode_is_deterministic() {
        let mode = test_mode();
        let node = test_node();
        assert_eq!(encode(&node, &mode).unwrap(), encode(&node, &mode).unwrap());
    }

    #[test]
    fn compression_dictionary_pays_off() {
        let mode = test_mode();
        let frame = encode(&test_node(), &mode).unwrap();
        let json = serde_json::to_vec(&test_node()).unwrap();
        assert!(frame.len() < MODE_ID_LEN + json.len() + DIGEST_LEN);
    }

    #[test]
    fn short_packet_rejected() {
        let modes = mode_table(&[test_mode()]);
        match decode(&[0u8; 21], &modes) {
            Err(PacketError::TooShort(21)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn minimum_length_packet_reaches_the_inflater() {
        // 22 bytes pass the length check; a 1-byte compressed region cannot
        // be a complete DEFLATE stream, so the failure must be Malformed.
        let mode = test_mode();
        let mut frame = vec![mode.id, 0x00];
        let mut mac = HmacSha1::new_from_slice(&mode.secret).unwrap();
        mac.update(&frame);
        frame.extend_from_slice(&mac.finalize().into_bytes());
        assert_eq!(frame.len(), MIN_PACKET_LEN);

        match decode(&frame, &mode_table(&[mode])) {
            Err(PacketError::Malformed(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_mode_rejected() {
        let frame = encode(&test_node(), &PacketMode::new(9, b"x".to_vec())).unwrap();
        match decode(&frame, &mode_table(&[test_mode()])) {
            Err(PacketError::UnknownMode(9)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tampered_digest_rejected() {
        let mode = test_mode();
        let mut frame = encode(&test_node(), &mode).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        match decode(&frame, &mode_table(&[mode])) {
            Err(PacketError::Inauthentic(0)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tampered_body_rejected() {
        let mode = test_mode();
        let mut frame = encode(&test_node(), &mode).unwrap();
        frame[2] ^= 0xff;

        match decode(&frame, &mode_table(&[mode])) {
            Err(PacketError::Inauthentic(0)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wrong_secret_rejected() {
        let frame = encode(&test_node(), &test_mode()).unwrap();
        let imposter = PacketMode::new(0, b"not-swordfish".to_vec());
        match decode(&frame, &mode_table(&[imposter])) {
            Err(PacketError::Inauthentic(0)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn origin_must_match_claimed_address() {
        let node = test_node();

        let good: SocketAddr = "10.0.0.1:17106".parse().unwrap();
        assert!(verify_origin(&node, &good).is_ok());

        let bad: SocketAddr = "10.0.0.2:17106".parse().unwrap();
        match verify_origin(&node, &bad) {
            Err(PacketError::BadOrigin(claimed, origin)) => {
                assert_eq!(claimed, "10.0.0.1");
                assert_eq!(origin, bad.ip());
            }
            other => panic!("unexpected: {other:?}"),
        }

        let unparsable = Node {
            ip_addr: "not-an-ip".into(),
            ..Node::default()
        };
        assert!(matches!(
            verify_origin(&unparsable, &good),
            Err(PacketError::BadAddress(_))
        ));
    }

    #[test]
    fn goodbye_packet_is_small() {
        let node = Node {
            ip_addr: "10.0.0.1".into(),
            time_ns: 1_400_000_000_000_000_000,
            ..Node::default()
        };
        let frame = encode(&node, &test_mode()).unwrap();
        assert!(frame.len() < SAFE_DATAGRAM_SIZE);
    }
}
