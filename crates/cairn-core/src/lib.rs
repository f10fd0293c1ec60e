//! cairn-core — node records and the announcement packet codec.
//! All other cairn crates depend on this one.

pub mod node;
pub mod packet;

pub use node::{FeatureMap, Node, DEFAULT_PORT};
pub use packet::{PacketError, PacketMode};
