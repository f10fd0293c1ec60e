//! cairn-service — the feature-announcement engine.
//!
//! One host runs one [`serve`] call. It holds the authoritative local
//! state, exchanges signed and compressed UDP announcements with peers,
//! uses a shared object store as rendezvous and bootstrap directory, ages
//! out silent peers, and renders the merged view into a filesystem tree
//! that other processes consume.

pub mod dispatch;
pub mod local;
pub mod net;
pub mod remotes;
pub mod service;
pub mod state;
pub mod storage;
pub mod watch;

pub use local::LocalNode;
pub use remotes::RemoteDirectory;
pub use service::{serve, Params, ServeError};
