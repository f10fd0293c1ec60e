//! Coalescing fan-out of change notifications.
//!
//! One raw "something changed" channel in, three capacity-1 consumer
//! channels out. A pulse arms a pending bit per consumer; the bit is
//! cleared when the consumer's channel accepts delivery. Bursts collapse:
//! each consumer learns that something changed since it last woke, never
//! how many times, and the producers are never blocked.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub async fn dispatch_loop(
    mut notify: mpsc::Receiver<()>,
    state: mpsc::Sender<()>,
    storage: mpsc::Sender<()>,
    transmit: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let mut pending_state = false;
    let mut pending_storage = false;
    let mut pending_transmit = false;

    loop {
        tokio::select! {
            received = notify.recv() => match received {
                Some(()) => {
                    pending_state = true;
                    pending_storage = true;
                    pending_transmit = true;
                }
                None => return,
            },

            permit = state.reserve(), if pending_state => {
                if let Ok(permit) = permit {
                    permit.send(());
                }
                pending_state = false;
            }

            permit = storage.reserve(), if pending_storage => {
                if let Ok(permit) = permit {
                    permit.send(());
                }
                pending_storage = false;
            }

            permit = transmit.reserve(), if pending_transmit => {
                if let Ok(permit) = permit {
                    permit.send(());
                }
                pending_transmit = false;
            }

            () = cancel.cancelled() => return,
        }
    }
}
