//! Configuration distribution: the embedded server and the engine's own
//! subscriber, connected in-process over channels.

pub mod server;
pub mod subscriber;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use server::{DistributionServer, Snapshot, SubscriberStatus};
pub use subscriber::ConfigSubscriber;

const STREAM_BUFFER: usize = 16;

/// Attach `subscriber` to `server` over in-process channels.
pub fn spawn_local(
    server: Arc<DistributionServer>,
    subscriber: ConfigSubscriber,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let (req_tx, req_rx) = mpsc::channel(STREAM_BUFFER);
    let (resp_tx, resp_rx) = mpsc::channel(STREAM_BUFFER);

    tokio::spawn(async move {
        let serve = server.serve_stream(req_rx, resp_tx);
        let client = subscriber.run(req_tx, resp_rx, cancel);
        let (_, result) = tokio::join!(serve, client);
        if let Err(e) = result {
            tracing::error!(error = %e, "local subscriber failed");
        }
    })
}
