//! Relay of broadcasts from the transport into the local fan-out hub.
//!
//! Workers publish applied updates on the pub/sub transport; every API
//! instance subscribes once and re-publishes each payload into its
//! [`LocalBroadcaster`], where the `WebSocket` handlers pick them up.

use futures::{Stream, StreamExt};
use pixelwar_core::broadcast::LocalBroadcaster;

/// Forward every payload of `stream` to `hub` on `channel` until the stream
/// ends. Returns the number of payloads relayed.
pub async fn relay_broadcasts<S>(stream: S, channel: &str, hub: &LocalBroadcaster) -> u64
where
    S: Stream<Item = Vec<u8>> + Send,
{
    let mut stream = std::pin::pin!(stream);
    let mut relayed: u64 = 0;
    while let Some(payload) = stream.next().await {
        hub.send(channel, payload);
        relayed = relayed.saturating_add(1);
    }
    tracing::info!(channel, relayed, "Broadcast relay ended");
    relayed
}
