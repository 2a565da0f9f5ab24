use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Events published by the header verifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadersEvent {
    /// The locally verified header chain caught up with the network tip.
    Synced,
}

pub type HeadersEventCallback = Box<dyn Fn(HeadersEvent) + Send + Sync>;

/// Verification progress of the header chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadersStatus {
    pub tip_height: u32,
    pub target_height: u32,
}

impl HeadersStatus {
    pub fn synced(&self) -> bool {
        self.tip_height >= self.target_height
    }
}

/// Confirmation-height oracle backed by a locally verified header chain.
///
/// The indexer reports a height with every history entry; this oracle
/// anchors those heights: confirmation counts are computed against
/// [`Headers::tip_height`], and heights beyond the verified tip are treated
/// as unconfirmed until the chain catches up.
pub trait Headers: Send + Sync {
    fn tip_height(&self) -> u32;

    fn status(&self) -> Result<HeadersStatus>;

    fn subscribe_event(&self, callback: HeadersEventCallback);
}
