//! The shared, half-duplex link to the modem.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::address::AddressId;
use crate::error::LinkError;
use crate::message::WireMessage;

/// Outbound side of the modem link.
///
/// The scheduler paces each device by its quiet times but, unless
/// `link_spacing_ms` is set, does not space frames of different devices.
/// An implementation must then hold the link for `msg.quiet_time()` after
/// writing a frame before it writes the next one.
#[async_trait]
pub trait Link: Send + Sync {
    /// Write one frame for `target`. Implementations should not block
    /// forever; the engine also bounds each call with its write timeout.
    async fn send_frame(&self, target: &AddressId, msg: &WireMessage) -> Result<(), LinkError>;
}

/// A frame handed to a [`ChannelLink`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentFrame {
    pub target: AddressId,
    pub msg: WireMessage,
    pub at: Instant,
}

/// Link that forwards every frame into a tokio channel.
///
/// Used by the simulator and tests, or as the hand-off point to a task that
/// owns the real serial port.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<SentFrame>,
}

impl ChannelLink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SentFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Link for ChannelLink {
    async fn send_frame(&self, target: &AddressId, msg: &WireMessage) -> Result<(), LinkError> {
        self.tx
            .send(SentFrame {
                target: *target,
                msg: msg.clone(),
                at: Instant::now(),
            })
            .map_err(|_| LinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::InsteonAddress;

    #[tokio::test]
    async fn test_channel_link_forwards_and_reports_closed() {
        let (link, mut rx) = ChannelLink::new();
        let target = AddressId::insteon(0x11, 0x22, 0x33);
        let msg = WireMessage::direct(InsteonAddress::new(0x11, 0x22, 0x33), 0x19, 0x00);

        link.send_frame(&target, &msg).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.target, target);
        assert_eq!(frame.msg, msg);

        drop(rx);
        assert_eq!(link.send_frame(&target, &msg).await, Err(LinkError::Closed));
    }
}
