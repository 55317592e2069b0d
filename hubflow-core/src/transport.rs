//! Seam to the broker's wire transport.
//!
//! The AMQP protocol itself lives outside this crate; everything here talks
//! to the broker through [`HubTransport`]'s subscribe/send primitives. A
//! transport implementation that needs authorization headers obtains them
//! from the owning hub's [`crate::auth::SasTokenProvider`].

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::Result;
use crate::message::{InboundMessage, OFFSET_ANNOTATION, Offset, OutboundMessage};

pub mod in_memory;

/// Broker-side predicate restricting which messages a subscription delivers.
/// The only selector this runtime emits is "strictly after a stored offset".
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorFilter {
    offset_exclusive: Offset,
}

impl SelectorFilter {
    /// Filter matching only messages positioned strictly after `offset`.
    pub fn after_offset(offset: Offset) -> Self {
        SelectorFilter {
            offset_exclusive: offset,
        }
    }

    pub fn offset(&self) -> &Offset {
        &self.offset_exclusive
    }

    /// Renders the AMQP selector expression understood by the broker.
    pub fn expression(&self) -> String {
        format!(
            "amqp.annotation.{} > '{}'",
            OFFSET_ANNOTATION, self.offset_exclusive
        )
    }
}

/// One partition subscription's delivery stream. Transport-level failures
/// are surfaced per message; the stream ends only when the transport drops
/// the link. Delivery is unbounded: back-pressure is the caller's concern.
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::UnboundedReceiver<Result<InboundMessage>>,
}

impl Subscription {
    /// Creates a subscription together with the sender half a transport
    /// implementation delivers into.
    pub fn channel() -> (mpsc::UnboundedSender<Result<InboundMessage>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Subscription { messages: rx })
    }

    /// Next delivery, `None` once the transport has dropped the link.
    pub async fn next(&mut self) -> Option<Result<InboundMessage>> {
        self.messages.recv().await
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<Result<InboundMessage>> {
        UnboundedReceiverStream::new(self.messages)
    }
}

/// Subscribe/send primitives of the broker transport.
#[trait_variant::make(Send)]
pub trait HubTransport: Clone + Send + Sync + 'static {
    /// Opens a receive link on `source_uri`, optionally restricted by a
    /// broker-side selector filter. Fails with [`crate::Error::Subscribe`]
    /// when the transport rejects the filter or the URI.
    async fn subscribe(
        &self,
        source_uri: &str,
        filter: Option<SelectorFilter>,
    ) -> Result<Subscription>;

    /// Writes one message to `address` (a partition address or the
    /// hub-level address for server-side keyed routing).
    async fn send(&self, address: &str, message: OutboundMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_expression() {
        let filter = SelectorFilter::after_offset(Offset::from("1234"));
        assert_eq!(
            filter.expression(),
            "amqp.annotation.x-opt-offset > '1234'"
        );
    }
}
