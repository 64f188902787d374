//! [`BusConnection`] over a tokio channel.
//!
//! Requests leave the loop as [`BusRequest`]s on an unbounded channel; the
//! task on the other end talks to the real bus and feeds replies back
//! through the engine handle.

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{BusConnection, CorrelationId, ObjectAddress};
use crate::error::{Result, TransportError};

/// A call on its way to the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRequest {
    /// Assembly the call is for.
    pub node: String,
    pub object: ObjectAddress,
    pub correlation: CorrelationId,
    pub method: String,
    pub args: Map<String, Value>,
}

/// Sends one node's calls down a shared channel.
#[derive(Debug, Clone)]
pub struct ChannelBus {
    node: String,
    sender: mpsc::UnboundedSender<BusRequest>,
    next_correlation: u64,
}

impl ChannelBus {
    pub fn new(node: impl Into<String>, sender: mpsc::UnboundedSender<BusRequest>) -> Self {
        Self {
            node: node.into(),
            sender,
            next_correlation: 0,
        }
    }
}

impl BusConnection for ChannelBus {
    fn call(
        &mut self,
        object: &ObjectAddress,
        method: &str,
        args: &Map<String, Value>,
    ) -> Result<CorrelationId> {
        self.next_correlation = self.next_correlation.wrapping_add(1);
        let correlation = CorrelationId(self.next_correlation);
        self.sender
            .send(BusRequest {
                node: self.node.clone(),
                object: object.clone(),
                correlation,
                method: method.to_string(),
                args: args.clone(),
            })
            .map_err(|_| TransportError::BusClosed)?;
        Ok(correlation)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_requests_carry_fresh_correlations() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bus = ChannelBus::new("bar", tx);
        let object = ObjectAddress::new("bar/services");

        let first = bus.call(&object, "status", &Map::new()).unwrap();
        let second = bus.call(&object, "start", &Map::new()).unwrap();
        assert_ne!(first, second);

        let request = rx.try_recv().unwrap();
        assert_eq!(request.node, "bar");
        assert_eq!(request.method, "status");
        assert_eq!(request.correlation, first);
    }

    #[test]
    fn test_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut bus = ChannelBus::new("bar", tx);
        let err = bus
            .call(&ObjectAddress::new("bar/services"), "status", &Map::new())
            .unwrap_err();
        assert!(matches!(err, TransportError::BusClosed));
    }
}
