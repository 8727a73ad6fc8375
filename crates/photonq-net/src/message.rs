//! Classical message model.
//!
//! Every classical payload the control plane exchanges is a variant of one
//! closed enum. Messages are addressed either to a named protocol instance,
//! to a node-level manager, or to every generation protocol on the node
//! (the BSM herald broadcast, which end protocols filter by source and
//! expected detection time).

use crate::generation::GenerationMessage;
use crate::network::ReservationMessage;
use crate::purification::PurificationMessage;
use crate::qkd::{Bb84Message, CascadeMessage};
use crate::resource::ResourceManagerMessage;
use crate::swapping::SwappingMessage;

/// Destination of a classical message within the receiving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageReceiver {
    /// A named protocol instance.
    Protocol(String),
    /// The node's resource manager.
    ResourceManager,
    /// The node's network manager.
    NetworkManager,
    /// Every generation-A protocol on the node.
    GenerationBroadcast,
}

/// Typed message payload.
#[derive(Debug, Clone)]
pub enum MessageBody {
    /// Entanglement generation handshake and herald reports.
    Generation(GenerationMessage),
    /// BBPSSW purification outcome exchange.
    Purification(PurificationMessage),
    /// Swapping results from the A role to the B roles.
    Swapping(SwappingMessage),
    /// Resource manager pairing and release messages.
    ResourceManager(ResourceManagerMessage),
    /// Reservation protocol messages relayed by network managers.
    Reservation(ReservationMessage),
    /// Distributed routing link-state advertisement.
    LinkState {
        /// Advertising node.
        origin: String,
        /// Neighbor name and link length in meters.
        neighbors: Vec<(String, f64)>,
        /// Monotonic sequence number per origin.
        seq: u64,
    },
    /// BB84 sifting messages.
    Bb84(Bb84Message),
    /// Cascade error-correction messages.
    Cascade(CascadeMessage),
}

/// A classical message in flight.
#[derive(Debug, Clone)]
pub struct Message {
    /// In-node destination.
    pub receiver: MessageReceiver,
    /// Payload.
    pub body: MessageBody,
}

impl Message {
    /// Message addressed to a named protocol.
    pub fn to_protocol(name: impl Into<String>, body: MessageBody) -> Self {
        Self {
            receiver: MessageReceiver::Protocol(name.into()),
            body,
        }
    }

    /// Message addressed to the resource manager.
    pub fn to_resource_manager(body: MessageBody) -> Self {
        Self {
            receiver: MessageReceiver::ResourceManager,
            body,
        }
    }

    /// Message addressed to the network manager.
    pub fn to_network_manager(body: MessageBody) -> Self {
        Self {
            receiver: MessageReceiver::NetworkManager,
            body,
        }
    }
}
