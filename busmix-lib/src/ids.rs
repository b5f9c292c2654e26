//! Strongly typed identifiers for graph nodes, connections and devices.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $raw:ty, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $raw);

        impl $name {
            pub fn raw(self) -> $raw {
                self.0
            }
        }

        impl From<$raw> for $name {
            fn from(value: $raw) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Authored bus, as registered with the graph.
    BusId, u32, "bus"
);
id_type!(
    /// Runtime bus node (one authored bus instance or a device mix bus).
    BusNodeId, u32, "busnode"
);
id_type!(VoiceId, u32, "voice");
id_type!(ConnectionId, u32, "conn");
id_type!(DeviceId, u32, "device");
id_type!(
    /// Output shareset; several devices may share one when their listeners differ.
    SharesetId, u32, "shareset"
);
id_type!(ListenerId, u64, "listener");
id_type!(GameObjectId, u64, "gameobject");

impl GameObjectId {
    pub const GLOBAL: GameObjectId = GameObjectId(crate::constants::GLOBAL_GAME_OBJECT);
}

/// Any node that may own outgoing connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Voice(VoiceId),
    Bus(BusNodeId),
}

impl NodeId {
    pub fn as_bus(self) -> Option<BusNodeId> {
        match self {
            NodeId::Bus(id) => Some(id),
            NodeId::Voice(_) => None,
        }
    }

    pub fn is_voice(self) -> bool {
        matches!(self, NodeId::Voice(_))
    }
}

impl From<VoiceId> for NodeId {
    fn from(value: VoiceId) -> Self {
        NodeId::Voice(value)
    }
}

impl From<BusNodeId> for NodeId {
    fn from(value: BusNodeId) -> Self {
        NodeId::Bus(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Voice(id) => id.fmt(f),
            NodeId::Bus(id) => id.fmt(f),
        }
    }
}
