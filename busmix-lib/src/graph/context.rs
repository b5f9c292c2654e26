//! Addresses of mix destinations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{BusId, DeviceId, GameObjectId};

/// Identifies a destination bus without owning it.
///
/// Either one instance of an authored bus (scoped to the game object that
/// owns it) or the anonymous mix bus of an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusContext {
    Bus {
        bus: BusId,
        #[serde(default = "global_object")]
        game_object: GameObjectId,
    },
    Device {
        device: DeviceId,
    },
}

fn global_object() -> GameObjectId {
    GameObjectId::GLOBAL
}

impl BusContext {
    pub fn bus(bus: BusId, game_object: GameObjectId) -> Self {
        BusContext::Bus { bus, game_object }
    }

    /// Instance of an authored bus not tied to any game object.
    pub fn global(bus: BusId) -> Self {
        BusContext::Bus {
            bus,
            game_object: GameObjectId::GLOBAL,
        }
    }

    pub fn device(device: DeviceId) -> Self {
        BusContext::Device { device }
    }

    pub fn bus_id(&self) -> Option<BusId> {
        match self {
            BusContext::Bus { bus, .. } => Some(*bus),
            BusContext::Device { .. } => None,
        }
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            BusContext::Device { device } => Some(*device),
            BusContext::Bus { .. } => None,
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, BusContext::Device { .. })
    }
}

impl fmt::Display for BusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusContext::Bus { bus, game_object } => write!(f, "{bus}@{game_object}"),
            BusContext::Device { device } => write!(f, "{device}/mix"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn contexts_compare_structurally() {
        let a = BusContext::bus(BusId(1), GameObjectId(7));
        let b = BusContext::bus(BusId(1), GameObjectId(7));
        let c = BusContext::global(BusId(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a, b, c, BusContext::device(DeviceId(1))].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn contexts_deserialize_with_global_default() {
        let ctx: BusContext =
            serde_json::from_str(r#"{"type":"bus","bus":3}"#).expect("deserialize context");
        assert_eq!(ctx, BusContext::global(BusId(3)));
        let ctx: BusContext =
            serde_json::from_str(r#"{"type":"device","device":2}"#).expect("deserialize context");
        assert_eq!(ctx.device_id(), Some(DeviceId(2)));
    }
}
