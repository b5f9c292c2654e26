//! Mix graph: connections, mixables, bus nodes and HDR.

mod bus;
mod connection;
mod context;
mod hdr;
mod inputs;
mod mix_graph;
mod mixable;
mod order;
mod voice;

pub use bus::{BusNode, NodeState};
pub use connection::{ray_gain_for, Connection, ConnectionType, RouteOrigin};
pub use context::BusContext;
pub use hdr::HdrState;
pub use inputs::InputList;
pub use mix_graph::{GraphStats, MixGraph};
pub use mixable::{merge_route, Mixable, Route};
pub use voice::VoiceNode;
