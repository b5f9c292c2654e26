//! Error types for the mix graph and output layer (thiserror-based).

use thiserror::Error;

use crate::ids::{BusId, BusNodeId, ConnectionId, DeviceId, NodeId, SharesetId, VoiceId};

/// Failure reported by an output sink.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// The endpoint does not exist or cannot be opened right now.
    #[error("Output endpoint unavailable: {0}")]
    Unavailable(String),

    /// The endpoint was found but could not be initialized.
    #[error("Failed to initialize sink: {0}")]
    Init(String),

    /// The sink stopped working after it was started.
    #[error("Sink runtime failure: {0}")]
    Runtime(String),
}

/// Failure reported while creating or running a plugin.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("Unknown plugin \"{0}\"")]
    UnknownPlugin(String),

    #[error("Plugin \"{plugin}\" does not support {channels} channel(s)")]
    UnsupportedChannels { plugin: String, channels: u16 },

    #[error("Invalid parameters for plugin \"{plugin}\": {reason}")]
    InvalidParams { plugin: String, reason: String },

    #[error("Plugin \"{plugin}\" failed to initialize: {reason}")]
    Init { plugin: String, reason: String },
}

/// Failure reported by a device capture target.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Capture target closed")]
    Closed,

    #[error("Capture write failed: {0}")]
    Write(String),
}

/// Mix core error type.
#[derive(Error, Debug)]
pub enum MixError {
    #[error("Unknown voice {0}")]
    UnknownVoice(VoiceId),

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Unknown bus node {0}")]
    UnknownBusNode(BusNodeId),

    #[error("Unknown authored bus {0}")]
    UnknownBus(BusId),

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    /// Two devices on one shareset must route disjoint listener sets.
    #[error("Device on {0} does not have a distinct listener set")]
    NoDistinctListener(SharesetId),

    #[error("The main device cannot be removed")]
    MainDeviceRemoval,

    #[error("The main device is already initialized")]
    MainDeviceAlreadyInitialized,

    #[error("No main device has been initialized")]
    NoMainDevice,

    #[error("Invalid channel configuration: {0}")]
    InvalidChannelConfig(String),

    /// Routing `from -> to` would close a loop outside of a feedback send.
    #[error("Routing {from} -> {to} would create a cycle")]
    RoutingCycle { from: NodeId, to: NodeId },

    #[error("Out of memory while allocating {0}")]
    OutOfMemory(&'static str),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Topology invariant violated: {0}")]
    Topology(String),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MixError>;

/// Reserve room for `additional` elements, mapping failure to [`MixError::OutOfMemory`].
pub(crate) fn try_reserve<T>(vec: &mut Vec<T>, additional: usize, what: &'static str) -> Result<()> {
    vec.try_reserve_exact(additional)
        .map_err(|_| MixError::OutOfMemory(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_errors_convert_into_mix_errors() {
        let err: MixError = SinkError::Unavailable("hdmi".into()).into();
        assert!(matches!(err, MixError::Sink(SinkError::Unavailable(_))));
        assert_eq!(err.to_string(), "Output endpoint unavailable: hdmi");
    }

    #[test]
    fn plugin_error_messages_name_the_plugin() {
        let err = PluginError::UnsupportedChannels {
            plugin: "fold".into(),
            channels: 0,
        };
        assert_eq!(err.to_string(), "Plugin \"fold\" does not support 0 channel(s)");
    }

    #[test]
    fn try_reserve_reports_out_of_memory() {
        let mut values: Vec<u64> = Vec::new();
        let err = try_reserve(&mut values, usize::MAX, "test vector").unwrap_err();
        assert!(matches!(err, MixError::OutOfMemory("test vector")));
        assert!(try_reserve(&mut values, 4, "test vector").is_ok());
    }
}
