use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of a member cluster.
///
/// Connecting -> Connected once a ping and a cache sync succeed; Connected ->
/// Disconnected when a ping or the API fails; Disconnected -> Connecting when a
/// kubeconfig change or a periodic health check retries the connection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConnectionPhase {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionPhase {
    pub const ALL: [Self; 3] = [Self::Connecting, Self::Connected, Self::Disconnected];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == Self::Connected
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}
