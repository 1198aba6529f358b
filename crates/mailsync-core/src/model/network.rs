//! Network connectivity snapshots.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

/// Raw connectivity as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connectivity {
    /// A network is available.
    pub connected: bool,
    /// The network is metered.
    pub metered: bool,
    /// The device is roaming.
    pub roaming: bool,
    /// Identifier of the active network.
    pub active: Option<String>,
}

/// Immutable network snapshot, replaced wholesale on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// A network is available.
    pub connected: bool,
    /// The network may be used for synchronization.
    pub suitable: bool,
    /// The network is unmetered.
    pub unmetered: bool,
    /// The device is roaming.
    pub roaming: bool,
    /// Identifier of the active network.
    pub active: Option<String>,
}

impl NetworkState {
    /// Evaluate suitability of a connectivity report under the configured
    /// metered/roaming policy.
    #[must_use]
    pub fn evaluate(connectivity: Connectivity, config: &EngineConfig) -> Self {
        let suitable = connectivity.connected
            && (!connectivity.metered || config.metered_allowed)
            && (!connectivity.roaming || config.roaming_allowed);
        Self {
            connected: connectivity.connected,
            suitable,
            unmetered: !connectivity.metered,
            roaming: connectivity.roaming,
            active: connectivity.active,
        }
    }

    /// Snapshot with no network.
    #[must_use]
    pub const fn offline() -> Self {
        Self {
            connected: false,
            suitable: false,
            unmetered: false,
            roaming: false,
            active: None,
        }
    }

    /// Whether accounts may connect.
    #[must_use]
    pub const fn is_suitable(&self) -> bool {
        self.connected && self.suitable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wifi() -> Connectivity {
        Connectivity {
            connected: true,
            metered: false,
            roaming: false,
            active: Some("wlan0".into()),
        }
    }

    #[test]
    fn unmetered_network_is_suitable() {
        let state = NetworkState::evaluate(wifi(), &EngineConfig::default());
        assert!(state.is_suitable());
        assert!(state.unmetered);
    }

    #[test]
    fn metered_network_follows_policy() {
        let mut config = EngineConfig::default();
        config.metered_allowed = false;
        let cellular = Connectivity {
            metered: true,
            ..wifi()
        };
        assert!(!NetworkState::evaluate(cellular.clone(), &config).is_suitable());

        config.metered_allowed = true;
        assert!(NetworkState::evaluate(cellular, &config).is_suitable());
    }

    #[test]
    fn roaming_follows_policy() {
        let mut config = EngineConfig::default();
        config.roaming_allowed = false;
        let roaming = Connectivity {
            roaming: true,
            ..wifi()
        };
        assert!(!NetworkState::evaluate(roaming, &config).is_suitable());
    }

    #[test]
    fn offline_is_not_suitable() {
        assert!(!NetworkState::offline().is_suitable());
        let down = Connectivity::default();
        assert!(!NetworkState::evaluate(down, &EngineConfig::default()).is_suitable());
    }
}
