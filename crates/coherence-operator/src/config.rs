use std::time::Duration;

/// Runtime settings shared by every component of the controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControllerConfig {
    /// How long safe scaling waits before asking again when the cluster is not Status HA.
    pub status_ha_retry: Duration,

    /// Whether Node metadata may be read. Node-aware rolling upgrades are disabled without it.
    pub node_lookup_enabled: bool,

    /// Never suspend grid services before shutdown.
    pub skip_service_suspend: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            status_ha_retry: Duration::from_secs(60),
            node_lookup_enabled: true,
            skip_service_suspend: false,
        }
    }
}
