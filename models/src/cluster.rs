//! Cluster-level configuration and state types shared by the reconcilers.

use serde::{Deserialize, Serialize};

/// The desired Auto Mode settings for a cluster, as supplied by the user's
/// cluster configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoModeConfig {
    /// Whether Auto Mode should be enabled on the cluster.
    pub enabled: bool,
    /// An externally supplied node role ARN. When unset, a dedicated role is
    /// created (or imported from the cluster stack) on demand.
    #[serde(rename = "nodeRoleARN", skip_serializing_if = "Option::is_none")]
    pub node_role_arn: Option<String>,
    /// The built-in node pools to enable. `None` leaves the choice to the
    /// control plane's defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_pools: Option<Vec<String>>,
}

impl AutoModeConfig {
    pub fn has_node_pools(&self) -> bool {
        self.node_pools.as_ref().map_or(false, |np| !np.is_empty())
    }
}

/// The current compute configuration reported by the cluster control plane.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeConfig {
    pub enabled: bool,
    #[serde(rename = "nodeRoleARN", skip_serializing_if = "Option::is_none")]
    pub node_role_arn: Option<String>,
    #[serde(default)]
    pub node_pools: Vec<String>,
}
