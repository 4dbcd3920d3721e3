/*!
  eks provides the cluster compute-config update surface used when Auto Mode
  is switched on or off. Elastic load balancing and block storage follow the
  compute enablement, matching the control plane's requirements for Auto
  Mode.
!*/

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_eks::types::{
    BlockStorage, ComputeConfigRequest as SdkComputeConfigRequest, ElasticLoadBalancing,
    KubernetesNetworkConfigRequest, StorageConfigRequest, UpdateStatus as SdkUpdateStatus,
};
use snafu::{OptionExt, ResultExt};

/// The module-wide result type.
pub type EksResult<T> = std::result::Result<T, error::Error>;

/// The desired compute configuration for a cluster update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComputeConfigRequest {
    pub enabled: bool,
    pub node_pools: Vec<String>,
    pub node_role_arn: Option<String>,
}

impl ComputeConfigRequest {
    /// The request that switches Auto Mode off.
    pub fn disabled() -> Self {
        ComputeConfigRequest::default()
    }
}

/// An in-flight cluster configuration update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterUpdate {
    pub id: String,
}

/// The state of a cluster configuration update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

#[async_trait]
/// The cluster update operations consumed by the Auto Mode updater. This is
/// provided as a trait in order to allow mocks to be used for testing
/// purposes.
pub trait EksUpdater: Send + Sync {
    /// Submits a compute-config update for the cluster and returns the
    /// update handle to wait on.
    async fn update_compute_config(
        &self,
        cluster_name: &str,
        compute: ComputeConfigRequest,
    ) -> EksResult<ClusterUpdate>;

    /// Reports the current status of an update.
    async fn describe_update(
        &self,
        cluster_name: &str,
        update_id: &str,
    ) -> EksResult<UpdateStatus>;
}

#[derive(Clone)]
/// Concrete implementation of the `EksUpdater` trait backed by the AWS EKS
/// API.
pub struct EksClusterUpdater {
    client: aws_sdk_eks::Client,
}

impl EksClusterUpdater {
    pub fn new(config: &SdkConfig) -> Self {
        EksClusterUpdater {
            client: aws_sdk_eks::Client::new(config),
        }
    }
}

#[async_trait]
impl EksUpdater for EksClusterUpdater {
    async fn update_compute_config(
        &self,
        cluster_name: &str,
        compute: ComputeConfigRequest,
    ) -> EksResult<ClusterUpdate> {
        let enabled = compute.enabled;
        let compute_config = SdkComputeConfigRequest::builder()
            .enabled(enabled)
            .set_node_pools(Some(compute.node_pools))
            .set_node_role_arn(compute.node_role_arn)
            .build();
        let resp = self
            .client
            .update_cluster_config()
            .name(cluster_name)
            .compute_config(compute_config)
            .kubernetes_network_config(
                KubernetesNetworkConfigRequest::builder()
                    .elastic_load_balancing(
                        ElasticLoadBalancing::builder().enabled(enabled).build(),
                    )
                    .build(),
            )
            .storage_config(
                StorageConfigRequest::builder()
                    .block_storage(BlockStorage::builder().enabled(enabled).build())
                    .build(),
            )
            .send()
            .await
            .map_err(crate::boxed)
            .context(error::UpdateClusterConfigSnafu { cluster_name })?;
        let id = resp
            .update()
            .and_then(|update| update.id())
            .map(str::to_string)
            .context(error::MissingUpdateIdSnafu { cluster_name })?;
        Ok(ClusterUpdate { id })
    }

    async fn describe_update(
        &self,
        cluster_name: &str,
        update_id: &str,
    ) -> EksResult<UpdateStatus> {
        let resp = self
            .client
            .describe_update()
            .name(cluster_name)
            .update_id(update_id)
            .send()
            .await
            .map_err(crate::boxed)
            .context(error::DescribeUpdateSnafu {
                cluster_name,
                update_id,
            })?;
        let status = resp
            .update()
            .and_then(|update| update.status())
            .context(error::MissingUpdateStatusSnafu {
                cluster_name,
                update_id,
            })?;
        match status {
            SdkUpdateStatus::InProgress => Ok(UpdateStatus::InProgress),
            SdkUpdateStatus::Successful => Ok(UpdateStatus::Successful),
            SdkUpdateStatus::Failed => Ok(UpdateStatus::Failed),
            SdkUpdateStatus::Cancelled => Ok(UpdateStatus::Cancelled),
            other => error::UnexpectedUpdateStatusSnafu {
                update_id,
                status: other.as_str(),
            }
            .fail(),
        }
    }
}

pub mod error {
    use snafu::Snafu;

    use crate::BoxedError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Unable to update config of cluster '{}': '{}'",
            cluster_name,
            source
        ))]
        UpdateClusterConfig {
            cluster_name: String,
            source: BoxedError,
        },

        #[snafu(display("Cluster '{}' update was accepted without an update id", cluster_name))]
        MissingUpdateId { cluster_name: String },

        #[snafu(display(
            "Unable to describe update '{}' of cluster '{}': '{}'",
            update_id,
            cluster_name,
            source
        ))]
        DescribeUpdate {
            cluster_name: String,
            update_id: String,
            source: BoxedError,
        },

        #[snafu(display(
            "Update '{}' of cluster '{}' has no status",
            update_id,
            cluster_name
        ))]
        MissingUpdateStatus {
            cluster_name: String,
            update_id: String,
        },

        #[snafu(display("Update '{}' reported unknown status '{}'", update_id, status))]
        UnexpectedUpdateStatus { update_id: String, status: String },
    }
}

#[cfg(any(feature = "mockall", test))]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        /// A mock EksUpdater for use in tests.
        pub EksUpdater {}

        #[async_trait]
        impl EksUpdater for EksUpdater {
            async fn update_compute_config(
                &self,
                cluster_name: &str,
                compute: ComputeConfigRequest,
            ) -> EksResult<ClusterUpdate>;
            async fn describe_update(
                &self,
                cluster_name: &str,
                update_id: &str,
            ) -> EksResult<UpdateStatus>;
        }
    }
}
