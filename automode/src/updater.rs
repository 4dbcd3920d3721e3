/*!
  updater drives a cluster between the Auto Mode on and off states: it
  reconciles the cluster role, resolves the node role to use, submits the
  compute-config update and waits for it to land, and tears down IAM
  resources that are no longer needed.
!*/

use std::time::Duration;

use async_trait::async_trait;
use models::cluster::{AutoModeConfig, ComputeConfig};
use models::eks::{ClusterUpdate, ComputeConfigRequest, EksUpdater, UpdateStatus};
use models::iam::RolePolicyClient;
use models::stack::{NodeRoleResourceSetBuilder, StackClient};
use models::BoxedError;
use snafu::ResultExt;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use crate::cluster_role::ClusterRoleManager;
use crate::error::{self, Result};
use crate::role::{RoleCreator, RoleDeleter};

// Karpenter and Auto Mode fight over the same nodes; enabling is refused
// while Karpenter pods are present in one of its usual namespaces.
const KARPENTER_NAMESPACES: &[&str] = &["kube-system", "karpenter"];
const KARPENTER_LABEL_SELECTOR: &str = "app.kubernetes.io/instance=karpenter";

// How often and how long to poll an in-flight cluster update.
const UPDATE_POLL_INTERVAL: Duration = Duration::from_secs(20);
const MAX_UPDATE_POLLS: usize = 90;

#[async_trait]
/// Creates or imports the node IAM role used by Auto Mode.
pub trait NodeRoleCreator: Send + Sync {
    async fn create_or_import(
        &self,
        cluster_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

#[async_trait]
/// Deletes the dedicated node role stack when no longer needed.
pub trait NodeRoleDeleter: Send + Sync {
    async fn delete_if_required(&self) -> Result<()>;
}

#[async_trait]
/// Reconciles the cluster service role for Auto Mode.
pub trait ClusterRoleUpdater: Send + Sync {
    async fn update_role_for_auto_mode(&self) -> Result<()>;
    async fn delete_auto_mode_policies(&self) -> Result<()>;
}

#[async_trait]
/// Drains nodegroups so Auto Mode can take over their workloads.
pub trait NodeGroupDrainer: Send + Sync {
    async fn drain(&self) -> std::result::Result<(), BoxedError>;
}

#[async_trait]
/// Lists pod names matching a label selector in a namespace.
pub trait PodLister: Send + Sync {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> std::result::Result<Vec<String>, BoxedError>;
}

#[async_trait]
impl<S, B> NodeRoleCreator for RoleCreator<S, B>
where
    S: StackClient,
    B: NodeRoleResourceSetBuilder,
{
    async fn create_or_import(
        &self,
        cluster_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        RoleCreator::create_or_import(self, cluster_name, cancel).await
    }
}

#[async_trait]
impl<S: StackClient> NodeRoleDeleter for RoleDeleter<S> {
    async fn delete_if_required(&self) -> Result<()> {
        RoleDeleter::delete_if_required(self).await
    }
}

#[async_trait]
impl<S, I> ClusterRoleUpdater for ClusterRoleManager<S, I>
where
    S: StackClient,
    I: RolePolicyClient,
{
    async fn update_role_for_auto_mode(&self) -> Result<()> {
        ClusterRoleManager::update_role_for_auto_mode(self).await
    }

    async fn delete_auto_mode_policies(&self) -> Result<()> {
        ClusterRoleManager::delete_auto_mode_policies(self).await
    }
}

/// Enables or disables Auto Mode on a cluster.
pub struct Updater<C, D, R, E> {
    role_creator: C,
    role_deleter: D,
    cluster_roles: R,
    eks: E,
    drainer: Option<Box<dyn NodeGroupDrainer>>,
    pods: Option<Box<dyn PodLister>>,
}

impl<C, D, R, E> Updater<C, D, R, E>
where
    C: NodeRoleCreator,
    D: NodeRoleDeleter,
    R: ClusterRoleUpdater,
    E: EksUpdater,
{
    pub fn new(role_creator: C, role_deleter: D, cluster_roles: R, eks: E) -> Self {
        Updater {
            role_creator,
            role_deleter,
            cluster_roles,
            eks,
            drainer: None,
            pods: None,
        }
    }

    /// Drains existing nodegroups after enabling Auto Mode. Also switches on
    /// the Karpenter preflight check.
    pub fn with_drainer(mut self, drainer: Box<dyn NodeGroupDrainer>) -> Self {
        self.drainer = Some(drainer);
        self
    }

    pub fn with_pod_lister(mut self, pods: Box<dyn PodLister>) -> Self {
        self.pods = Some(pods);
        self
    }

    /// Updates the cluster to match the desired Auto Mode settings, given
    /// the compute state currently reported by the control plane.
    #[instrument(skip(self, auto_mode, current_compute, cancel), err)]
    pub async fn update(
        &self,
        cluster_name: &str,
        auto_mode: &AutoModeConfig,
        current_compute: Option<&ComputeConfig>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let currently_enabled = current_compute.map_or(false, |compute| compute.enabled);
        if auto_mode.enabled {
            match current_compute {
                Some(current) if current.enabled => {
                    if let (Some(desired), Some(actual)) = (
                        auto_mode.node_role_arn.as_deref(),
                        current.node_role_arn.as_deref(),
                    ) {
                        if desired != actual {
                            return error::NodeRoleModifiedSnafu.fail();
                        }
                    }
                    if node_pools_match(auto_mode, current) {
                        event!(Level::INFO, "Auto Mode is already enabled and up-to-date");
                        return Ok(());
                    }
                }
                _ => event!(Level::INFO, "enabling Auto Mode"),
            }
            self.enable_auto_mode(cluster_name, auto_mode, current_compute, cancel)
                .await
                .context(error::EnableAutoModeSnafu)?;
            if auto_mode.has_node_pools() {
                event!(
                    Level::INFO,
                    "cluster subnets will be used for nodes launched by Auto Mode; \
                     create a NodeClass resource to use different subnets"
                );
            }
            event!(Level::INFO, "Auto Mode enabled successfully");
            return Ok(());
        }
        if !currently_enabled {
            event!(Level::INFO, "Auto Mode is already disabled");
            return Ok(());
        }
        self.disable_auto_mode(cluster_name)
            .await
            .context(error::DisableAutoModeSnafu)?;
        event!(Level::INFO, "Auto Mode disabled successfully");
        Ok(())
    }

    async fn enable_auto_mode(
        &self,
        cluster_name: &str,
        auto_mode: &AutoModeConfig,
        current_compute: Option<&ComputeConfig>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.preflight_check().await?;
        self.cluster_roles
            .update_role_for_auto_mode()
            .await
            .context(error::UpdateClusterRoleSnafu)?;

        let mut compute = ComputeConfigRequest {
            enabled: true,
            node_pools: auto_mode.node_pools.clone().unwrap_or_default(),
            node_role_arn: None,
        };
        if !compute.node_pools.is_empty() {
            compute.node_role_arn = if let Some(arn) =
                current_compute.and_then(|current| current.node_role_arn.clone())
            {
                Some(arn)
            } else if let Some(arn) = auto_mode.node_role_arn.clone() {
                Some(arn)
            } else {
                event!(Level::INFO, "creating node role for Auto Mode");
                let arn = self
                    .role_creator
                    .create_or_import(cluster_name, cancel)
                    .await
                    .context(error::CreateNodeRoleSnafu)?;
                Some(arn)
            };
        }
        // A dedicated role becomes unused when the update carries no node
        // role while the cluster previously had one.
        let node_role_unused = compute.node_role_arn.is_none()
            && current_compute.map_or(false, |current| current.node_role_arn.is_some());

        event!(Level::INFO, "updating compute config");
        let update = self
            .eks
            .update_compute_config(cluster_name, compute)
            .await
            .context(error::UpdateComputeConfigSnafu)?;
        self.wait_for_update(cluster_name, &update).await?;

        if node_role_unused {
            self.role_deleter
                .delete_if_required()
                .await
                .context(error::DeleteNodeRoleSnafu)?;
        }
        if let Some(drainer) = &self.drainer {
            drainer.drain().await.context(error::DrainNodeGroupsSnafu)?;
        }
        event!(
            Level::INFO,
            "core networking addons are not required for a cluster using Auto Mode and can now be deleted"
        );
        Ok(())
    }

    async fn disable_auto_mode(&self, cluster_name: &str) -> Result<()> {
        event!(Level::INFO, "disabling Auto Mode");
        event!(Level::INFO, "updating compute config");
        let update = self
            .eks
            .update_compute_config(cluster_name, ComputeConfigRequest::disabled())
            .await
            .context(error::UpdateComputeConfigSnafu)?;
        self.wait_for_update(cluster_name, &update).await?;
        self.role_deleter
            .delete_if_required()
            .await
            .context(error::DeleteNodeRoleSnafu)?;
        self.cluster_roles
            .delete_auto_mode_policies()
            .await
            .context(error::DeleteClusterRolePoliciesSnafu)?;
        Ok(())
    }

    async fn wait_for_update(&self, cluster_name: &str, update: &ClusterUpdate) -> Result<()> {
        let strategy =
            FixedInterval::from_millis(UPDATE_POLL_INTERVAL.as_millis() as u64).take(MAX_UPDATE_POLLS);
        RetryIf::spawn(
            strategy,
            || self.check_update(cluster_name, &update.id),
            RetryWhileInProgress,
        )
        .await
    }

    async fn check_update(&self, cluster_name: &str, update_id: &str) -> Result<()> {
        event!(Level::DEBUG, update = %update_id, "waiting for cluster update to complete");
        let status = self
            .eks
            .describe_update(cluster_name, update_id)
            .await
            .context(error::WaitForClusterUpdateSnafu { update_id })?;
        match status {
            UpdateStatus::Successful => Ok(()),
            UpdateStatus::InProgress => error::ClusterUpdatePendingSnafu { update_id }.fail(),
            UpdateStatus::Failed => error::ClusterUpdateFailedSnafu {
                update_id,
                status: "Failed",
            }
            .fail(),
            UpdateStatus::Cancelled => error::ClusterUpdateFailedSnafu {
                update_id,
                status: "Cancelled",
            }
            .fail(),
        }
    }

    async fn preflight_check(&self) -> Result<()> {
        if self.drainer.is_none() {
            return Ok(());
        }
        let pods = match &self.pods {
            Some(pods) => pods,
            None => return Ok(()),
        };
        for namespace in KARPENTER_NAMESPACES {
            match pods.list_pods(namespace, KARPENTER_LABEL_SELECTOR).await {
                Ok(found) => {
                    if !found.is_empty() {
                        return error::KarpenterInstalledSnafu {
                            namespace: *namespace,
                        }
                        .fail();
                    }
                }
                Err(source) => {
                    event!(
                        Level::WARN,
                        %namespace,
                        error = %source,
                        "error checking for Karpenter pods"
                    );
                }
            }
        }
        Ok(())
    }
}

struct RetryWhileInProgress;

impl tokio_retry::Condition<error::Error> for RetryWhileInProgress {
    fn should_retry(&mut self, error: &error::Error) -> bool {
        matches!(error, error::Error::ClusterUpdatePending { .. })
    }
}

fn node_pools_match(auto_mode: &AutoModeConfig, current: &ComputeConfig) -> bool {
    let desired = auto_mode.node_pools.as_deref().unwrap_or_default();
    desired.len() == current.node_pools.len()
        && desired.iter().all(|pool| current.node_pools.contains(pool))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use mockall::{mock, Sequence};
    use models::eks::mock::MockEksUpdater;

    const NODE_ROLE_ARN: &str = "arn:aws:iam::111122223333:role/eksctl-cluster-auto-mode-role";

    mock! {
        Creator {}

        #[async_trait]
        impl NodeRoleCreator for Creator {
            async fn create_or_import(
                &self,
                cluster_name: &str,
                cancel: &CancellationToken,
            ) -> Result<String>;
        }
    }

    mock! {
        Deleter {}

        #[async_trait]
        impl NodeRoleDeleter for Deleter {
            async fn delete_if_required(&self) -> Result<()>;
        }
    }

    mock! {
        ClusterRoles {}

        #[async_trait]
        impl ClusterRoleUpdater for ClusterRoles {
            async fn update_role_for_auto_mode(&self) -> Result<()>;
            async fn delete_auto_mode_policies(&self) -> Result<()>;
        }
    }

    struct NoopDrainer;

    #[async_trait]
    impl NodeGroupDrainer for NoopDrainer {
        async fn drain(&self) -> std::result::Result<(), BoxedError> {
            Ok(())
        }
    }

    struct StaticPods(Vec<String>);

    #[async_trait]
    impl PodLister for StaticPods {
        async fn list_pods(
            &self,
            _namespace: &str,
            _label_selector: &str,
        ) -> std::result::Result<Vec<String>, BoxedError> {
            Ok(self.0.clone())
        }
    }

    fn quiet_mocks() -> (MockCreator, MockDeleter, MockClusterRoles, MockEksUpdater) {
        let mut creator = MockCreator::new();
        creator.expect_create_or_import().times(0);
        let mut deleter = MockDeleter::new();
        deleter.expect_delete_if_required().times(0);
        let mut cluster_roles = MockClusterRoles::new();
        cluster_roles.expect_update_role_for_auto_mode().times(0);
        cluster_roles.expect_delete_auto_mode_policies().times(0);
        let mut eks = MockEksUpdater::new();
        eks.expect_update_compute_config().times(0);
        eks.expect_describe_update().times(0);
        (creator, deleter, cluster_roles, eks)
    }

    fn enabled_config(node_pools: &[&str]) -> AutoModeConfig {
        AutoModeConfig {
            enabled: true,
            node_role_arn: None,
            node_pools: Some(node_pools.iter().map(|pool| pool.to_string()).collect()),
        }
    }

    #[tokio::test]
    async fn test_noop_when_already_up_to_date() {
        let (creator, deleter, cluster_roles, eks) = quiet_mocks();
        let updater = Updater::new(creator, deleter, cluster_roles, eks);
        let current = ComputeConfig {
            enabled: true,
            node_role_arn: Some(NODE_ROLE_ARN.to_string()),
            node_pools: vec!["general-purpose".to_string()],
        };
        updater
            .update(
                "cluster",
                &enabled_config(&["general-purpose"]),
                Some(&current),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_noop_when_already_disabled() {
        let (creator, deleter, cluster_roles, eks) = quiet_mocks();
        let updater = Updater::new(creator, deleter, cluster_roles, eks);
        updater
            .update(
                "cluster",
                &AutoModeConfig::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_node_role_arn_cannot_be_modified() {
        let (creator, deleter, cluster_roles, eks) = quiet_mocks();
        let updater = Updater::new(creator, deleter, cluster_roles, eks);
        let mut config = enabled_config(&["general-purpose"]);
        config.node_role_arn = Some("arn:aws:iam::111122223333:role/other".to_string());
        let current = ComputeConfig {
            enabled: true,
            node_role_arn: Some(NODE_ROLE_ARN.to_string()),
            node_pools: vec!["general-purpose".to_string()],
        };
        let err = updater
            .update(
                "cluster",
                &config,
                Some(&current),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeRoleModified));
    }

    #[tokio::test]
    async fn test_enable_creates_node_role_and_updates_cluster() {
        let mut creator = MockCreator::new();
        creator
            .expect_create_or_import()
            .times(1)
            .withf(|cluster_name, _cancel| cluster_name == "cluster")
            .returning(|_, _| Ok(NODE_ROLE_ARN.to_string()));
        let mut deleter = MockDeleter::new();
        deleter.expect_delete_if_required().times(0);
        let mut cluster_roles = MockClusterRoles::new();
        cluster_roles
            .expect_update_role_for_auto_mode()
            .times(1)
            .returning(|| Ok(()));
        let mut eks = MockEksUpdater::new();
        eks.expect_update_compute_config()
            .times(1)
            .withf(|cluster_name, compute| {
                cluster_name == "cluster"
                    && compute.enabled
                    && compute.node_pools == vec!["general-purpose".to_string()]
                    && compute.node_role_arn.as_deref() == Some(NODE_ROLE_ARN)
            })
            .returning(|_, _| {
                Ok(ClusterUpdate {
                    id: "update-1".to_string(),
                })
            });
        eks.expect_describe_update()
            .times(1)
            .withf(|_, update_id| update_id == "update-1")
            .returning(|_, _| Ok(UpdateStatus::Successful));

        let updater = Updater::new(creator, deleter, cluster_roles, eks);
        updater
            .update(
                "cluster",
                &enabled_config(&["general-purpose"]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enable_without_node_pools_deletes_unused_role() {
        let mut creator = MockCreator::new();
        creator.expect_create_or_import().times(0);
        let mut deleter = MockDeleter::new();
        deleter
            .expect_delete_if_required()
            .times(1)
            .returning(|| Ok(()));
        let mut cluster_roles = MockClusterRoles::new();
        cluster_roles
            .expect_update_role_for_auto_mode()
            .times(1)
            .returning(|| Ok(()));
        let mut eks = MockEksUpdater::new();
        eks.expect_update_compute_config()
            .times(1)
            .withf(|_, compute| compute.enabled && compute.node_role_arn.is_none())
            .returning(|_, _| {
                Ok(ClusterUpdate {
                    id: "update-2".to_string(),
                })
            });
        eks.expect_describe_update()
            .times(1)
            .returning(|_, _| Ok(UpdateStatus::Successful));

        let updater = Updater::new(creator, deleter, cluster_roles, eks);
        let current = ComputeConfig {
            enabled: true,
            node_role_arn: Some(NODE_ROLE_ARN.to_string()),
            node_pools: vec!["general-purpose".to_string()],
        };
        updater
            .update(
                "cluster",
                &enabled_config(&[]),
                Some(&current),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disable_sequencing() {
        let mut seq = Sequence::new();
        let creator = MockCreator::new();
        let mut eks = MockEksUpdater::new();
        eks.expect_update_compute_config()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, compute| !compute.enabled && compute.node_role_arn.is_none())
            .returning(|_, _| {
                Ok(ClusterUpdate {
                    id: "update-3".to_string(),
                })
            });
        eks.expect_describe_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(UpdateStatus::Successful));
        let mut deleter = MockDeleter::new();
        deleter
            .expect_delete_if_required()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let mut cluster_roles = MockClusterRoles::new();
        cluster_roles
            .expect_delete_auto_mode_policies()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let updater = Updater::new(creator, deleter, cluster_roles, eks);
        let current = ComputeConfig {
            enabled: true,
            node_role_arn: Some(NODE_ROLE_ARN.to_string()),
            node_pools: vec!["general-purpose".to_string()],
        };
        updater
            .update(
                "cluster",
                &AutoModeConfig::default(),
                Some(&current),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_cluster_update_is_an_error() {
        let mut creator = MockCreator::new();
        creator
            .expect_create_or_import()
            .returning(|_, _| Ok(NODE_ROLE_ARN.to_string()));
        let deleter = MockDeleter::new();
        let mut cluster_roles = MockClusterRoles::new();
        cluster_roles
            .expect_update_role_for_auto_mode()
            .returning(|| Ok(()));
        let mut eks = MockEksUpdater::new();
        eks.expect_update_compute_config().returning(|_, _| {
            Ok(ClusterUpdate {
                id: "update-4".to_string(),
            })
        });
        eks.expect_describe_update()
            .times(1)
            .returning(|_, _| Ok(UpdateStatus::Failed));

        let updater = Updater::new(creator, deleter, cluster_roles, eks);
        let err = updater
            .update(
                "cluster",
                &enabled_config(&["general-purpose"]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            Error::EnableAutoMode { source } => {
                assert!(matches!(*source, Error::ClusterUpdateFailed { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_preflight_refuses_to_enable_with_karpenter_installed() {
        let (creator, deleter, cluster_roles, eks) = quiet_mocks();
        let updater = Updater::new(creator, deleter, cluster_roles, eks)
            .with_drainer(Box::new(NoopDrainer))
            .with_pod_lister(Box::new(StaticPods(vec!["karpenter-0".to_string()])));
        let err = updater
            .update(
                "cluster",
                &enabled_config(&["general-purpose"]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            Error::EnableAutoMode { source } => {
                assert!(matches!(*source, Error::KarpenterInstalled { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_node_pools_match_is_order_insensitive() {
        let config = enabled_config(&["general-purpose", "system"]);
        let current = ComputeConfig {
            enabled: true,
            node_role_arn: None,
            node_pools: vec!["system".to_string(), "general-purpose".to_string()],
        };
        assert!(node_pools_match(&config, &current));

        let current = ComputeConfig {
            enabled: true,
            node_role_arn: None,
            node_pools: vec!["system".to_string()],
        };
        assert!(!node_pools_match(&config, &current));
    }
}
