/*!
  cluster_role reconciles the managed-policy attachments and the assume-role
  policy document of a dedicated cluster service role with the desired Auto
  Mode state. Both directions take a fresh snapshot of the attached policies
  and apply a one-way diff against the configured set, so every call is
  independently idempotent and retry-to-convergence is the recovery strategy
  after a partial failure.
!*/

use models::arn::{policy_arn, Partition};
use models::constants;
use models::iam::RolePolicyClient;
use models::stack::StackClient;
use serde_json::Value;
use snafu::ResultExt;
use tracing::{event, instrument, Level};

use crate::error::{self, Result};

/// Trust policy required on the cluster role while Auto Mode is enabled; the
/// control plane tags the sessions it assumes.
const AUTO_MODE_ASSUME_ROLE_POLICY: &str = r#"{
    "Version": "2012-10-17",
    "Statement": [
        {
            "Effect": "Allow",
            "Principal": {
                "Service": "eks.amazonaws.com"
            },
            "Action": [
                "sts:AssumeRole",
                "sts:TagSession"
            ]
        }
    ]
}"#;

/// The standard EKS cluster role trust policy, restored when Auto Mode is
/// disabled.
const EKS_ASSUME_ROLE_POLICY: &str = r#"{
    "Version": "2012-10-17",
    "Statement": [
        {
            "Effect": "Allow",
            "Principal": {
                "Service": "eks.amazonaws.com"
            },
            "Action": "sts:AssumeRole"
        }
    ]
}"#;

/// Who owns the cluster's service role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleOwnership {
    /// Created by this tool's cluster stack; policy reconciliation applies.
    Dedicated,
    /// Supplied externally; the role is left untouched.
    External,
}

/// Brings a dedicated cluster service role's attached-policy set and trust
/// document into agreement with the desired Auto Mode state.
pub struct ClusterRoleManager<S, I> {
    stacks: S,
    iam: I,
    cluster_name: String,
    cluster_role_name: String,
    partition: Partition,
    policies: Vec<String>,
}

impl<S, I> ClusterRoleManager<S, I>
where
    S: StackClient,
    I: RolePolicyClient,
{
    pub fn new(
        stacks: S,
        iam: I,
        cluster_name: &str,
        cluster_role_name: &str,
        region: &str,
    ) -> Self {
        ClusterRoleManager {
            stacks,
            iam,
            cluster_name: cluster_name.to_string(),
            cluster_role_name: cluster_role_name.to_string(),
            partition: Partition::for_region(region),
            policies: constants::AUTO_MODE_IAM_POLICIES
                .iter()
                .map(|policy| policy.to_string())
                .collect(),
        }
    }

    /// Overrides the managed-policy set reconciled onto the cluster role.
    pub fn with_policies(mut self, policies: Vec<String>) -> Self {
        self.policies = policies;
        self
    }

    /// Attaches every configured managed policy missing from the role, then
    /// switches the trust document to the Auto Mode variant. Attachments are
    /// not rolled back on failure; a retry converges.
    #[instrument(skip(self), err)]
    pub async fn update_role_for_auto_mode(&self) -> Result<()> {
        if let RoleOwnership::External = self.cluster_role_ownership().await? {
            self.warn_external_role();
            return Ok(());
        }
        let attached = self.list_attached_policy_names().await?;
        for policy_name in &self.policies {
            if attached.iter().any(|name| name == policy_name) {
                continue;
            }
            let arn = policy_arn(self.partition, policy_name);
            self.iam
                .attach_role_policy(&self.cluster_role_name, &arn)
                .await
                .context(error::AttachRolePolicySnafu {
                    policy_name: policy_name.as_str(),
                })?;
            event!(
                Level::INFO,
                policy = %policy_name,
                role = %self.cluster_role_name,
                "attached managed policy"
            );
        }
        // The trust document switches last so a failed attachment never
        // leaves it switched early.
        self.set_assume_role_policy(AUTO_MODE_ASSUME_ROLE_POLICY).await
    }

    /// Detaches every configured managed policy present on the role, leaving
    /// unrelated attachments untouched, then restores the standard EKS trust
    /// document.
    #[instrument(skip(self), err)]
    pub async fn delete_auto_mode_policies(&self) -> Result<()> {
        if let RoleOwnership::External = self.cluster_role_ownership().await? {
            self.warn_external_role();
            return Ok(());
        }
        let attached = self.list_attached_policy_names().await?;
        for policy_name in &self.policies {
            if !attached.iter().any(|name| name == policy_name) {
                continue;
            }
            let arn = policy_arn(self.partition, policy_name);
            self.iam
                .detach_role_policy(&self.cluster_role_name, &arn)
                .await
                .context(error::DetachRolePolicySnafu {
                    policy_name: policy_name.as_str(),
                })?;
            event!(
                Level::INFO,
                policy = %policy_name,
                role = %self.cluster_role_name,
                "detached managed policy"
            );
        }
        self.set_assume_role_policy(EKS_ASSUME_ROLE_POLICY).await
    }

    /// Determines whether the cluster's service role was provisioned by this
    /// tool's cluster stack. Derived fresh on every reconciliation; the
    /// manager holds no mutable state.
    async fn cluster_role_ownership(&self) -> Result<RoleOwnership> {
        let stack_name = constants::cluster_stack_name(&self.cluster_name);
        let template = self
            .stacks
            .get_stack_template(&stack_name)
            .await
            .context(error::GetStackTemplateSnafu {
                stack_name: stack_name.as_str(),
            })?;
        let template: Value = serde_json::from_str(&template).context(
            error::ParseStackTemplateSnafu {
                stack_name: stack_name.as_str(),
            },
        )?;
        let dedicated = template
            .get("Resources")
            .and_then(|resources| resources.get(constants::CLUSTER_SERVICE_ROLE_RESOURCE))
            .is_some();
        if dedicated {
            Ok(RoleOwnership::Dedicated)
        } else {
            Ok(RoleOwnership::External)
        }
    }

    async fn list_attached_policy_names(&self) -> Result<Vec<String>> {
        let mut policy_names = Vec::new();
        let mut marker = None;
        loop {
            let page = self
                .iam
                .list_attached_role_policies(&self.cluster_role_name, marker)
                .await
                .context(error::ListAttachedPoliciesSnafu {
                    role_name: self.cluster_role_name.as_str(),
                })?;
            policy_names.extend(page.policy_names);
            marker = page.marker;
            if marker.is_none() {
                break;
            }
        }
        Ok(policy_names)
    }

    async fn set_assume_role_policy(&self, document: &str) -> Result<()> {
        self.iam
            .update_assume_role_policy(&self.cluster_role_name, document)
            .await
            .context(error::UpdateAssumeRolePolicySnafu {
                role_name: self.cluster_role_name.as_str(),
            })?;
        event!(
            Level::INFO,
            role = %self.cluster_role_name,
            "updated assume role policy"
        );
        Ok(())
    }

    fn warn_external_role(&self) {
        event!(
            Level::WARN,
            role = %self.cluster_role_name,
            "cluster role was not created by this tool; skipping policy reconciliation"
        );
    }
}
