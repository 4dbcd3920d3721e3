/*!
  iam provides the managed-policy and trust-document operations the Auto Mode
  reconcilers apply to a cluster's service role. Listing is exposed one page
  at a time; the reconciler owns the pagination loop.
!*/

use async_trait::async_trait;
use aws_config::SdkConfig;
use snafu::ResultExt;

/// The module-wide result type.
pub type IamResult<T> = std::result::Result<T, error::Error>;

/// One page of attached managed-policy names, together with the marker for
/// the next page when the listing is truncated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachedPoliciesPage {
    pub policy_names: Vec<String>,
    pub marker: Option<String>,
}

#[async_trait]
/// The IAM role-policy operations consumed by the reconcilers. This is
/// provided as a trait in order to allow mocks to be used for testing
/// purposes.
pub trait RolePolicyClient: Send + Sync {
    /// Attaches a managed policy to a role.
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> IamResult<()>;

    /// Detaches a managed policy from a role.
    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> IamResult<()>;

    /// Lists one page of the role's attached managed policies, starting at
    /// `marker` (`None` for the first page).
    async fn list_attached_role_policies(
        &self,
        role_name: &str,
        marker: Option<String>,
    ) -> IamResult<AttachedPoliciesPage>;

    /// Replaces the role's assume-role policy document wholesale.
    async fn update_assume_role_policy(
        &self,
        role_name: &str,
        policy_document: &str,
    ) -> IamResult<()>;
}

#[derive(Clone)]
/// Concrete implementation of the `RolePolicyClient` trait backed by the AWS
/// IAM API.
pub struct IamRolePolicyClient {
    client: aws_sdk_iam::Client,
}

impl IamRolePolicyClient {
    pub fn new(config: &SdkConfig) -> Self {
        IamRolePolicyClient {
            client: aws_sdk_iam::Client::new(config),
        }
    }
}

#[async_trait]
impl RolePolicyClient for IamRolePolicyClient {
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> IamResult<()> {
        self.client
            .attach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(crate::boxed)
            .context(error::AttachRolePolicySnafu {
                role_name,
                policy_arn,
            })?;
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> IamResult<()> {
        self.client
            .detach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(crate::boxed)
            .context(error::DetachRolePolicySnafu {
                role_name,
                policy_arn,
            })?;
        Ok(())
    }

    async fn list_attached_role_policies(
        &self,
        role_name: &str,
        marker: Option<String>,
    ) -> IamResult<AttachedPoliciesPage> {
        let resp = self
            .client
            .list_attached_role_policies()
            .role_name(role_name)
            .set_marker(marker)
            .send()
            .await
            .map_err(crate::boxed)
            .context(error::ListAttachedRolePoliciesSnafu { role_name })?;
        let policy_names = resp
            .attached_policies()
            .iter()
            .filter_map(|policy| policy.policy_name().map(str::to_string))
            .collect();
        let marker = if resp.is_truncated() {
            resp.marker().map(str::to_string)
        } else {
            None
        };
        Ok(AttachedPoliciesPage {
            policy_names,
            marker,
        })
    }

    async fn update_assume_role_policy(
        &self,
        role_name: &str,
        policy_document: &str,
    ) -> IamResult<()> {
        self.client
            .update_assume_role_policy()
            .role_name(role_name)
            .policy_document(policy_document)
            .send()
            .await
            .map_err(crate::boxed)
            .context(error::UpdateAssumeRolePolicySnafu { role_name })?;
        Ok(())
    }
}

pub mod error {
    use snafu::Snafu;

    use crate::BoxedError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Unable to attach policy '{}' to role '{}': '{}'",
            policy_arn,
            role_name,
            source
        ))]
        AttachRolePolicy {
            role_name: String,
            policy_arn: String,
            source: BoxedError,
        },

        #[snafu(display(
            "Unable to detach policy '{}' from role '{}': '{}'",
            policy_arn,
            role_name,
            source
        ))]
        DetachRolePolicy {
            role_name: String,
            policy_arn: String,
            source: BoxedError,
        },

        #[snafu(display(
            "Unable to list policies attached to role '{}': '{}'",
            role_name,
            source
        ))]
        ListAttachedRolePolicies {
            role_name: String,
            source: BoxedError,
        },

        #[snafu(display(
            "Unable to update assume role policy of role '{}': '{}'",
            role_name,
            source
        ))]
        UpdateAssumeRolePolicy {
            role_name: String,
            source: BoxedError,
        },
    }
}

#[cfg(any(feature = "mockall", test))]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        /// A mock RolePolicyClient for use in tests.
        pub RolePolicyClient {}

        #[async_trait]
        impl RolePolicyClient for RolePolicyClient {
            async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> IamResult<()>;
            async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> IamResult<()>;
            async fn list_attached_role_policies(
                &self,
                role_name: &str,
                marker: Option<String>,
            ) -> IamResult<AttachedPoliciesPage>;
            async fn update_assume_role_policy(
                &self,
                role_name: &str,
                policy_document: &str,
            ) -> IamResult<()>;
        }
    }
}
