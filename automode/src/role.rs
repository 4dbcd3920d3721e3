/*!
  role ensures the node IAM role backing Auto Mode exists or is removed. The
  role either already belongs to the cluster's own stack (import) or lives in
  a dedicated stack owned by this tool (create/delete); the stack name is a
  pure function of the cluster name.
!*/

use std::collections::BTreeMap;

use models::cluster::ComputeConfig;
use models::constants;
use models::stack::{
    error::Error as StackError, NodeRoleResourceSetBuilder, Stack, StackClient, TemplateBody,
};
use snafu::{OptionExt, ResultExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use crate::error::{self, Result};

/// Produces a usable node role ARN for a cluster, creating the underlying
/// infrastructure only if it does not already exist.
pub struct RoleCreator<S, B> {
    stacks: S,
    builder: B,
}

impl<S, B> RoleCreator<S, B>
where
    S: StackClient,
    B: NodeRoleResourceSetBuilder,
{
    pub fn new(stacks: S, builder: B) -> Self {
        RoleCreator { stacks, builder }
    }

    /// Returns the ARN of the Auto Mode node role for `cluster_name`.
    ///
    /// A role exported by the cluster's own stack is returned immediately
    /// with no side effects. Otherwise a dedicated role stack is submitted
    /// for creation and this method blocks until the terminal result is
    /// delivered or `cancel` fires, whichever comes first. A cancelled wait
    /// returns an error and leaves the creation in flight; retry policy
    /// belongs to the caller.
    #[instrument(skip(self, cancel), err)]
    pub async fn create_or_import(
        &self,
        cluster_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let cluster_stack = self
            .stacks
            .get_cluster_stack_if_exists()
            .await
            .context(error::GetClusterStackSnafu)?;
        if let Some(stack) = cluster_stack {
            if let Some(role_arn) = node_role_output(&stack) {
                event!(
                    Level::INFO,
                    %role_arn,
                    "reusing node role exported by the cluster stack"
                );
                return Ok(role_arn);
            }
        }

        let stack_name = constants::node_role_stack_name(cluster_name);
        let mut resource_set = self.builder.node_role_resource_set(cluster_name);
        let template = TemplateBody(
            resource_set
                .render_json()
                .context(error::RenderNodeRoleTemplateSnafu)?,
        );

        event!(Level::INFO, stack = %stack_name, "creating node role stack");
        let (sender, receiver) = oneshot::channel();
        self.stacks
            .create_stack(
                &stack_name,
                template,
                resource_set.with_iam(),
                &BTreeMap::new(),
                &BTreeMap::new(),
                sender,
            )
            .await
            .context(error::SubmitCreateStackSnafu)?;

        let result = tokio::select! {
            result = receiver => result,
            () = cancel.cancelled() => return error::CancelledSnafu { stack_name }.fail(),
        };
        let stack = match result {
            Ok(outcome) => outcome.context(error::StackCreationFailedSnafu {
                stack_name: stack_name.as_str(),
            })?,
            Err(_) => return error::CreateResultChannelClosedSnafu { stack_name }.fail(),
        };

        // The delivered stack state hydrates the in-memory resource set; the
        // ARN is read back from it rather than by re-querying the stack.
        resource_set
            .collect_outputs(&stack)
            .context(error::CollectStackOutputsSnafu {
                stack_name: stack_name.as_str(),
            })?;
        resource_set
            .role_arn()
            .context(error::MissingRoleArnOutputSnafu { stack_name })
    }
}

/// Removes the dedicated Auto Mode role stack for a cluster if the feature
/// was enabled and the stack exists; a safe no-op otherwise.
pub struct RoleDeleter<S> {
    stacks: S,
    cluster_name: String,
    compute_config: Option<ComputeConfig>,
}

impl<S: StackClient> RoleDeleter<S> {
    pub fn new(stacks: S, cluster_name: &str, compute_config: Option<ComputeConfig>) -> Self {
        RoleDeleter {
            stacks,
            cluster_name: cluster_name.to_string(),
            compute_config,
        }
    }

    /// Deletes the dedicated role stack, treating an already-absent stack as
    /// success. Clusters without Auto Mode enabled are skipped without any
    /// API call. Never retries; describing and deleting failures are
    /// reported separately so callers can decide on a retry policy.
    #[instrument(skip(self), err)]
    pub async fn delete_if_required(&self) -> Result<()> {
        if !self
            .compute_config
            .as_ref()
            .map_or(false, |compute| compute.enabled)
        {
            event!(
                Level::DEBUG,
                "Auto Mode is not enabled; no node role stack to delete"
            );
            return Ok(());
        }
        let stack_name = constants::node_role_stack_name(&self.cluster_name);
        let stack = match self.stacks.describe_stack(&stack_name).await {
            Ok(stack) => stack,
            Err(StackError::StackDoesNotExist { .. }) => {
                event!(Level::DEBUG, stack = %stack_name, "node role stack already absent");
                return Ok(());
            }
            Err(source) => {
                return Err(source).context(error::DescribeStackSnafu { stack_name })
            }
        };
        event!(Level::INFO, stack = %stack_name, "deleting Auto Mode node role stack");
        self.stacks
            .delete_stack_and_wait(&stack)
            .await
            .context(error::DeleteStackSnafu { stack_name })
    }
}

fn node_role_output(stack: &Stack) -> Option<String> {
    stack.outputs().iter().find_map(|output| {
        if output.output_key() == Some(constants::NODE_ROLE_ARN_OUTPUT) {
            output.output_value().map(str::to_string)
        } else {
            None
        }
    })
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::error::Error;
    use models::stack::mock::MockStackClient;
    use models::stack::{
        DateTime, NodeRoleResourceSet, Output, ResourceSet, StackResult, StackStatus,
    };

    const NODE_ROLE_ARN: &str = "arn:aws:iam::111122223333:role/eksctl-cluster-auto-mode-role";

    pub(crate) fn fake_stack(name: &str, outputs: Vec<(&str, &str)>) -> Stack {
        let mut builder = Stack::builder()
            .stack_name(name)
            .creation_time(DateTime::from_secs(0))
            .stack_status(StackStatus::CreateComplete);
        for (key, value) in outputs {
            builder = builder.outputs(
                Output::builder()
                    .output_key(key)
                    .output_value(value)
                    .build(),
            );
        }
        builder.build().unwrap()
    }

    struct FakeNodeRoleResourceSet {
        role_arn: Option<String>,
    }

    impl ResourceSet for FakeNodeRoleResourceSet {
        fn render_json(&self) -> StackResult<String> {
            Ok(r#"{"Resources":{"NodeRole":{"Type":"AWS::IAM::Role"}}}"#.to_string())
        }

        fn with_iam(&self) -> bool {
            true
        }

        fn collect_outputs(&mut self, stack: &Stack) -> StackResult<()> {
            self.role_arn = node_role_output(stack);
            Ok(())
        }
    }

    impl NodeRoleResourceSet for FakeNodeRoleResourceSet {
        fn role_arn(&self) -> Option<String> {
            self.role_arn.clone()
        }
    }

    pub(crate) struct FakeBuilder;

    impl NodeRoleResourceSetBuilder for FakeBuilder {
        fn node_role_resource_set(&self, _cluster_name: &str) -> Box<dyn NodeRoleResourceSet> {
            Box::new(FakeNodeRoleResourceSet { role_arn: None })
        }
    }

    fn enabled_compute_config() -> ComputeConfig {
        ComputeConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_import_over_create() {
        let mut stacks = MockStackClient::new();
        stacks
            .expect_get_cluster_stack_if_exists()
            .times(1)
            .returning(|| {
                Ok(Some(fake_stack(
                    "eksctl-cluster-cluster",
                    vec![(constants::NODE_ROLE_ARN_OUTPUT, NODE_ROLE_ARN)],
                )))
            });
        stacks.expect_create_stack().times(0);

        let creator = RoleCreator::new(stacks, FakeBuilder);
        let cancel = CancellationToken::new();
        let role_arn = creator.create_or_import("cluster", &cancel).await.unwrap();
        assert_eq!(role_arn, NODE_ROLE_ARN);
    }

    #[tokio::test]
    async fn test_create_when_no_importable_role() {
        let mut stacks = MockStackClient::new();
        stacks
            .expect_get_cluster_stack_if_exists()
            .times(1)
            .returning(|| Ok(None));
        stacks
            .expect_create_stack()
            .times(1)
            .withf(|name, _template, with_iam, _tags, _parameters, _sender| {
                name == "eksctl-cluster-auto-mode-role" && *with_iam
            })
            .returning(|name, _template, _with_iam, _tags, _parameters, sender| {
                let _ = sender.send(Ok(fake_stack(
                    name,
                    vec![(constants::NODE_ROLE_ARN_OUTPUT, NODE_ROLE_ARN)],
                )));
                Ok(())
            });

        let creator = RoleCreator::new(stacks, FakeBuilder);
        let cancel = CancellationToken::new();
        let role_arn = creator.create_or_import("cluster", &cancel).await.unwrap();
        assert_eq!(role_arn, NODE_ROLE_ARN);
    }

    #[tokio::test]
    async fn test_create_reports_stack_failure() {
        let mut stacks = MockStackClient::new();
        stacks
            .expect_get_cluster_stack_if_exists()
            .returning(|| Ok(None));
        stacks
            .expect_create_stack()
            .times(1)
            .returning(|name, _template, _with_iam, _tags, _parameters, sender| {
                let _ = sender.send(Err(StackError::UnexpectedStackStatus {
                    name: name.to_string(),
                    status: "ROLLBACK_COMPLETE".to_string(),
                }));
                Ok(())
            });

        let creator = RoleCreator::new(stacks, FakeBuilder);
        let cancel = CancellationToken::new();
        let err = creator
            .create_or_import("cluster", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StackCreationFailed { .. }));
    }

    #[tokio::test]
    async fn test_create_missing_role_arn_output() {
        let mut stacks = MockStackClient::new();
        stacks
            .expect_get_cluster_stack_if_exists()
            .returning(|| Ok(None));
        stacks
            .expect_create_stack()
            .times(1)
            .returning(|name, _template, _with_iam, _tags, _parameters, sender| {
                let _ = sender.send(Ok(fake_stack(name, vec![])));
                Ok(())
            });

        let creator = RoleCreator::new(stacks, FakeBuilder);
        let cancel = CancellationToken::new();
        let err = creator
            .create_or_import("cluster", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingRoleArnOutput { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_completion() {
        let mut stacks = MockStackClient::new();
        stacks
            .expect_get_cluster_stack_if_exists()
            .returning(|| Ok(None));
        stacks
            .expect_create_stack()
            .times(1)
            .returning(|_name, _template, _with_iam, _tags, _parameters, sender| {
                // Keep the channel open so only cancellation can resolve the
                // wait.
                std::mem::forget(sender);
                Ok(())
            });

        let creator = RoleCreator::new(stacks, FakeBuilder);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = creator
            .create_or_import("cluster", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_delete_skipped_when_auto_mode_disabled() {
        let mut stacks = MockStackClient::new();
        stacks.expect_describe_stack().times(0);
        stacks.expect_delete_stack_and_wait().times(0);

        let deleter = RoleDeleter::new(stacks, "cluster", None);
        deleter.delete_if_required().await.unwrap();

        let mut stacks = MockStackClient::new();
        stacks.expect_describe_stack().times(0);
        stacks.expect_delete_stack_and_wait().times(0);
        let deleter = RoleDeleter::new(
            stacks,
            "cluster",
            Some(ComputeConfig {
                enabled: false,
                ..Default::default()
            }),
        );
        deleter.delete_if_required().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_tolerates_absent_stack() {
        let mut stacks = MockStackClient::new();
        stacks
            .expect_describe_stack()
            .times(1)
            .withf(|name| name == "eksctl-cluster-auto-mode-role")
            .returning(|name| {
                Err(StackError::StackDoesNotExist {
                    name: name.to_string(),
                })
            });
        stacks.expect_delete_stack_and_wait().times(0);

        let deleter = RoleDeleter::new(stacks, "cluster", Some(enabled_compute_config()));
        deleter.delete_if_required().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_found_stack() {
        let mut stacks = MockStackClient::new();
        stacks
            .expect_describe_stack()
            .times(1)
            .returning(|name| Ok(fake_stack(name, vec![])));
        stacks
            .expect_delete_stack_and_wait()
            .times(1)
            .withf(|stack| stack.stack_name() == "eksctl-cluster-auto-mode-role")
            .returning(|_stack| Ok(()));

        let deleter = RoleDeleter::new(stacks, "cluster", Some(enabled_compute_config()));
        deleter.delete_if_required().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_wraps_describe_and_delete_failures() {
        let mut stacks = MockStackClient::new();
        stacks.expect_describe_stack().times(1).returning(|name| {
            Err(StackError::DescribeStacks {
                name: name.to_string(),
                source: "throttled".into(),
            })
        });
        let deleter = RoleDeleter::new(stacks, "cluster", Some(enabled_compute_config()));
        let err = deleter.delete_if_required().await.unwrap_err();
        assert!(matches!(err, Error::DescribeStack { .. }));

        let mut stacks = MockStackClient::new();
        stacks
            .expect_describe_stack()
            .returning(|name| Ok(fake_stack(name, vec![])));
        stacks
            .expect_delete_stack_and_wait()
            .times(1)
            .returning(|stack| {
                Err(StackError::DeleteStack {
                    name: stack.stack_name().to_string(),
                    source: "delete failed".into(),
                })
            });
        let deleter = RoleDeleter::new(stacks, "cluster", Some(enabled_compute_config()));
        let err = deleter.delete_if_required().await.unwrap_err();
        assert!(matches!(err, Error::DeleteStack { .. }));
    }
}
