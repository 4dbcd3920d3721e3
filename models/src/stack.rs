/*!
  stack provides the CloudFormation-facing surface used by the Auto Mode
  reconcilers: stack creation with an asynchronous completion channel,
  describe/delete with a distinguished "does not exist" error kind, and
  template retrieval for ownership checks.
!*/

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_cloudformation::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_cloudformation::types::{Capability, Parameter, Tag};
use snafu::{OptionExt, ResultExt};
use tokio::sync::oneshot;
use tokio_retry::RetryIf;
use tracing::{event, Level};

use crate::constants;

pub use aws_sdk_cloudformation::primitives::DateTime;
pub use aws_sdk_cloudformation::types::{Output, StackStatus};

/// A deployed CloudFormation stack, in the SDK's own representation.
pub type Stack = aws_sdk_cloudformation::types::Stack;

/// The module-wide result type.
pub type StackResult<T> = std::result::Result<T, error::Error>;

/// Channel on which the terminal result of an asynchronous stack creation is
/// delivered. A successful send carries the final described stack, outputs
/// included.
pub type CreateStackSender = oneshot::Sender<StackResult<Stack>>;

/// Rendered CloudFormation template JSON.
#[derive(Clone, Debug)]
pub struct TemplateBody(pub String);

// Polling cadence while waiting on stack transitions: 30s for the first two
// attempts, 1m afterwards, bounded by an overall budget of ~25 minutes.
const INITIAL_POLL_INTERVAL: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(60);
const INITIAL_POLL_COUNT: usize = 2;
const MAX_POLL_COUNT: usize = 24;

/// A buildable set of CloudFormation resources. Rendering the template JSON
/// and the meaning of its resources belong to the implementor; this crate
/// only moves the rendered body to the stack API and feeds stack outputs
/// back after deployment.
pub trait ResourceSet: Send + Sync {
    /// Renders the CloudFormation template body.
    fn render_json(&self) -> StackResult<String>;
    /// Whether deploying this resource set requires IAM capabilities.
    fn with_iam(&self) -> bool;
    /// Hydrates the resource set from the outputs of the deployed stack.
    fn collect_outputs(&mut self, stack: &Stack) -> StackResult<()>;
}

/// A resource set that provisions a node IAM role and exposes its ARN once
/// outputs have been collected.
pub trait NodeRoleResourceSet: ResourceSet {
    /// The provisioned role's ARN. `None` until outputs are collected.
    fn role_arn(&self) -> Option<String>;
}

/// Constructs the resource set backing a cluster's dedicated Auto Mode node
/// role stack.
pub trait NodeRoleResourceSetBuilder: Send + Sync {
    fn node_role_resource_set(&self, cluster_name: &str) -> Box<dyn NodeRoleResourceSet>;
}

#[async_trait]
/// The stack lifecycle operations consumed by the reconcilers. This is
/// provided as a trait in order to allow mocks to be used for testing
/// purposes.
pub trait StackClient: Send + Sync {
    /// Submits a stack creation request and returns as soon as the request is
    /// accepted. The terminal result is delivered on `sender` once the stack
    /// reaches a steady state; expect exactly one value.
    async fn create_stack(
        &self,
        name: &str,
        template: TemplateBody,
        with_iam: bool,
        tags: &BTreeMap<String, String>,
        parameters: &BTreeMap<String, String>,
        sender: CreateStackSender,
    ) -> StackResult<()>;

    /// Describes a stack by name or id. A missing stack is reported as the
    /// distinguished `Error::StackDoesNotExist` kind.
    async fn describe_stack(&self, name: &str) -> StackResult<Stack>;

    /// Deletes a stack and blocks until the deletion reaches a terminal
    /// state. A stack that disappears mid-wait counts as success.
    async fn delete_stack_and_wait(&self, stack: &Stack) -> StackResult<()>;

    /// Returns the cluster's own stack if one exists and is tagged for this
    /// cluster. Absence is not an error.
    async fn get_cluster_stack_if_exists(&self) -> StackResult<Option<Stack>>;

    /// Fetches the current template body of a stack.
    async fn get_stack_template(&self, stack_name: &str) -> StackResult<String>;
}

#[derive(Clone)]
/// Concrete implementation of the `StackClient` trait backed by the AWS
/// CloudFormation API. This implementation will almost certainly be used in
/// any case that isn't a unit test.
pub struct CloudFormationStackClient {
    client: aws_sdk_cloudformation::Client,
    cluster_name: String,
}

impl CloudFormationStackClient {
    pub fn new(config: &SdkConfig, cluster_name: &str) -> Self {
        CloudFormationStackClient {
            client: aws_sdk_cloudformation::Client::new(config),
            cluster_name: cluster_name.to_string(),
        }
    }

    fn shared_tags(&self) -> StackResult<Vec<Tag>> {
        let mut tags = Vec::new();
        for (key, value) in [
            (constants::CLUSTER_NAME_TAG, self.cluster_name.as_str()),
            (constants::EKSCTL_VERSION_TAG, env!("CARGO_PKG_VERSION")),
        ] {
            tags.push(
                Tag::builder()
                    .key(key)
                    .value(value)
                    .build()
                    .map_err(crate::boxed)
                    .context(error::BuildTagSnafu { key })?,
            );
        }
        Ok(tags)
    }

    async fn describe_by_identifier(&self, identifier: &str) -> StackResult<Stack> {
        let resp = match self
            .client
            .describe_stacks()
            .stack_name(identifier)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                if is_stack_does_not_exist_error(&err) {
                    return error::StackDoesNotExistSnafu { name: identifier }.fail();
                }
                return Err(crate::boxed(err))
                    .context(error::DescribeStacksSnafu { name: identifier });
            }
        };
        resp.stacks()
            .first()
            .cloned()
            .context(error::StackDoesNotExistSnafu { name: identifier })
    }

    async fn check_stack_created(&self, identifier: &str, name: &str) -> StackResult<Stack> {
        let stack = self.describe_by_identifier(identifier).await?;
        match stack.stack_status() {
            StackStatus::CreateComplete => Ok(stack),
            StackStatus::CreateInProgress => error::StackStatusPendingSnafu {
                name,
                status: StackStatus::CreateInProgress.as_str(),
            }
            .fail(),
            other => error::UnexpectedStackStatusSnafu {
                name,
                status: other.as_str(),
            }
            .fail(),
        }
    }

    async fn check_stack_deleted(&self, identifier: &str, name: &str) -> StackResult<()> {
        let stack = match self.describe_by_identifier(identifier).await {
            Err(error::Error::StackDoesNotExist { .. }) => return Ok(()),
            other => other?,
        };
        match stack.stack_status() {
            StackStatus::DeleteComplete => Ok(()),
            StackStatus::DeleteFailed => error::UnexpectedStackStatusSnafu {
                name,
                status: StackStatus::DeleteFailed.as_str(),
            }
            .fail(),
            other => error::StackStatusPendingSnafu {
                name,
                status: other.as_str(),
            }
            .fail(),
        }
    }
}

#[async_trait]
impl StackClient for CloudFormationStackClient {
    async fn create_stack(
        &self,
        name: &str,
        template: TemplateBody,
        with_iam: bool,
        tags: &BTreeMap<String, String>,
        parameters: &BTreeMap<String, String>,
        sender: CreateStackSender,
    ) -> StackResult<()> {
        let mut stack_tags = self.shared_tags()?;
        for (key, value) in tags {
            stack_tags.push(
                Tag::builder()
                    .key(key.as_str())
                    .value(value.as_str())
                    .build()
                    .map_err(crate::boxed)
                    .context(error::BuildTagSnafu { key: key.as_str() })?,
            );
        }
        let stack_parameters: Vec<Parameter> = parameters
            .iter()
            .map(|(key, value)| {
                Parameter::builder()
                    .parameter_key(key.as_str())
                    .parameter_value(value.as_str())
                    .build()
            })
            .collect();

        let mut request = self
            .client
            .create_stack()
            .stack_name(name)
            .template_body(template.0)
            .set_tags(Some(stack_tags))
            .set_parameters(Some(stack_parameters));
        if with_iam {
            request = request.capabilities(Capability::CapabilityIam);
        }

        let resp = request
            .send()
            .await
            .map_err(crate::boxed)
            .context(error::CreateStackSnafu { name })?;
        event!(Level::INFO, stack = %name, "deploying stack");

        // Deleted or failed stacks remain describable by id, so prefer it
        // over the name for the whole wait.
        let identifier = resp
            .stack_id()
            .map(str::to_string)
            .unwrap_or_else(|| name.to_string());
        let client = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let result = RetryIf::spawn(
                wait_intervals(),
                || client.check_stack_created(&identifier, &name),
                retry_pending,
            )
            .await;
            // The receiver may already be gone if the caller was cancelled.
            let _ = sender.send(result);
        });
        Ok(())
    }

    async fn describe_stack(&self, name: &str) -> StackResult<Stack> {
        self.describe_by_identifier(name).await
    }

    async fn delete_stack_and_wait(&self, stack: &Stack) -> StackResult<()> {
        let name = stack.stack_name().to_string();
        let identifier = stack
            .stack_id()
            .map(str::to_string)
            .unwrap_or_else(|| name.clone());
        self.client
            .delete_stack()
            .stack_name(&identifier)
            .send()
            .await
            .map_err(crate::boxed)
            .context(error::DeleteStackSnafu { name: name.as_str() })?;
        event!(Level::INFO, stack = %name, "deleting stack");
        RetryIf::spawn(
            wait_intervals(),
            || self.check_stack_deleted(&identifier, &name),
            retry_pending,
        )
        .await
    }

    async fn get_cluster_stack_if_exists(&self) -> StackResult<Option<Stack>> {
        let stack_name = constants::cluster_stack_name(&self.cluster_name);
        let stack = match self.describe_by_identifier(&stack_name).await {
            Ok(stack) => stack,
            Err(error::Error::StackDoesNotExist { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !matches_cluster(&stack, &self.cluster_name) {
            return Ok(None);
        }
        Ok(Some(stack))
    }

    async fn get_stack_template(&self, stack_name: &str) -> StackResult<String> {
        let resp = self
            .client
            .get_template()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(crate::boxed)
            .context(error::GetTemplateSnafu { name: stack_name })?;
        resp.template_body()
            .map(str::to_string)
            .context(error::MissingTemplateBodySnafu { name: stack_name })
    }
}

fn wait_intervals() -> impl Iterator<Item = Duration> {
    std::iter::repeat(INITIAL_POLL_INTERVAL)
        .take(INITIAL_POLL_COUNT)
        .chain(std::iter::repeat(POLL_INTERVAL).take(MAX_POLL_COUNT))
}

fn retry_pending(err: &error::Error) -> bool {
    matches!(err, error::Error::StackStatusPending { .. })
}

fn matches_cluster(stack: &Stack, cluster_name: &str) -> bool {
    stack.tags().iter().any(|tag| {
        tag.key() == constants::CLUSTER_NAME_TAG && tag.value() == cluster_name
    })
}

fn is_stack_does_not_exist_error<E, R>(err: &SdkError<E, R>) -> bool
where
    SdkError<E, R>: ProvideErrorMetadata,
{
    // CloudFormation reports a missing stack as a ValidationError rather
    // than a modeled error type.
    err.code() == Some("ValidationError")
        && err.message().map_or(false, |msg| msg.contains("does not exist"))
}

pub mod error {
    use snafu::Snafu;

    use crate::BoxedError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to build stack tag '{}': '{}'", key, source))]
        BuildTag { key: String, source: BoxedError },

        #[snafu(display("Unable to create CloudFormation stack '{}': '{}'", name, source))]
        CreateStack { name: String, source: BoxedError },

        #[snafu(display("Unable to describe CloudFormation stack '{}': '{}'", name, source))]
        DescribeStacks { name: String, source: BoxedError },

        #[snafu(display("CloudFormation stack '{}' does not exist", name))]
        StackDoesNotExist { name: String },

        #[snafu(display("Unable to delete CloudFormation stack '{}': '{}'", name, source))]
        DeleteStack { name: String, source: BoxedError },

        #[snafu(display("Unable to get template for stack '{}': '{}'", name, source))]
        GetTemplate { name: String, source: BoxedError },

        #[snafu(display("Stack '{}' has no template body", name))]
        MissingTemplateBody { name: String },

        #[snafu(display("Stack '{}' is still in status '{}'", name, status))]
        StackStatusPending { name: String, status: String },

        #[snafu(display("Unexpected status '{}' while waiting for stack '{}'", status, name))]
        UnexpectedStackStatus { name: String, status: String },

        #[snafu(display("Stack '{}' is missing expected output '{}'", name, output))]
        MissingStackOutput { name: String, output: String },

        #[snafu(display("Unable to render stack template: '{}'", source))]
        TemplateRendering { source: BoxedError },
    }
}

#[cfg(any(feature = "mockall", test))]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        /// A mock StackClient for use in tests.
        pub StackClient {}

        #[async_trait]
        impl StackClient for StackClient {
            async fn create_stack(
                &self,
                name: &str,
                template: TemplateBody,
                with_iam: bool,
                tags: &BTreeMap<String, String>,
                parameters: &BTreeMap<String, String>,
                sender: CreateStackSender,
            ) -> StackResult<()>;
            async fn describe_stack(&self, name: &str) -> StackResult<Stack>;
            async fn delete_stack_and_wait(&self, stack: &Stack) -> StackResult<()>;
            async fn get_cluster_stack_if_exists(&self) -> StackResult<Option<Stack>>;
            async fn get_stack_template(&self, stack_name: &str) -> StackResult<String>;
        }
    }
}
