use models::eks::error::Error as EksError;
use models::iam::error::Error as IamError;
use models::stack::error::Error as StackError;
use models::BoxedError;

use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to get cluster stack: '{}'", source))]
    GetClusterStack { source: StackError },

    #[snafu(display("Unable to render node role stack template: '{}'", source))]
    RenderNodeRoleTemplate { source: StackError },

    // Submission failures are surfaced as-is; the stack error already names
    // the stack.
    #[snafu(display("{}", source))]
    SubmitCreateStack { source: StackError },

    #[snafu(display("Stack '{}' creation did not complete: '{}'", stack_name, source))]
    StackCreationFailed {
        stack_name: String,
        source: StackError,
    },

    #[snafu(display(
        "Stack '{}' creation result channel closed before a result was delivered",
        stack_name
    ))]
    CreateResultChannelClosed { stack_name: String },

    #[snafu(display("Cancelled while waiting for stack '{}'", stack_name))]
    Cancelled { stack_name: String },

    #[snafu(display("Unable to collect outputs of stack '{}': '{}'", stack_name, source))]
    CollectStackOutputs {
        stack_name: String,
        source: StackError,
    },

    #[snafu(display("Stack '{}' did not produce a node role ARN output", stack_name))]
    MissingRoleArnOutput { stack_name: String },

    #[snafu(display("Unable to describe stack '{}': '{}'", stack_name, source))]
    DescribeStack {
        stack_name: String,
        source: StackError,
    },

    #[snafu(display("Unable to delete stack '{}': '{}'", stack_name, source))]
    DeleteStack {
        stack_name: String,
        source: StackError,
    },

    #[snafu(display("Unable to get template of stack '{}': '{}'", stack_name, source))]
    GetStackTemplate {
        stack_name: String,
        source: StackError,
    },

    #[snafu(display("Unable to parse template of stack '{}': '{}'", stack_name, source))]
    ParseStackTemplate {
        stack_name: String,
        source: serde_json::Error,
    },

    #[snafu(display(
        "Unable to list policies attached to role '{}': '{}'",
        role_name,
        source
    ))]
    ListAttachedPolicies {
        role_name: String,
        source: IamError,
    },

    #[snafu(display("Unable to attach role policy '{}': '{}'", policy_name, source))]
    AttachRolePolicy {
        policy_name: String,
        source: IamError,
    },

    #[snafu(display("Unable to detach role policy '{}': '{}'", policy_name, source))]
    DetachRolePolicy {
        policy_name: String,
        source: IamError,
    },

    #[snafu(display(
        "Unable to update assume role policy of role '{}': '{}'",
        role_name,
        source
    ))]
    UpdateAssumeRolePolicy {
        role_name: String,
        source: IamError,
    },

    #[snafu(display("autoModeConfig.nodeRoleARN cannot be modified"))]
    NodeRoleModified,

    #[snafu(display(
        "Found Karpenter pods in namespace '{}'; either delete Karpenter or scale it down to zero and rerun the command",
        namespace
    ))]
    KarpenterInstalled { namespace: String },

    #[snafu(display("Unable to update cluster role to use Auto Mode: '{}'", source))]
    UpdateClusterRole {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Unable to create node role to use for Auto Mode nodes: '{}'", source))]
    CreateNodeRole {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Unable to delete IAM resources for Auto Mode: '{}'", source))]
    DeleteNodeRole {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Unable to delete Auto Mode policies from cluster role: '{}'", source))]
    DeleteClusterRolePolicies {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Unable to enable Auto Mode: '{}'", source))]
    EnableAutoMode {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Unable to disable Auto Mode: '{}'", source))]
    DisableAutoMode {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Unable to update cluster compute config: '{}'", source))]
    UpdateComputeConfig { source: EksError },

    #[snafu(display("Waiting for cluster update '{}' to complete: '{}'", update_id, source))]
    WaitForClusterUpdate {
        update_id: String,
        source: EksError,
    },

    #[snafu(display("Cluster update '{}' is still in progress", update_id))]
    ClusterUpdatePending { update_id: String },

    #[snafu(display("Cluster update '{}' finished with status '{}'", update_id, status))]
    ClusterUpdateFailed { update_id: String, status: String },

    #[snafu(display("Unable to drain nodegroups: '{}'", source))]
    DrainNodeGroups { source: BoxedError },
}
