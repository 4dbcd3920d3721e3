/// Helper macro to avoid retyping the tag domain shared by every stack this
/// tool owns. When given no parameters, this returns the bare domain. When
/// given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! eksctl_domain {
    () => {
        "alpha.eksctl.io"
    };
    ($s:literal) => {
        concat!(eksctl_domain!(), "/", $s)
    };
}

// Tags applied to every CloudFormation stack owned by this tool.
pub const CLUSTER_NAME_TAG: &str = eksctl_domain!("cluster-name");
pub const EKSCTL_VERSION_TAG: &str = eksctl_domain!("eksctl-version");

// CloudFormation identifiers shared between the cluster stack and the
// dedicated Auto Mode role stack.
pub const CLUSTER_SERVICE_ROLE_RESOURCE: &str = "ServiceRole"; // Logical id of a dedicated cluster service role.
pub const NODE_ROLE_ARN_OUTPUT: &str = "AutoModeNodeRoleARN"; // Cluster stack output exporting a node role ARN.

/// The AWS managed policies an Auto Mode cluster role must carry.
pub const AUTO_MODE_IAM_POLICIES: &[&str] = &[
    "AmazonEKSComputePolicy",
    "AmazonEKSBlockStoragePolicy",
    "AmazonEKSLoadBalancingPolicy",
    "AmazonEKSNetworkingPolicy",
];

/// Returns the name of the stack owning a cluster's control plane resources.
pub fn cluster_stack_name(cluster_name: &str) -> String {
    format!("eksctl-{}-cluster", cluster_name)
}

/// Returns the name of the dedicated Auto Mode node role stack. The name is a
/// pure function of the cluster name so the stack can always be located
/// without additional state.
pub fn node_role_stack_name(cluster_name: &str) -> String {
    format!("eksctl-{}-auto-mode-role", cluster_name)
}
