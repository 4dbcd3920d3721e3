/*!
  models holds the domain types and external control-plane interfaces shared
  by the Auto Mode reconcilers: cluster configuration shapes, ARN and stack
  naming helpers, and the CloudFormation, IAM, and EKS client traits with
  their AWS-backed implementations.
!*/

pub mod arn;
pub mod aws;
pub mod cluster;
pub mod constants;
pub mod eks;
pub mod iam;
pub mod stack;

/// A boxed error from an external client, carried as the `source` of the
/// typed errors in this workspace.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) fn boxed<E>(err: E) -> BoxedError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Box::new(err)
}
