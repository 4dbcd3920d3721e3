/*!
  automode reconciles an EKS cluster's IAM resources with the desired Auto
  Mode state: a node role imported from the cluster stack or provisioned in a
  dedicated stack, the managed policies and trust document on a dedicated
  cluster service role, and the cluster's compute configuration. All
  operations are idempotent; retrying after a partial failure converges.
!*/

pub mod cluster_role;
pub mod error;
pub mod role;
pub mod updater;

pub use cluster_role::{ClusterRoleManager, RoleOwnership};
pub use error::{Error, Result};
pub use role::{RoleCreator, RoleDeleter};
pub use updater::Updater;
