//! ARN helpers for managed policies and roles.
//!
//! Partition resolution is a pure lookup on the region prefix; policy ARNs
//! never require a network call to construct.

use std::fmt::{Display, Formatter};

/// An AWS partition, resolved from an already-validated region name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Aws,
    AwsChina,
    AwsUsGov,
    AwsIso,
    AwsIsoB,
    AwsIsoE,
    AwsIsoF,
}

impl Partition {
    /// Resolves the partition a region belongs to. Regions that match no
    /// special prefix belong to the standard partition.
    pub fn for_region(region: &str) -> Self {
        if region.starts_with("cn-") {
            Partition::AwsChina
        } else if region.starts_with("us-gov-") {
            Partition::AwsUsGov
        } else if region.starts_with("us-isob-") {
            Partition::AwsIsoB
        } else if region.starts_with("us-isof-") {
            Partition::AwsIsoF
        } else if region.starts_with("us-iso-") {
            Partition::AwsIso
        } else if region.starts_with("eu-isoe-") {
            Partition::AwsIsoE
        } else {
            Partition::Aws
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Aws => "aws",
            Partition::AwsChina => "aws-cn",
            Partition::AwsUsGov => "aws-us-gov",
            Partition::AwsIso => "aws-iso",
            Partition::AwsIsoB => "aws-iso-b",
            Partition::AwsIsoE => "aws-iso-e",
            Partition::AwsIsoF => "aws-iso-f",
        }
    }
}

impl Display for Partition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the ARN of an AWS managed policy in the given partition.
pub fn policy_arn(partition: Partition, policy_name: &str) -> String {
    format!("arn:{}:iam::aws:policy/{}", partition, policy_name)
}

/// Extracts the role name from a role ARN, e.g.
/// `arn:aws:iam::1234:role/path/Name` yields `Name`. Returns `None` when the
/// ARN carries no resource path.
pub fn role_name_from_arn(arn: &str) -> Option<&str> {
    if !arn.contains('/') {
        return None;
    }
    arn.rsplit('/').next()
}
