//! Shared AWS SDK configuration loading.

use aws_config::{BehaviorVersion, Region, SdkConfig};

/// Loads the shared SDK configuration for a region, starting from the
/// environment the way every client in this workspace does.
pub async fn load_sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}
