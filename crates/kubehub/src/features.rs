//! Process-wide cluster feature flags, read-mostly and refreshed explicitly from API discovery.

use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use keel_core::ClusterFeatures;
use kube::{discovery::Discovery, Client};
use metrics::counter;
use once_cell::sync::Lazy;
use tracing::info;

static FEATURES: Lazy<ArcSwap<ClusterFeatures>> = Lazy::new(|| ArcSwap::from_pointee(ClusterFeatures::default()));

/// Last known flags. All false until the first [`refresh`].
pub fn current() -> Arc<ClusterFeatures> { FEATURES.load_full() }

pub fn set(features: ClusterFeatures) { FEATURES.store(Arc::new(features)); }

/// Re-run discovery and swap in fresh flags.
pub async fn refresh(client: Client) -> Result<Arc<ClusterFeatures>> {
    let discovery = Discovery::new(client).run().await.context("discovering served API groups")?;
    let served: Vec<String> = discovery
        .groups()
        .flat_map(|g| {
            let group = g.name().to_string();
            g.versions()
                .map(move |v| if group.is_empty() { v.to_string() } else { format!("{}/{}", group, v) })
                .collect::<Vec<_>>()
        })
        .collect();
    let mut features = ClusterFeatures::from_group_versions(served.iter().map(String::as_str));
    features.refreshed_at = Some(Utc::now().timestamp());
    counter!("cluster_features_refresh_total", 1u64);
    info!(
        route = features.route_api,
        version = features.version_api,
        prometheus = features.prometheus_api,
        template = features.template_api,
        groups = served.len(),
        "cluster features refreshed"
    );
    set(features);
    Ok(current())
}

/// Current flags, running discovery first if it never ran in this process.
pub async fn get_or_refresh(client: Client) -> Result<Arc<ClusterFeatures>> {
    let cached = current();
    if cached.is_refreshed() {
        return Ok(cached);
    }
    refresh(client).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_current_snapshot() {
        set(ClusterFeatures { route_api: true, refreshed_at: Some(1), ..Default::default() });
        let after = current();
        assert!(after.route_api);
        assert!(after.is_refreshed());
        assert!(!after.prometheus_api);
    }
}
