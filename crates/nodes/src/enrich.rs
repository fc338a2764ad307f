// SPDX-License-Identifier: Apache-2.0

//! Resource-attribute enrichment.
//!
//! Fills in `host.id` and `service.instance.id` when the producer did not
//! send them. Enrichment never drops data: when detection fails, the batch
//! is annotated with `resource_detection_error` and passed on.

use phoenix_pdata::{keys, AttributeMap, AttributeValue, RESOURCE_DETECTION_ERROR_ATTR};
use std::sync::Arc;

/// Resource attribute naming this service instance.
pub const SERVICE_INSTANCE_ID: &str = "service.instance.id";

/// Enriches batch resources with host and instance identity.
pub struct Enricher {
    host_id: Option<Arc<str>>,
    instance_id: Arc<str>,
}

impl Enricher {
    /// Detects the host identity once at startup. The instance id is fresh
    /// per process run.
    #[must_use]
    pub fn new() -> Self {
        let host_id = sysinfo::System::host_name().map(|name| Arc::from(name.as_str()));
        Self {
            host_id,
            instance_id: Arc::from(uuid::Uuid::new_v4().to_string().as_str()),
        }
    }

    /// Applies enrichment to a batch's resource attributes.
    pub fn enrich(&self, resource: &mut AttributeMap) {
        if resource.get(keys::HOST_ID).is_none() {
            match &self.host_id {
                Some(host_id) => {
                    resource.insert(keys::HOST_ID, AttributeValue::Str(host_id.clone()));
                }
                None => {
                    resource.insert(
                        RESOURCE_DETECTION_ERROR_ATTR,
                        AttributeValue::from("host name detection failed"),
                    );
                }
            }
        }
        if resource.get(SERVICE_INSTANCE_ID).is_none() {
            resource.insert(
                SERVICE_INSTANCE_ID,
                AttributeValue::Str(self.instance_id.clone()),
            );
        }
    }
}

impl Default for Enricher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_supplied_host_id_is_kept() {
        let enricher = Enricher::new();
        let mut resource = AttributeMap::new();
        resource.insert(keys::HOST_ID, AttributeValue::from("h-supplied"));
        enricher.enrich(&mut resource);
        assert_eq!(resource.get_str(keys::HOST_ID), Some("h-supplied"));
    }

    #[test]
    fn instance_id_is_stable_within_a_run() {
        let enricher = Enricher::new();
        let mut a = AttributeMap::new();
        let mut b = AttributeMap::new();
        enricher.enrich(&mut a);
        enricher.enrich(&mut b);
        assert_eq!(
            a.get_str(SERVICE_INSTANCE_ID),
            b.get_str(SERVICE_INSTANCE_ID)
        );
    }

    #[test]
    fn detection_failure_annotates_instead_of_dropping() {
        let enricher = Enricher {
            host_id: None,
            instance_id: Arc::from("i-1"),
        };
        let mut resource = AttributeMap::new();
        enricher.enrich(&mut resource);
        assert!(resource.get(RESOURCE_DETECTION_ERROR_ATTR).is_some());
    }
}
