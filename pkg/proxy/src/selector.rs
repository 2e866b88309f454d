//! Single-key label selection between Services and Pods.
//!
//! Only the first selector entry (in key order) is considered; any further
//! entries are ignored.

use pkg_state::FieldSelector;
use pkg_types::pod::Pod;
use pkg_types::service::Service;

/// The `(key, value)` pair used for matching, if the service selects anything.
pub fn selector_term(service: &Service) -> Option<(&str, &str)> {
    service
        .spec
        .selector
        .iter()
        .next()
        .map(|(k, v)| (k.as_str(), v.as_str()))
}

/// Store-side filter that lists the pods `service` selects.
pub fn pod_field_selector(service: &Service) -> Option<FieldSelector> {
    selector_term(service).map(|(k, v)| FieldSelector::label(k, v))
}

/// Whether `service` selects `pod`. Selection never crosses namespaces.
pub fn matches(service: &Service, pod: &Pod) -> bool {
    if service.metadata.namespace != pod.metadata.namespace {
        return false;
    }
    match selector_term(service) {
        Some((key, value)) => pod.metadata.labels.get(key).is_some_and(|v| v == value),
        None => false,
    }
}
