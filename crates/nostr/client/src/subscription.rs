//! Subscription ids and EOSE bookkeeping.

use crate::endpoint::EndpointId;
use std::collections::HashSet;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `<prefix>-<8 hex>`, e.g. `neg-1f2e3d4c`.
pub fn prefixed_subscription_id(prefix: &str) -> String {
    format!("{}-{}", prefix, generate_subscription_id())
}

/// Tracks which endpoints of a subscription have finished sending stored
/// events. An endpoint finishes on EOSE, CLOSED or disconnect.
#[derive(Debug, Clone, Default)]
pub struct EoseTracker {
    /// Endpoints the subscription was sent to
    endpoints: HashSet<EndpointId>,
    /// Endpoints that have finished
    finished: HashSet<EndpointId>,
}

impl EoseTracker {
    pub fn new(endpoints: impl IntoIterator<Item = EndpointId>) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
            finished: HashSet::new(),
        }
    }

    /// Mark an endpoint finished. Returns true if this completed the set.
    pub fn mark_finished(&mut self, endpoint: &EndpointId) -> bool {
        if !self.endpoints.contains(endpoint) || self.is_complete() {
            return false;
        }
        self.finished.insert(endpoint.clone());
        self.is_complete()
    }

    /// True once every endpoint finished. An empty set is complete.
    pub fn is_complete(&self) -> bool {
        self.finished.len() == self.endpoints.len()
    }

    pub fn has_endpoint(&self, endpoint: &EndpointId) -> bool {
        self.endpoints.contains(endpoint)
    }

    /// Endpoints still sending stored events.
    pub fn pending(&self) -> impl Iterator<Item = &EndpointId> {
        self.endpoints.difference(&self.finished)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> EndpointId {
        EndpointId::parse(&format!("wss://{}.example", name)).unwrap()
    }

    #[test]
    fn test_generate_subscription_id() {
        let id1 = generate_subscription_id();
        let id2 = generate_subscription_id();

        assert_eq!(id1.len(), 8);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_prefixed_subscription_id() {
        let id = prefixed_subscription_id("neg-fetch");
        assert!(id.starts_with("neg-fetch-"));
        assert_eq!(id.len(), "neg-fetch-".len() + 8);
    }

    #[test]
    fn test_eose_tracker() {
        let (a, b) = (endpoint("a"), endpoint("b"));
        let mut tracker = EoseTracker::new([a.clone(), b.clone()]);
        assert!(!tracker.is_complete());

        assert!(!tracker.mark_finished(&a));
        assert!(!tracker.mark_finished(&a));
        assert!(!tracker.mark_finished(&endpoint("stranger")));
        assert_eq!(tracker.pending().collect::<Vec<_>>(), vec![&b]);

        assert!(tracker.mark_finished(&b));
        assert!(tracker.is_complete());
        // Completion is reported once.
        assert!(!tracker.mark_finished(&b));
    }

    #[test]
    fn test_empty_tracker_is_complete() {
        assert!(EoseTracker::new([]).is_complete());
    }
}
