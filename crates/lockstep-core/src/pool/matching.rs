//! Label and quantity matching for the reference pool.
//!
//! Pure functions over a resource table: no I/O, no locking.

use std::collections::{BTreeMap, BTreeSet};

use crate::resource::{ResolvedSet, ResourceRequest};

/// What matching needs to know about one resource.
pub trait Candidate {
    fn name(&self) -> &str;
    fn has_label(&self, label: &str) -> bool;
    fn is_free(&self) -> bool;
}

/// Resolve `requests` against `resources`, or `None` if they cannot all be
/// satisfied right now.
///
/// - a named request needs that resource to exist and be free
/// - a labeled request with quantity `n > 0` takes the first `n` free
///   resources carrying the label (by name) that are neither chosen already
///   nor named by any request of the set
/// - a labeled request with quantity 0 needs every labeled resource free
/// - a label nobody carries is unsatisfiable
pub fn resolve<C: Candidate>(
    resources: &BTreeMap<String, C>,
    requests: &[ResourceRequest],
) -> Option<ResolvedSet> {
    let mut chosen = ResolvedSet::new();
    let named: BTreeSet<&str> = requests
        .iter()
        .filter_map(ResourceRequest::resource_name)
        .collect();

    for request in requests {
        if let Some(name) = request.resource_name() {
            let resource = resources.get(name)?;
            if !resource.is_free() {
                return None;
            }
            chosen.insert(name);
            continue;
        }

        let label = request.label_name()?;
        let labeled: Vec<&C> = resources.values().filter(|r| r.has_label(label)).collect();
        if labeled.is_empty() {
            return None;
        }

        if request.quantity == 0 {
            if labeled.iter().any(|r| !r.is_free()) {
                return None;
            }
            labeled.iter().for_each(|r| {
                chosen.insert(r.name());
            });
        } else {
            let wanted = usize::try_from(request.quantity).unwrap_or(usize::MAX);
            let picks: Vec<&str> = labeled
                .iter()
                .filter(|r| {
                    r.is_free() && !chosen.contains(r.name()) && !named.contains(r.name())
                })
                .map(|r| r.name())
                .take(wanted)
                .collect();
            if picks.len() < wanted {
                return None;
            }
            picks.into_iter().for_each(|name| {
                chosen.insert(name);
            });
        }
    }

    Some(chosen)
}
