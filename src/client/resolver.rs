//! # Dependency Resolver
//!
//! Pure planning step for queue replay. Given the unsettled queue, it builds
//! the dependency graph induced by temp ids (a mutation referencing a temp
//! id depends on the create that produces it), then:
//!
//! - marks every mutation transitively dependent on a failed one as blocked,
//! - topologically orders the rest with Kahn's algorithm, breaking ties by
//!   enqueue time so replay preserves user intent where the graph allows,
//! - reports anything left unordered as part of a dependency cycle,
//! - groups the ordered mutations into independent chains (connected
//!   components) that the drainer may replay concurrently.
//!
//! No IO happens here; the drainer persists the derived states.

use crate::shared::entity::is_temp_id;
use crate::shared::mutation::{MutationStatus, QueuedMutation};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Replay plan derived from one snapshot of the unsettled queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPlan {
    /// Full topological order over the sendable mutations
    pub order: Vec<Uuid>,
    /// Independent chains; mutations in different chains share no
    /// dependency and may be replayed concurrently, each chain in order
    pub chains: Vec<Vec<Uuid>>,
    /// Transitively dependent on a failed mutation; excluded from sending
    pub blocked: Vec<Uuid>,
    /// Part of a dependency cycle; excluded from sending
    pub cyclic: Vec<Uuid>,
}

/// Every temp id a mutation waits on: its declared dependencies plus any
/// temp id still present in its target or payload references
fn wanted_temp_ids(mutation: &QueuedMutation) -> HashSet<String> {
    let mut wanted: HashSet<String> = mutation
        .depends_on
        .iter()
        .filter(|id| is_temp_id(id))
        .cloned()
        .collect();
    if is_temp_id(&mutation.entity_id) && mutation.produced_temp_id().is_none() {
        wanted.insert(mutation.entity_id.clone());
    }
    if let Some(payload) = &mutation.payload {
        wanted.extend(payload.temp_references());
    }
    wanted
}

/// Build the replay plan for the given unsettled queue snapshot
pub fn resolve(mutations: &[QueuedMutation]) -> ResolvedPlan {
    // Who produces each temp id
    let producers: HashMap<&str, Uuid> = mutations
        .iter()
        .filter_map(|m| m.produced_temp_id().map(|t| (t, m.id)))
        .collect();

    let by_id: HashMap<Uuid, &QueuedMutation> =
        mutations.iter().map(|m| (m.id, m)).collect();

    // Candidates for sending; failed and in-flight entries are excluded but
    // still participate as dependency producers
    let candidates: Vec<&QueuedMutation> = mutations
        .iter()
        .filter(|m| matches!(m.status, MutationStatus::Pending | MutationStatus::Blocked))
        .collect();

    // Dependency edges: candidate -> producer of a temp id it waits on.
    // A dangling temp id (no producer anywhere in the queue) yields no edge;
    // the drainer handles those by deferring, since sending a temp id to the
    // server can never succeed.
    let mut deps: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for m in &candidates {
        let mut edges = HashSet::new();
        for temp in wanted_temp_ids(m) {
            if let Some(&producer) = producers.get(temp.as_str()) {
                if producer != m.id {
                    edges.insert(producer);
                    dependents.entry(producer).or_default().push(m.id);
                }
            }
        }
        deps.insert(m.id, edges);
    }

    // Everything transitively downstream of a failed mutation is blocked
    let mut blocked: HashSet<Uuid> = HashSet::new();
    let mut frontier: VecDeque<Uuid> = mutations
        .iter()
        .filter(|m| m.status == MutationStatus::Failed)
        .map(|m| m.id)
        .collect();
    while let Some(id) = frontier.pop_front() {
        if let Some(downstream) = dependents.get(&id) {
            for &dep in downstream {
                if blocked.insert(dep) {
                    frontier.push_back(dep);
                }
            }
        }
    }

    // Kahn's algorithm over the unblocked candidates, min-heap keyed by
    // enqueue time so independent mutations replay in user order
    let sendable: Vec<Uuid> = candidates
        .iter()
        .filter(|m| !blocked.contains(&m.id))
        .map(|m| m.id)
        .collect();
    let sendable_set: HashSet<Uuid> = sendable.iter().copied().collect();

    let mut in_degree: HashMap<Uuid, usize> = HashMap::new();
    for &id in &sendable {
        let degree = deps[&id]
            .iter()
            .filter(|p| sendable_set.contains(p))
            .count();
        in_degree.insert(id, degree);
    }

    let mut ready: BinaryHeap<Reverse<(String, Uuid)>> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&id, _)| Reverse((by_id[&id].enqueued_at.clone(), id)))
        .collect();

    let mut order = Vec::with_capacity(sendable.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        order.push(id);
        if let Some(downstream) = dependents.get(&id) {
            for &dep in downstream {
                if let Some(degree) = in_degree.get_mut(&dep) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((by_id[&dep].enqueued_at.clone(), dep)));
                    }
                }
            }
        }
    }

    // Whatever Kahn could not order sits on a cycle
    let ordered: HashSet<Uuid> = order.iter().copied().collect();
    let cyclic: Vec<Uuid> = sendable
        .iter()
        .filter(|id| !ordered.contains(id))
        .copied()
        .collect();

    // Connected components over the ordered set (undirected), each chain
    // keeping its mutations in global topological order
    let mut component: HashMap<Uuid, usize> = HashMap::new();
    let mut next_component = 0;
    for &id in &order {
        if component.contains_key(&id) {
            continue;
        }
        let label = next_component;
        next_component += 1;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if component.insert(current, label).is_some() {
                continue;
            }
            for &p in deps.get(&current).into_iter().flatten() {
                if ordered.contains(&p) && !component.contains_key(&p) {
                    stack.push(p);
                }
            }
            for &d in dependents.get(&current).into_iter().flatten() {
                if ordered.contains(&d) && !component.contains_key(&d) {
                    stack.push(d);
                }
            }
        }
    }

    let mut chains: Vec<Vec<Uuid>> = vec![Vec::new(); next_component];
    for &id in &order {
        chains[component[&id]].push(id);
    }
    chains.retain(|c| !c.is_empty());

    let mut blocked: Vec<Uuid> = blocked.into_iter().collect();
    blocked.sort_by_key(|id| by_id[id].enqueued_at.clone());

    ResolvedPlan {
        order,
        chains,
        blocked,
        cyclic,
    }
}
