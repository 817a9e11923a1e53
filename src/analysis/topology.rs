use crate::store::{EntityId, Registry};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Groups entities into barrier-separated waves by an ordering key.
///
/// Members of one wave share the key and are independent by configuration
/// contract, so they may run concurrently. Within a wave, declaration order
/// (ascending id) is kept so outputs are assembled deterministically.
pub fn priority_waves<K: Ord + Copy>(items: impl IntoIterator<Item = (EntityId, K)>) -> Vec<Vec<EntityId>> {
    let mut groups: BTreeMap<K, Vec<EntityId>> = BTreeMap::new();
    for (id, key) in items {
        groups.entry(key).or_default().push(id);
    }
    groups
        .into_values()
        .map(|mut ids| {
            ids.sort();
            ids
        })
        .collect()
}

/// Layers the given subset of nodes with Kahn's algorithm.
///
/// Only edges between members of `subset` count; edges to nodes outside it are
/// assumed satisfied by an earlier tier. Each returned level depends solely on
/// earlier levels and is sorted by `(priority, id)`.
///
/// On a cycle, returns the ids of every strongly connected component that
/// prevents progress.
pub fn layered_order(
    registry: &Registry,
    subset: &[EntityId],
    priority: impl Fn(EntityId) -> i32,
) -> Result<Vec<Vec<EntityId>>, Vec<EntityId>> {
    let members: HashSet<EntityId> = subset.iter().copied().collect();
    let mut in_degree: HashMap<EntityId, usize> = HashMap::with_capacity(subset.len());

    // 1. In-degrees restricted to the subset
    for &node in subset {
        let count = registry.get_parents(node).iter().filter(|p| members.contains(p)).count();
        in_degree.insert(node, count);
    }

    let mut frontier: Vec<EntityId> = subset.iter().copied().filter(|n| in_degree[n] == 0).collect();
    let mut levels = Vec::new();
    let mut placed = 0;

    // 2. Peel one level at a time
    while !frontier.is_empty() {
        frontier.sort_by_key(|&n| (priority(n), n));
        let mut next = Vec::new();
        for &node in &frontier {
            for child in registry.children(node) {
                if let Some(d) = in_degree.get_mut(&child) {
                    *d -= 1;
                    if *d == 0 {
                        next.push(child);
                    }
                }
            }
        }
        placed += frontier.len();
        levels.push(std::mem::replace(&mut frontier, next));
    }

    if placed != subset.len() {
        let stuck: Vec<EntityId> = subset.iter().copied().filter(|n| in_degree[n] > 0).collect();
        return Err(cycle_members(registry, &stuck));
    }
    Ok(levels)
}

/// Narrows a set of unplaceable nodes down to the ones actually on a cycle.
fn cycle_members(registry: &Registry, stuck: &[EntityId]) -> Vec<EntityId> {
    let mut graph = DiGraph::<EntityId, ()>::new();
    let index: HashMap<EntityId, _> = stuck.iter().map(|&n| (n, graph.add_node(n))).collect();
    for &node in stuck {
        for parent in registry.get_parents(node) {
            if let Some(&p) = index.get(parent) {
                graph.add_edge(p, index[&node], ());
            }
        }
    }

    let mut members: Vec<EntityId> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|ix| graph[ix])
        .collect();
    members.sort();
    members
}

/// Every entity reachable downstream of `start_nodes`, including themselves.
pub fn downstream_from(registry: &Registry, start_nodes: &[EntityId]) -> HashSet<EntityId> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from(start_nodes.to_vec());

    while let Some(node) = queue.pop_front() {
        if visited.insert(node) {
            queue.extend(registry.children(node));
        }
    }
    visited
}

/// Every entity `start_nodes` transitively consume, including themselves.
pub fn upstream_from(registry: &Registry, start_nodes: &[EntityId]) -> HashSet<EntityId> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from(start_nodes.to_vec());

    while let Some(node) = queue.pop_front() {
        if visited.insert(node) {
            queue.extend(registry.get_parents(node).iter().copied());
        }
    }
    visited
}
