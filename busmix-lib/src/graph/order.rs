//! Processing order over the bus-to-bus edges.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::bus::BusNode;
use super::connection::ConnectionType;
use crate::ids::BusNodeId;

/// Non-feedback bus-to-bus edges, as (source, destination).
fn edges(buses: &BTreeMap<BusNodeId, BusNode>) -> impl Iterator<Item = (BusNodeId, BusNodeId)> + '_ {
    buses.iter().flat_map(|(id, bus)| {
        bus.mixable
            .connections()
            .iter()
            .filter(|c| c.kind() != ConnectionType::Feedback)
            .map(move |c| (*id, c.destination()))
    })
}

/// Kahn sort: every bus comes after all the buses that feed it.
///
/// Nodes left on a cycle are appended in id order; callers never create one.
pub(crate) fn processing_order(buses: &BTreeMap<BusNodeId, BusNode>) -> Vec<BusNodeId> {
    let mut in_degree: HashMap<BusNodeId, usize> = buses.keys().map(|id| (*id, 0)).collect();
    let mut downstream: HashMap<BusNodeId, Vec<BusNodeId>> = HashMap::new();
    for (from, to) in edges(buses) {
        if let Some(degree) = in_degree.get_mut(&to) {
            *degree += 1;
            downstream.entry(from).or_default().push(to);
        }
    }

    let mut ready: BTreeSet<BusNodeId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(buses.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for next in downstream.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    if order.len() < buses.len() {
        let placed: BTreeSet<BusNodeId> = order.iter().copied().collect();
        let stuck: Vec<BusNodeId> = buses.keys().filter(|id| !placed.contains(id)).copied().collect();
        log::warn!("bus graph has a cycle through {:?}", stuck);
        order.extend(stuck);
    }
    order
}

/// True when a non-feedback edge `from -> to` would close a cycle.
pub(crate) fn would_create_cycle(
    buses: &BTreeMap<BusNodeId, BusNode>,
    from: BusNodeId,
    to: BusNodeId,
) -> bool {
    if from == to {
        return true;
    }
    let mut stack = vec![to];
    let mut seen = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(bus) = buses.get(&id) else {
            continue;
        };
        for conn in bus.mixable.connections() {
            if conn.kind() == ConnectionType::Feedback {
                continue;
            }
            if conn.destination() == from {
                return true;
            }
            stack.push(conn.destination());
        }
    }
    false
}
