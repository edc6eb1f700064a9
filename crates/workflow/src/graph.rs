//! Dependency graph validation over a workflow's actions.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::error::WorkflowError;
use crate::model::{Action, ActionId};

/// Check ids are unique, every dependency exists, every condition reads a
/// dependency and the graph is acyclic.
///
/// Returns one topological order (Kahn, ties broken by list position).
pub fn validate(actions: &[Action]) -> Result<Vec<ActionId>, WorkflowError> {
    let mut index: HashMap<&ActionId, usize> = HashMap::with_capacity(actions.len());
    for (i, action) in actions.iter().enumerate() {
        if index.insert(&action.id, i).is_some() {
            return Err(WorkflowError::DuplicateActionId(action.id.clone()));
        }
    }

    let mut in_degree = vec![0usize; actions.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); actions.len()];
    for (i, action) in actions.iter().enumerate() {
        let mut seen = BTreeSet::new();
        for dep in &action.depends_on {
            let Some(&d) = index.get(dep) else {
                return Err(WorkflowError::UnknownDependency {
                    action: action.id.clone(),
                    missing: dep.clone(),
                });
            };
            if seen.insert(d) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
        if let Some(condition) = &action.condition {
            if !action.depends_on.contains(&condition.source) {
                return Err(WorkflowError::ConditionOutsideDependencies {
                    action: action.id.clone(),
                    on: condition.source.clone(),
                });
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..actions.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(actions.len());
    while let Some(i) = queue.pop_front() {
        order.push(actions[i].id.clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() < actions.len() {
        let stuck: BTreeSet<usize> = (0..actions.len()).filter(|&i| in_degree[i] > 0).collect();
        return Err(WorkflowError::CyclicDependency {
            cycle: find_cycle(actions, &index, &stuck),
        });
    }

    Ok(order)
}

/// Walk dependency edges inside the unresolved set until a node repeats.
///
/// Every node left over by Kahn's algorithm has at least one dependency that
/// is also left over, so the walk always closes a loop.
fn find_cycle(
    actions: &[Action],
    index: &HashMap<&ActionId, usize>,
    stuck: &BTreeSet<usize>,
) -> Vec<ActionId> {
    let Some(&start) = stuck.iter().next() else {
        return Vec::new();
    };

    let mut position: BTreeMap<usize, usize> = BTreeMap::new();
    let mut path = Vec::new();
    let mut current = start;
    loop {
        if let Some(&at) = position.get(&current) {
            let mut cycle: Vec<ActionId> = path[at..]
                .iter()
                .map(|&i: &usize| actions[i].id.clone())
                .collect();
            cycle.push(actions[current].id.clone());
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);

        let next = actions[current]
            .depends_on
            .iter()
            .filter_map(|d| index.get(d).copied())
            .find(|d| stuck.contains(d));
        match next {
            Some(n) => current = n,
            None => return path.iter().map(|&i| actions[i].id.clone()).collect(),
        }
    }
}

/// Every action that transitively depends on `root`.
pub fn dependents_of(actions: &[Action], root: &ActionId) -> BTreeSet<ActionId> {
    let mut out = BTreeSet::new();
    let mut frontier = vec![root.clone()];
    while let Some(id) = frontier.pop() {
        for action in actions {
            if action.depends_on.contains(&id) && out.insert(action.id.clone()) {
                frontier.push(action.id.clone());
            }
        }
    }
    out
}
