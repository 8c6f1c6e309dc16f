//! Dependency-graph helpers: deterministic topological order and a
//! precomputed reverse index (task -> direct dependents).

use std::collections::{BTreeSet, HashMap};

use crate::model::{Plan, Task};

/// Deterministic topological order over a validated plan.
///
/// Kahn's algorithm with ties broken by (priority ascending, insertion
/// order ascending). This is the only ordering guarantee between
/// independent tasks, and the submission order used by durable backends.
///
/// Assumes the plan has passed [`super::validate`]; a cyclic plan yields a
/// truncated order.
pub fn topological_order(plan: &Plan) -> Vec<&Task> {
    let index_of: HashMap<&str, usize> = plan
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let n = plan.tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for (task_id, deps) in &plan.dependencies {
        let Some(&task_idx) = index_of.get(task_id.as_str()) else {
            continue;
        };
        for dep in deps {
            if let Some(&dep_idx) = index_of.get(dep.as_str()) {
                adj[dep_idx].push(task_idx);
                in_degree[task_idx] += 1;
            }
        }
    }

    // Ready set keyed by (priority, insertion index) so pops are
    // deterministic regardless of arrival order.
    let mut ready: BTreeSet<(u8, usize)> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| (plan.tasks[i].priority, i))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(&(prio, idx)) = ready.iter().next() {
        ready.remove(&(prio, idx));
        order.push(&plan.tasks[idx]);
        for &next in &adj[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert((plan.tasks[next].priority, next));
            }
        }
    }

    order
}

/// Reverse dependency index: task id -> ids that directly depend on it.
///
/// O(E) to build, O(1) per lookup. Used for skip propagation when a task
/// fails terminally.
#[derive(Debug, Clone)]
pub struct DependentsIndex {
    dependents: HashMap<String, Vec<String>>,
}

impl DependentsIndex {
    /// Build the index from a plan's dependency map.
    pub fn new(plan: &Plan) -> Self {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (task_id, deps) in &plan.dependencies {
            for dep in deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task_id.clone());
            }
        }
        Self { dependents }
    }

    /// Direct dependents of a task id.
    pub fn direct_dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All transitive dependents of a task id.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&str> = self.direct_dependents(id).iter().map(String::as_str).collect();
        while let Some(next) = stack.pop() {
            if out.insert(next.to_owned()) {
                stack.extend(self.direct_dependents(next).iter().map(String::as_str));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn task(id: &str, priority: u8) -> Task {
        Task {
            id: id.to_owned(),
            name: id.to_owned(),
            description: String::new(),
            priority,
            estimated_duration: None,
            payload: String::new(),
        }
    }

    fn plan(tasks: Vec<Task>, deps: &[(&str, &[&str])]) -> Plan {
        let mut dependencies = BTreeMap::new();
        for (id, ds) in deps {
            dependencies.insert(
                (*id).to_owned(),
                ds.iter().map(|d| (*d).to_owned()).collect::<BTreeSet<_>>(),
            );
        }
        Plan {
            tasks,
            dependencies,
            executor_budget: 4,
        }
    }

    fn ids(order: &[&Task]) -> Vec<String> {
        order.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn chain_orders_by_dependency() {
        let p = plan(
            vec![task("c", 3), task("b", 3), task("a", 3)],
            &[("b", &["a"]), ("c", &["b"])],
        );
        assert_eq!(ids(&topological_order(&p)), vec!["a", "b", "c"]);
    }

    #[test]
    fn independent_tasks_order_by_priority_then_insertion() {
        let p = plan(
            vec![task("low", 5), task("high", 1), task("mid", 3), task("mid2", 3)],
            &[],
        );
        assert_eq!(
            ids(&topological_order(&p)),
            vec!["high", "mid", "mid2", "low"]
        );
    }

    #[test]
    fn priority_breaks_ties_within_a_wave() {
        // a unlocks both; the higher-priority dependent comes first.
        let p = plan(
            vec![task("a", 3), task("slowpoke", 5), task("urgent", 1)],
            &[("slowpoke", &["a"]), ("urgent", &["a"])],
        );
        assert_eq!(ids(&topological_order(&p)), vec!["a", "urgent", "slowpoke"]);
    }

    #[test]
    fn diamond_is_complete_and_ends_with_join() {
        let p = plan(
            vec![task("a", 3), task("b", 3), task("c", 3), task("d", 3)],
            &[("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])],
        );
        let order = ids(&topological_order(&p));
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
    }

    #[test]
    fn direct_dependents_lookup() {
        let p = plan(
            vec![task("a", 3), task("b", 3), task("c", 3)],
            &[("b", &["a"]), ("c", &["a"])],
        );
        let idx = DependentsIndex::new(&p);
        let mut deps = idx.direct_dependents("a").to_vec();
        deps.sort();
        assert_eq!(deps, vec!["b", "c"]);
        assert!(idx.direct_dependents("c").is_empty());
    }

    #[test]
    fn transitive_dependents_follow_chains() {
        let p = plan(
            vec![task("a", 3), task("b", 3), task("c", 3), task("d", 3)],
            &[("b", &["a"]), ("c", &["b"]), ("d", &["c"])],
        );
        let idx = DependentsIndex::new(&p);
        let all = idx.transitive_dependents("a");
        assert_eq!(
            all.into_iter().collect::<Vec<_>>(),
            vec!["b".to_owned(), "c".to_owned(), "d".to_owned()]
        );
    }
}
