//! C4 — in-memory DAG dependency engine.
//!
//! Maintains an adjacency representation synchronized with the store's
//! `task_dependencies` rows. Holds no database handle and performs no I/O;
//! callers (the scheduler) are responsible for keeping it in sync with C1 by
//! calling `add_task`/`add_dependency`/`update_task_state`/`remove_task`
//! alongside the corresponding store writes.
//!
//! Single-writer/multi-reader: every mutating method takes the exclusive
//! write lock, every read-only method the shared read lock.

use crate::error::{CoreError, CoreResult};
use crate::store::model::DependencyKind;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: String,
    pub priority: i64,
    pub created_at: i64,
    /// One of the task states from the store; only `COMPLETED` hard
    /// predecessors count as satisfied.
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub cycles: Vec<Vec<String>>,
    pub missing_dependencies: Vec<(String, String)>,
    pub orphaned_tasks: Vec<String>,
    pub sorted_tasks: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_tasks: usize,
    pub hard_edges: usize,
    pub soft_edges: usize,
    pub max_depth: usize,
    pub cyclic_components: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedTask {
    pub id: String,
    pub waiting_on: Vec<String>,
}

#[derive(Default)]
struct DagInner {
    nodes: HashMap<String, TaskNode>,
    /// task_id -> set of hard predecessors (must COMPLETE first)
    hard_preds: HashMap<String, HashSet<String>>,
    /// predecessor_id -> set of hard dependents
    hard_succs: HashMap<String, HashSet<String>>,
    soft_preds: HashMap<String, HashSet<String>>,
    soft_succs: HashMap<String, HashSet<String>>,
    cache: Option<(u64, ValidationReport)>,
}

impl DagInner {
    fn edge_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        let mut edges: Vec<(&str, &str)> = self
            .hard_preds
            .iter()
            .flat_map(|(t, preds)| preds.iter().map(move |p| (p.as_str(), t.as_str())))
            .collect();
        edges.sort_unstable();
        let mut states: Vec<(&str, &str)> = self
            .nodes
            .iter()
            .map(|(id, n)| (id.as_str(), n.state.as_str()))
            .collect();
        states.sort_unstable();

        let mut hasher = DefaultHasher::new();
        edges.hash(&mut hasher);
        states.hash(&mut hasher);
        hasher.finish()
    }

    fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Reachability probe: is `target` reachable from `start` by following
    /// hard successor edges?
    fn reachable_via_hard_succs(&self, start: &str, target: &str) -> bool {
        if start == target {
            return true;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![start.to_string()];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(succs) = self.hard_succs.get(&node) {
                for s in succs {
                    if s == target {
                        return true;
                    }
                    stack.push(s.clone());
                }
            }
        }
        false
    }

    fn three_color_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut color: HashMap<&str, Color> = self
            .nodes
            .keys()
            .map(|k| (k.as_str(), Color::White))
            .collect();
        let mut cycles = Vec::new();

        // Iterative DFS tracking the path stack so we can slice out the cycle.
        fn visit<'a>(
            node: &'a str,
            inner: &'a DagInner,
            color: &mut HashMap<&'a str, Color>,
            path: &mut Vec<&'a str>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            color.insert(node, Color::Grey);
            path.push(node);
            if let Some(succs) = inner.hard_succs.get(node) {
                for succ in succs {
                    let succ: &str = succ.as_str();
                    match color.get(succ).copied().unwrap_or(Color::White) {
                        Color::White => visit(succ, inner, color, path, cycles),
                        Color::Grey => {
                            let start = path.iter().position(|n| *n == succ).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|s| s.to_string()).collect();
                            cycle.push(succ.to_string());
                            cycles.push(cycle);
                        }
                        Color::Black => {}
                    }
                }
            }
            path.pop();
            color.insert(node, Color::Black);
        }

        let mut keys: Vec<&str> = self.nodes.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        for key in keys {
            if color.get(key).copied().unwrap_or(Color::White) == Color::White {
                let mut path = Vec::new();
                visit(key, self, &mut color, &mut path, &mut cycles);
            }
        }
        cycles
    }

    fn kahn_sort(&self) -> Vec<String> {
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|k| (k.as_str(), self.hard_preds.get(k).map(|s| s.len()).unwrap_or(0)))
            .collect();

        let tie_break = |id: &str| -> (i64, i64, String) {
            let node = &self.nodes[id];
            (node.priority, node.created_at, id.to_string())
        };

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(k, _)| *k)
            .collect();
        ready.sort_by_key(|a| tie_break(a));
        let mut ready: VecDeque<&str> = ready.into();

        let mut out = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_front() {
            out.push(node.to_string());
            if let Some(succs) = self.hard_succs.get(node) {
                let mut newly_ready = Vec::new();
                for succ in succs {
                    if let Some(d) = indegree.get_mut(succ.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            newly_ready.push(succ.as_str());
                        }
                    }
                }
                newly_ready.sort_by_key(|a| tie_break(a));
                let mut merged: Vec<&str> = ready.iter().copied().chain(newly_ready).collect();
                merged.sort_by_key(|a| tie_break(a));
                ready = merged.into();
            }
        }
        out
    }
}

pub struct DagEngine {
    inner: RwLock<DagInner>,
}

impl Default for DagEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DagEngine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DagInner::default()),
        }
    }

    pub fn add_task(&self, node: TaskNode) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.insert(node.id.clone(), node);
        inner.invalidate();
    }

    pub fn update_task_state(&self, id: &str, state: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(node) = inner.nodes.get_mut(id) {
            node.state = state.to_string();
        }
        inner.invalidate();
    }

    /// Removes a task and every incident edge (hard and soft).
    pub fn remove_task(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.remove(id);

        if let Some(preds) = inner.hard_preds.remove(id) {
            for p in preds {
                if let Some(s) = inner.hard_succs.get_mut(&p) {
                    s.remove(id);
                }
            }
        }
        if let Some(succs) = inner.hard_succs.remove(id) {
            for s in succs {
                if let Some(p) = inner.hard_preds.get_mut(&s) {
                    p.remove(id);
                }
            }
        }
        if let Some(preds) = inner.soft_preds.remove(id) {
            for p in preds {
                if let Some(s) = inner.soft_succs.get_mut(&p) {
                    s.remove(id);
                }
            }
        }
        if let Some(succs) = inner.soft_succs.remove(id) {
            for s in succs {
                if let Some(p) = inner.soft_preds.get_mut(&s) {
                    p.remove(id);
                }
            }
        }
        inner.invalidate();
    }

    /// `task` depends on `predecessor`: `predecessor` must COMPLETE before
    /// `task` becomes executable.
    pub fn add_dependency(
        &self,
        task: &str,
        predecessor: &str,
        kind: DependencyKind,
    ) -> CoreResult<()> {
        if task == predecessor {
            return Err(CoreError::WouldCycle(format!(
                "task {task} cannot depend on itself"
            )));
        }
        let mut inner = self.inner.write().unwrap();
        if kind == DependencyKind::Hard && inner.reachable_via_hard_succs(task, predecessor) {
            return Err(CoreError::WouldCycle(format!(
                "adding {predecessor} -> {task} would create a cycle"
            )));
        }
        match kind {
            DependencyKind::Hard => {
                inner
                    .hard_preds
                    .entry(task.to_string())
                    .or_default()
                    .insert(predecessor.to_string());
                inner
                    .hard_succs
                    .entry(predecessor.to_string())
                    .or_default()
                    .insert(task.to_string());
            }
            DependencyKind::Soft => {
                inner
                    .soft_preds
                    .entry(task.to_string())
                    .or_default()
                    .insert(predecessor.to_string());
                inner
                    .soft_succs
                    .entry(predecessor.to_string())
                    .or_default()
                    .insert(task.to_string());
            }
        }
        inner.invalidate();
        Ok(())
    }

    pub fn remove_dependency(&self, task: &str, predecessor: &str, kind: DependencyKind) {
        let mut inner = self.inner.write().unwrap();
        match kind {
            DependencyKind::Hard => {
                if let Some(s) = inner.hard_preds.get_mut(task) {
                    s.remove(predecessor);
                }
                if let Some(s) = inner.hard_succs.get_mut(predecessor) {
                    s.remove(task);
                }
            }
            DependencyKind::Soft => {
                if let Some(s) = inner.soft_preds.get_mut(task) {
                    s.remove(predecessor);
                }
                if let Some(s) = inner.soft_succs.get_mut(predecessor) {
                    s.remove(task);
                }
            }
        }
        inner.invalidate();
    }

    /// Pure predicate — does not mutate the graph.
    pub fn would_create_cycle(&self, task: &str, predecessor: &str) -> bool {
        if task == predecessor {
            return true;
        }
        let inner = self.inner.read().unwrap();
        inner.reachable_via_hard_succs(task, predecessor)
    }

    pub fn validate(&self) -> ValidationReport {
        let hash = {
            let inner = self.inner.read().unwrap();
            if let Some((cached_hash, report)) = &inner.cache {
                let current = inner.edge_hash();
                if *cached_hash == current {
                    return report.clone();
                }
            }
            inner.edge_hash()
        };

        let mut inner = self.inner.write().unwrap();
        let cycles = inner.three_color_cycles();
        let is_acyclic = cycles.is_empty();
        let sorted_tasks = if is_acyclic {
            inner.kahn_sort()
        } else {
            Vec::new()
        };

        let mut missing_dependencies = Vec::new();
        for (task, preds) in inner.hard_preds.iter().chain(inner.soft_preds.iter()) {
            for pred in preds {
                if !inner.nodes.contains_key(pred) {
                    missing_dependencies.push((task.clone(), pred.clone()));
                }
            }
        }
        missing_dependencies.sort();

        let mut orphaned_tasks: Vec<String> = inner
            .nodes
            .keys()
            .filter(|id| {
                let no_hard_preds = inner.hard_preds.get(*id).map(|s| s.is_empty()).unwrap_or(true);
                let no_hard_succs = inner.hard_succs.get(*id).map(|s| s.is_empty()).unwrap_or(true);
                let no_soft_preds = inner.soft_preds.get(*id).map(|s| s.is_empty()).unwrap_or(true);
                let no_soft_succs = inner.soft_succs.get(*id).map(|s| s.is_empty()).unwrap_or(true);
                no_hard_preds && no_hard_succs && no_soft_preds && no_soft_succs
            })
            .cloned()
            .collect();
        orphaned_tasks.sort();

        let mut errors = Vec::new();
        for cycle in &cycles {
            errors.push(format!("cycle detected: {}", cycle.join(" -> ")));
        }
        for (task, pred) in &missing_dependencies {
            errors.push(format!("task {task} depends on unknown task {pred}"));
        }

        let report = ValidationReport {
            is_valid: is_acyclic && missing_dependencies.is_empty(),
            cycles,
            missing_dependencies,
            orphaned_tasks,
            sorted_tasks,
            errors,
        };

        inner.cache = Some((hash, report.clone()));
        report
    }

    /// Every task whose own state is `READY` and whose hard predecessors
    /// are all `COMPLETED`. Soft dependencies are ignored.
    pub fn executable_tasks(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<String> = inner
            .nodes
            .values()
            .filter(|n| n.state == "READY")
            .filter(|n| {
                inner
                    .hard_preds
                    .get(&n.id)
                    .map(|preds| {
                        preds
                            .iter()
                            .all(|p| inner.nodes.get(p).map(|pn| pn.state == "COMPLETED").unwrap_or(false))
                    })
                    .unwrap_or(true)
            })
            .map(|n| n.id.clone())
            .collect();
        out.sort_by(|a, b| {
            let na = &inner.nodes[a];
            let nb = &inner.nodes[b];
            (-na.priority, na.created_at, a.clone()).cmp(&(-nb.priority, nb.created_at, b.clone()))
        });
        out
    }

    /// Tasks with at least one hard predecessor not yet `COMPLETED`.
    pub fn blocked_tasks(&self, state_filter: Option<&str>) -> Vec<BlockedTask> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<BlockedTask> = inner
            .nodes
            .values()
            .filter(|n| state_filter.map(|f| n.state == f).unwrap_or(true))
            .filter_map(|n| {
                let waiting_on: Vec<String> = inner
                    .hard_preds
                    .get(&n.id)
                    .into_iter()
                    .flatten()
                    .filter(|p| {
                        inner.nodes.get(*p).map(|pn| pn.state != "COMPLETED").unwrap_or(true)
                    })
                    .cloned()
                    .collect();
                if waiting_on.is_empty() {
                    None
                } else {
                    Some(BlockedTask {
                        id: n.id.clone(),
                        waiting_on,
                    })
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.read().unwrap();
        let hard_edges: usize = inner.hard_preds.values().map(|s| s.len()).sum();
        let soft_edges: usize = inner.soft_preds.values().map(|s| s.len()).sum();
        let cycles = inner.three_color_cycles();

        let mut depth_cache: HashMap<&str, usize> = HashMap::new();
        fn depth_of<'a>(
            id: &'a str,
            inner: &'a DagInner,
            cache: &mut HashMap<&'a str, usize>,
            visiting: &mut HashSet<&'a str>,
        ) -> usize {
            if let Some(d) = cache.get(id) {
                return *d;
            }
            if !visiting.insert(id) {
                return 0; // inside a cycle; don't recurse forever
            }
            let preds = inner.hard_preds.get(id);
            let d = match preds {
                Some(p) if !p.is_empty() => {
                    1 + p
                        .iter()
                        .map(|p| depth_of(p, inner, cache, visiting))
                        .max()
                        .unwrap_or(0)
                }
                _ => 0,
            };
            visiting.remove(id);
            cache.insert(id, d);
            d
        }
        let max_depth = inner
            .nodes
            .keys()
            .map(|id| depth_of(id, &inner, &mut depth_cache, &mut HashSet::new()))
            .max()
            .unwrap_or(0);

        Statistics {
            total_tasks: inner.nodes.len(),
            hard_edges,
            soft_edges,
            max_depth,
            cyclic_components: cycles.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, priority: i64, created_at: i64, state: &str) -> TaskNode {
        TaskNode {
            id: id.to_string(),
            priority,
            created_at,
            state: state.to_string(),
        }
    }

    #[test]
    fn self_loop_rejected() {
        let dag = DagEngine::new();
        dag.add_task(node("a", 0, 0, "READY"));
        let err = dag.add_dependency("a", "a", DependencyKind::Hard).unwrap_err();
        assert!(matches!(err, CoreError::WouldCycle(_)));
    }

    #[test]
    fn direct_cycle_rejected() {
        let dag = DagEngine::new();
        dag.add_task(node("a", 0, 0, "READY"));
        dag.add_task(node("b", 0, 0, "READY"));
        dag.add_dependency("a", "b", DependencyKind::Hard).unwrap();
        let err = dag.add_dependency("b", "a", DependencyKind::Hard).unwrap_err();
        assert!(matches!(err, CoreError::WouldCycle(_)));
    }

    #[test]
    fn executable_tasks_respect_hard_deps_only() {
        let dag = DagEngine::new();
        dag.add_task(node("a", 0, 0, "COMPLETED"));
        dag.add_task(node("b", 0, 1, "READY"));
        dag.add_task(node("c", 0, 2, "READY"));
        dag.add_dependency("b", "a", DependencyKind::Hard).unwrap();
        dag.add_dependency("c", "a", DependencyKind::Soft).unwrap();
        // b's hard predecessor is COMPLETED, c has only a soft dep — both executable.
        let exec = dag.executable_tasks();
        assert_eq!(exec, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn validate_reports_deterministic_topo_order() {
        let dag = DagEngine::new();
        dag.add_task(node("c", 1, 3, "PENDING"));
        dag.add_task(node("b", 1, 2, "PENDING"));
        dag.add_task(node("a", 1, 1, "PENDING"));
        dag.add_dependency("b", "a", DependencyKind::Hard).unwrap();
        dag.add_dependency("c", "b", DependencyKind::Hard).unwrap();

        let report = dag.validate();
        assert!(report.is_valid);
        assert_eq!(report.sorted_tasks, vec!["a", "b", "c"]);
    }

    #[test]
    fn validate_is_cached_between_mutations() {
        let dag = DagEngine::new();
        dag.add_task(node("a", 0, 0, "READY"));
        let first = dag.validate();
        let second = dag.validate();
        assert_eq!(first, second);
    }
}
