//! `DependencyGraph` implementation backed by `petgraph`.
//!
//! `add_edge` inserts tentatively, checks for a cycle with a DFS from the
//! new edge's source, and rolls back on rejection — the graph is left
//! byte-identical to its pre-call state on `WouldCycle`.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use std::collections::HashMap;
use task_queue_common::error::{Error, Result};
use task_queue_common::ids::{EdgeId, TaskId};
use task_queue_core::graph::{CriticalPath, DependencyGraph};
use task_queue_core::types::{DependencyEdge, EdgeKind, Priority, Task, TaskStatus};

#[derive(Debug, Clone, Copy)]
struct EdgeWeight {
    id: EdgeId,
    kind: EdgeKind,
    weight: f64,
}

/// `petgraph`-backed implementation of `DependencyGraph`.
pub struct PetgraphDependencyGraph {
    graph: DiGraph<TaskId, EdgeWeight>,
    nodes: HashMap<TaskId, NodeIndex>,
    edges: HashMap<EdgeId, EdgeIndex>,
}

impl Default for PetgraphDependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PetgraphDependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    fn edge_to_dependency(&self, edge_idx: EdgeIndex) -> Option<DependencyEdge> {
        let (from_idx, to_idx) = self.graph.edge_endpoints(edge_idx)?;
        let weight = *self.graph.edge_weight(edge_idx)?;
        Some(DependencyEdge {
            id: weight.id,
            from: *self.graph.node_weight(from_idx)?,
            to: *self.graph.node_weight(to_idx)?,
            kind: weight.kind,
            weight: weight.weight,
        })
    }
}

impl DependencyGraph for PetgraphDependencyGraph {
    fn add_task(&mut self, task_id: TaskId) -> Result<()> {
        if self.nodes.contains_key(&task_id) {
            return Err(Error::DuplicateId(task_id.to_string()));
        }
        let idx = self.graph.add_node(task_id);
        self.nodes.insert(task_id, idx);
        Ok(())
    }

    fn remove_task(&mut self, task_id: TaskId) -> Result<()> {
        let idx = self
            .nodes
            .remove(&task_id)
            .ok_or_else(|| Error::UnknownId(task_id.to_string()))?;

        let stale_edges: Vec<EdgeId> = self
            .graph
            .edges(idx)
            .chain(self.graph.edges_directed(idx, Direction::Incoming))
            .map(|e| e.weight().id)
            .collect();
        for edge_id in stale_edges {
            self.edges.remove(&edge_id);
        }

        self.graph.remove_node(idx);
        // `petgraph` swap-removes the last node on `remove_node`, invalidating
        // whichever index used to point at it; re-sync the map.
        self.nodes = self
            .graph
            .node_indices()
            .map(|i| (self.graph[i], i))
            .collect();
        Ok(())
    }

    fn clear(&mut self) {
        self.graph = DiGraph::new();
        self.nodes.clear();
        self.edges.clear();
    }

    fn add_edge(
        &mut self,
        from: TaskId,
        to: TaskId,
        kind: EdgeKind,
        weight: f64,
    ) -> Result<EdgeId> {
        if from == to {
            return Err(Error::SelfLoop(from.to_string()));
        }
        let from_idx = *self
            .nodes
            .get(&from)
            .ok_or_else(|| Error::UnknownId(from.to_string()))?;
        let to_idx = *self
            .nodes
            .get(&to)
            .ok_or_else(|| Error::UnknownId(to.to_string()))?;

        let edge_id = EdgeId::new();
        let edge_idx = self.graph.add_edge(
            from_idx,
            to_idx,
            EdgeWeight {
                id: edge_id,
                kind,
                weight,
            },
        );

        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge_idx);
            return Err(Error::WouldCycle(format!("{from} -> {to}")));
        }

        self.edges.insert(edge_id, edge_idx);
        Ok(edge_id)
    }

    fn remove_edge(&mut self, edge_id: EdgeId) {
        if let Some(idx) = self.edges.remove(&edge_id) {
            self.graph.remove_edge(idx);
            // `remove_edge` swaps in the last edge index; re-sync.
            self.edges = self
                .graph
                .edge_indices()
                .map(|i| (self.graph[i].id, i))
                .collect();
        }
    }

    fn predecessors(&self, task_id: TaskId) -> Vec<DependencyEdge> {
        let Some(&idx) = self.nodes.get(&task_id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .filter_map(|e| self.edge_to_dependency(e.id()))
            .collect()
    }

    fn successors(&self, task_id: TaskId) -> Vec<DependencyEdge> {
        let Some(&idx) = self.nodes.get(&task_id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .filter_map(|e| self.edge_to_dependency(e.id()))
            .collect()
    }

    fn is_ready(
        &self,
        task_id: TaskId,
        status_of: &dyn Fn(TaskId) -> Option<TaskStatus>,
    ) -> bool {
        self.predecessors(task_id)
            .into_iter()
            .filter(|edge| edge.kind.is_gating())
            .all(|edge| matches!(status_of(edge.from), Some(TaskStatus::Completed)))
    }

    fn levels(&self) -> Vec<Vec<TaskId>> {
        let mut level_of: HashMap<TaskId, usize> = HashMap::new();
        let mut topo = Topo::new(&self.graph);
        while let Some(idx) = topo.next(&self.graph) {
            let task_id = self.graph[idx];
            let level = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .filter(|e| e.weight().kind.is_gating())
                .filter_map(|e| level_of.get(&self.graph[e.source()]))
                .max()
                .map_or(0, |l| l + 1);
            level_of.insert(task_id, level);
        }

        let mut levels: Vec<Vec<TaskId>> = Vec::new();
        for (task_id, level) in level_of {
            if levels.len() <= level {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(task_id);
        }
        for bucket in &mut levels {
            bucket.sort();
        }
        levels
    }

    fn critical_path(
        &self,
        duration_of: &dyn Fn(TaskId) -> u64,
        priority_of: &dyn Fn(TaskId) -> Priority,
    ) -> CriticalPath {
        let mut best_ms: HashMap<TaskId, u64> = HashMap::new();
        let mut best_pred: HashMap<TaskId, Option<TaskId>> = HashMap::new();
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::new();
        while let Some(idx) = topo.next(&self.graph) {
            order.push(idx);
        }

        for &idx in &order {
            let task_id = self.graph[idx];
            let own_duration = duration_of(task_id);
            let mut best: Option<(u64, TaskId)> = None;
            for edge in self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .filter(|e| e.weight().kind.is_gating())
            {
                let pred_id = self.graph[edge.source()];
                let pred_total = *best_ms.get(&pred_id).unwrap_or(&0);
                let candidate = (pred_total, pred_id);
                best = match best {
                    None => Some(candidate),
                    Some((cur_ms, cur_id)) => {
                        if pred_total > cur_ms
                            || (pred_total == cur_ms
                                && (priority_of(pred_id), std::cmp::Reverse(pred_id))
                                    > (priority_of(cur_id), std::cmp::Reverse(cur_id)))
                        {
                            Some(candidate)
                        } else {
                            Some((cur_ms, cur_id))
                        }
                    }
                };
            }
            let (pred_ms, pred_id) = best.map_or((0, None), |(ms, id)| (ms, Some(id)));
            best_ms.insert(task_id, pred_ms + own_duration);
            best_pred.insert(task_id, pred_id);
        }

        let Some((&end_task, &total_ms)) = best_ms
            .iter()
            .max_by_key(|(id, ms)| (**ms, priority_of(**id), std::cmp::Reverse(**id)))
        else {
            return CriticalPath::default();
        };

        let mut nodes = vec![end_task];
        let mut cursor = end_task;
        while let Some(Some(pred)) = best_pred.get(&cursor) {
            nodes.push(*pred);
            cursor = *pred;
        }
        nodes.reverse();

        CriticalPath { nodes, total_ms }
    }

    fn cycles(&self) -> Vec<Vec<TaskId>> {
        if !is_cyclic_directed(&self.graph) {
            return Vec::new();
        }
        // Diagnostics-only path; a healthy graph never reaches this branch
        // because `add_edge` rejects anything that would make it cyclic.
        let sccs = petgraph::algo::kosaraju_scc(&self.graph);
        sccs.into_iter()
            .filter(|scc| scc.len() > 1)
            .map(|scc| scc.into_iter().map(|idx| self.graph[idx]).collect())
            .collect()
    }

    fn contains(&self, task_id: TaskId) -> bool {
        self.nodes.contains_key(&task_id)
    }

    fn task_ids(&self) -> Vec<TaskId> {
        self.nodes.keys().copied().collect()
    }
}

/// `TaskLookup` backed by a plain id -> `Task` map, used where the graph
/// needs to read task data it does not own (priority, duration, status).
pub struct MapTaskLookup {
    tasks: HashMap<TaskId, Task>,
}

impl MapTaskLookup {
    #[must_use]
    pub fn new(tasks: HashMap<TaskId, Task>) -> Self {
        Self { tasks }
    }
}

impl task_queue_core::graph::TaskLookup for MapTaskLookup {
    fn get(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.get(&task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_queue_common::IdGen;

    fn ids(n: usize) -> Vec<TaskId> {
        let gen = task_queue_common::ids::UuidGen;
        (0..n).map(|_| gen.task_id()).collect()
    }

    #[test]
    fn rejects_self_loop() {
        let mut graph = PetgraphDependencyGraph::new();
        let t = ids(1)[0];
        graph.add_task(t).unwrap();
        assert!(matches!(
            graph.add_edge(t, t, EdgeKind::Hard, 1.0),
            Err(Error::SelfLoop(_))
        ));
    }

    #[test]
    fn rejects_cycle_and_leaves_graph_unchanged() {
        let mut graph = PetgraphDependencyGraph::new();
        let t = ids(2);
        graph.add_task(t[0]).unwrap();
        graph.add_task(t[1]).unwrap();
        graph.add_edge(t[0], t[1], EdgeKind::Hard, 1.0).unwrap();

        let before = graph.successors(t[0]).len() + graph.successors(t[1]).len();
        let result = graph.add_edge(t[1], t[0], EdgeKind::Hard, 1.0);
        assert!(matches!(result, Err(Error::WouldCycle(_))));
        let after = graph.successors(t[0]).len() + graph.successors(t[1]).len();
        assert_eq!(before, after);
    }

    #[test]
    fn levels_respect_only_hard_edges() {
        let mut graph = PetgraphDependencyGraph::new();
        let t = ids(3);
        for id in &t {
            graph.add_task(*id).unwrap();
        }
        graph.add_edge(t[0], t[1], EdgeKind::Hard, 1.0).unwrap();
        graph.add_edge(t[0], t[2], EdgeKind::Soft, 1.0).unwrap();

        let levels = graph.levels();
        assert!(levels[0].contains(&t[0]));
        assert!(levels[0].contains(&t[2]));
        assert!(levels[1].contains(&t[1]));
    }

    #[test]
    fn critical_path_sums_durations_along_hard_chain() {
        let mut graph = PetgraphDependencyGraph::new();
        let t = ids(3);
        for id in &t {
            graph.add_task(*id).unwrap();
        }
        graph.add_edge(t[0], t[1], EdgeKind::Hard, 1.0).unwrap();
        graph.add_edge(t[1], t[2], EdgeKind::Hard, 1.0).unwrap();

        let durations: HashMap<TaskId, u64> =
            t.iter().map(|id| (*id, 100)).collect();
        let path = graph.critical_path(
            &|id| *durations.get(&id).unwrap(),
            &|_| Priority::Normal,
        );
        assert_eq!(path.total_ms, 300);
        assert_eq!(path.nodes, vec![t[0], t[1], t[2]]);
    }

    #[test]
    fn critical_path_tie_break_prefers_higher_priority_endpoint() {
        let mut graph = PetgraphDependencyGraph::new();
        let t = ids(4);
        for id in &t {
            graph.add_task(*id).unwrap();
        }
        // Two parallel chains of equal total duration, rooted at t[0]:
        // t[0] -> t[1] (low) and t[0] -> t[2] -> t[3] collapses both endpoints
        // to the same total_ms via t[1] (low) and t[2] (critical) as siblings.
        graph.add_edge(t[0], t[1], EdgeKind::Hard, 1.0).unwrap();
        graph.add_edge(t[0], t[2], EdgeKind::Hard, 1.0).unwrap();

        let durations: HashMap<TaskId, u64> = t.iter().map(|id| (*id, 100)).collect();
        let priorities: HashMap<TaskId, Priority> = [
            (t[0], Priority::Normal),
            (t[1], Priority::Low),
            (t[2], Priority::Critical),
        ]
        .into_iter()
        .collect();

        let path = graph.critical_path(
            &|id| *durations.get(&id).unwrap(),
            &|id| *priorities.get(&id).unwrap_or(&Priority::Normal),
        );
        assert_eq!(path.total_ms, 200);
        assert_eq!(*path.nodes.last().unwrap(), t[2]);
    }
}
