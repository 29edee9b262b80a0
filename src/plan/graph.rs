//! WorkflowGraph - DAG of planned tasks (Arc<str> ids)
//!
//! Edges are derived from task inputs whose source is another task. The
//! constructor validates the graph; a built `WorkflowGraph` is always acyclic
//! with every edge inside a single unit.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use super::{InputSource, Task, TaskId};
use crate::error::{DwiprocError, Result};
use crate::query::ProcessingUnit;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowGraph {
    tasks: Vec<Task>,
    /// task_id -> position in `tasks`
    positions: HashMap<TaskId, usize>,
    /// task_id -> successor task_ids
    adjacency: HashMap<TaskId, Vec<TaskId>>,
    /// task_id -> predecessor task_ids (dependencies)
    predecessors: HashMap<TaskId, Vec<TaskId>>,
}

impl WorkflowGraph {
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let capacity = tasks.len();
        let mut positions: HashMap<TaskId, usize> = HashMap::with_capacity(capacity);
        let mut adjacency: HashMap<TaskId, Vec<TaskId>> = HashMap::with_capacity(capacity);
        let mut predecessors: HashMap<TaskId, Vec<TaskId>> = HashMap::with_capacity(capacity);

        for (pos, task) in tasks.iter().enumerate() {
            if positions.insert(Arc::clone(&task.id), pos).is_some() {
                return Err(DwiprocError::DuplicateTask {
                    task_id: task.id.to_string(),
                });
            }
            adjacency.insert(Arc::clone(&task.id), Vec::new());
            predecessors.insert(Arc::clone(&task.id), Vec::new());
        }

        for task in &tasks {
            for input in task.inputs.values() {
                let InputSource::Task { id: upstream } = &input.source else {
                    continue;
                };
                let Some(&pos) = positions.get(upstream) else {
                    return Err(DwiprocError::InvalidEdge {
                        from: upstream.to_string(),
                        to: task.id.to_string(),
                        reason: "upstream task is not planned".to_string(),
                    });
                };
                if tasks[pos].unit != task.unit {
                    return Err(DwiprocError::InvalidEdge {
                        from: upstream.to_string(),
                        to: task.id.to_string(),
                        reason: "edges may not cross processing units".to_string(),
                    });
                }
                let deps = predecessors.entry(Arc::clone(&task.id)).or_default();
                if deps.contains(upstream) {
                    continue;
                }
                deps.push(Arc::clone(upstream));
                adjacency
                    .entry(Arc::clone(upstream))
                    .or_default()
                    .push(Arc::clone(&task.id));
            }
        }

        let graph = Self {
            tasks,
            positions,
            adjacency,
            predecessors,
        };
        if let Some(cycle) = graph.detect_cycle() {
            return Err(DwiprocError::CycleDetected { cycle });
        }
        Ok(graph)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.positions.get(task_id).map(|&pos| &self.tasks[pos])
    }

    /// Get dependencies of a task
    #[inline]
    pub fn get_dependencies(&self, task_id: &str) -> &[TaskId] {
        static EMPTY: &[TaskId] = &[];
        self.predecessors
            .get(task_id)
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    /// Get successors of a task
    #[inline]
    pub fn get_successors(&self, task_id: &str) -> &[TaskId] {
        static EMPTY: &[TaskId] = &[];
        self.adjacency
            .get(task_id)
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    /// Tasks with no downstream consumer
    #[cfg(test)]
    pub fn get_final_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| self.get_successors(&t.id).is_empty())
            .map(|t| Arc::clone(&t.id))
            .collect()
    }

    /// Check if there's a path from `from` to `to` (BFS)
    #[cfg(test)]
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        queue.push_back(from);
        visited.insert(from);

        while let Some(current) = queue.pop_front() {
            for neighbor in self.get_successors(current) {
                if neighbor.as_ref() == to {
                    return true;
                }
                if visited.insert(neighbor.as_ref()) {
                    queue.push_back(neighbor.as_ref());
                }
            }
        }

        false
    }

    /// All edges as (producer, consumer), in task order
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.tasks
            .iter()
            .flat_map(|t| {
                self.get_successors(&t.id)
                    .iter()
                    .map(move |succ| (Arc::clone(&t.id), Arc::clone(succ)))
            })
            .collect()
    }

    /// Kahn ordering; ties keep planning order
    pub fn topological_order(&self) -> Vec<&Task> {
        let mut indegree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_ref(), self.get_dependencies(&t.id).len()))
            .collect();
        let mut ready: VecDeque<&Task> = self
            .tasks
            .iter()
            .filter(|t| indegree[t.id.as_ref()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(task) = ready.pop_front() {
            order.push(task);
            for succ in self.get_successors(&task.id) {
                if let Some(degree) = indegree.get_mut(succ.as_ref()) {
                    *degree -= 1;
                    if *degree == 0 {
                        if let Some(next) = self.task(succ) {
                            ready.push_back(next);
                        }
                    }
                }
            }
        }
        order
    }

    /// Tasks grouped per unit, each group in dependency order
    ///
    /// Aggregate tasks (no unit) are grouped under `None`.
    pub fn unit_chains(&self) -> BTreeMap<Option<ProcessingUnit>, Vec<&Task>> {
        let mut chains: BTreeMap<Option<ProcessingUnit>, Vec<&Task>> = BTreeMap::new();
        for task in self.topological_order() {
            chains.entry(task.unit.clone()).or_default().push(task);
        }
        chains
    }

    /// Mermaid `graph TD` rendering
    pub fn to_mermaid(&self) -> String {
        let node = |id: &str| id.replace(['/', '-', '.'], "_");
        let mut out = String::from("graph TD\n");
        for task in &self.tasks {
            let label = if task.is_passthrough() {
                format!("{} (skipped)", task.id)
            } else {
                format!("{} [{}]", task.id, task.tool)
            };
            let _ = writeln!(out, "    {}[\"{}\"]", node(&task.id), label);
        }
        for (from, to) in self.edges() {
            let _ = writeln!(out, "    {} --> {}", node(&from), node(&to));
        }
        out
    }

    /// DFS with a recursion stack; returns the first cycle as `a → b → a`
    fn detect_cycle(&self) -> Option<String> {
        fn visit<'a>(
            node: &'a str,
            graph: &'a WorkflowGraph,
            visited: &mut HashSet<&'a str>,
            rec_stack: &mut HashSet<&'a str>,
            path: &mut Vec<&'a str>,
        ) -> Option<String> {
            visited.insert(node);
            rec_stack.insert(node);
            path.push(node);

            for neighbor in graph.get_successors(node) {
                let neighbor = neighbor.as_ref();
                if !visited.contains(neighbor) {
                    if let Some(cycle) = visit(neighbor, graph, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(neighbor) {
                    let start = path.iter().position(|&n| n == neighbor).unwrap_or(0);
                    return Some(format!("{} → {}", path[start..].join(" → "), neighbor));
                }
            }

            rec_stack.remove(node);
            path.pop();
            None
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        for task in &self.tasks {
            if !visited.contains(task.id.as_ref()) {
                if let Some(cycle) = visit(&task.id, self, &mut visited, &mut rec_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Step, TaskAction, TaskInput};
    use crate::tool::Tool;
    use std::path::PathBuf;

    fn unit(subject: &str) -> ProcessingUnit {
        ProcessingUnit::new(subject, None, None)
    }

    fn task(id: &str, unit: &ProcessingUnit, deps: &[&str]) -> Task {
        let mut task = Task::new(
            Some(unit.clone()),
            Step::Denoise,
            Tool::Mrtrix3,
            TaskAction::Passthrough,
            PathBuf::from("/work"),
        )
        .with_id(id);
        for dep in deps {
            task.inputs.insert(
                format!("from_{dep}"),
                TaskInput::from_task(format!("/work/{dep}.nii.gz"), Arc::from(*dep)),
            );
        }
        task
    }

    #[test]
    fn linear_chain_has_expected_shape() {
        let u = unit("001");
        let graph = WorkflowGraph::from_tasks(vec![
            task("a", &u, &[]),
            task("b", &u, &["a"]),
            task("c", &u, &["b"]),
        ])
        .unwrap();

        assert_eq!(graph.get_dependencies("b").len(), 1);
        assert_eq!(graph.get_successors("a")[0].as_ref(), "b");
        assert_eq!(graph.get_final_tasks(), vec![Arc::<str>::from("c")]);
        assert!(graph.has_path("a", "c"));
        assert!(!graph.has_path("c", "a"));
        let order: Vec<&str> = graph.topological_order().iter().map(|t| t.id.as_ref()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let u = unit("001");
        let err = WorkflowGraph::from_tasks(vec![task("a", &u, &[]), task("a", &u, &[])]).unwrap_err();
        assert!(matches!(err, DwiprocError::DuplicateTask { .. }));
    }

    #[test]
    fn dangling_and_cross_unit_edges_are_rejected() {
        let u1 = unit("001");
        let u2 = unit("002");
        let err = WorkflowGraph::from_tasks(vec![task("b", &u1, &["ghost"])]).unwrap_err();
        assert!(matches!(err, DwiprocError::InvalidEdge { .. }));

        let err = WorkflowGraph::from_tasks(vec![task("a", &u1, &[]), task("b", &u2, &["a"])])
            .unwrap_err();
        assert!(err.to_string().contains("cross processing units"));
    }

    #[test]
    fn cycles_are_rejected() {
        let u = unit("001");
        let err = WorkflowGraph::from_tasks(vec![task("a", &u, &["b"]), task("b", &u, &["a"])])
            .unwrap_err();
        match err {
            DwiprocError::CycleDetected { cycle } => assert!(cycle.contains("a → b")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn chains_group_by_unit() {
        let (u1, u2) = (unit("001"), unit("002"));
        let graph = WorkflowGraph::from_tasks(vec![
            task("x/a", &u1, &[]),
            task("y/a", &u2, &[]),
            task("x/b", &u1, &["x/a"]),
        ])
        .unwrap();
        let chains = graph.unit_chains();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[&Some(u1)].len(), 2);
        assert!(graph.to_mermaid().contains("x_a --> x_b"));
    }
}
