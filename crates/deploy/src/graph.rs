//! Dependency ordering of deployment tasks.

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::task::DeploymentTask;

/// Errors found while building or ordering the task graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The path lists dependents before their dependencies and repeats its first node last.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("task `{task}` depends on unknown task `{dependency}`")]
    UnknownDependency { task: String, dependency: String },
    #[error("task `{0}` is declared more than once")]
    DuplicateTask(String),
    /// Names become file names in the deployment registry.
    #[error("task name `{0}` must be non-empty, must not start with `.` and must not contain path separators")]
    InvalidName(String),
}

/// Directed graph over deployment tasks, edges pointing from a task to its dependencies.
#[derive(Debug)]
pub struct ScriptDependencyGraph<'a> {
    tasks: &'a [DeploymentTask],
    /// Dependency indices of each task, in declaration order.
    edges: Vec<Vec<usize>>,
}

impl<'a> ScriptDependencyGraph<'a> {
    /// Build the graph and reject unknown dependencies, duplicate names and cycles.
    pub fn build(tasks: &'a [DeploymentTask]) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if !is_valid_name(&task.name) {
                return Err(GraphError::InvalidName(task.name.clone()));
            }
            if index.insert(task.name.as_str(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.name.clone()));
            }
        }

        let edges = tasks
            .iter()
            .map(|task| {
                task.all_dependencies()
                    .into_iter()
                    .map(|dependency| {
                        index
                            .get(dependency)
                            .copied()
                            .ok_or_else(|| GraphError::UnknownDependency {
                                task: task.name.clone(),
                                dependency: dependency.to_string(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let graph = Self { tasks, edges };

        // A cycle anywhere in the declarations fails the run, selected or not.
        graph.order(&(0..tasks.len()).collect())?;

        Ok(graph)
    }

    /// Indices of the tasks carrying any of `tags`, plus their transitive dependencies.
    ///
    /// An empty tag list selects every task.
    pub fn select(&self, tags: &[String]) -> BTreeSet<usize> {
        if tags.is_empty() {
            return (0..self.tasks.len()).collect();
        }

        let mut selected = BTreeSet::new();
        let mut stack: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.tags.iter().any(|tag| tags.contains(tag)))
            .map(|(i, _)| i)
            .collect();

        while let Some(i) = stack.pop() {
            if selected.insert(i) {
                stack.extend(self.edges[i].iter().copied());
            }
        }

        selected
    }

    /// Topological order of the selected tasks, dependencies first.
    ///
    /// Among tasks that are ready at the same time, the one declared first goes first.
    pub fn order(&self, selected: &BTreeSet<usize>) -> Result<Vec<&'a DeploymentTask>, GraphError> {
        let mut pending: HashMap<usize, usize> = selected
            .iter()
            .map(|&i| {
                let count = self.edges[i].iter().filter(|d| selected.contains(d)).count();
                (i, count)
            })
            .collect();

        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in selected {
            for &dependency in &self.edges[i] {
                if selected.contains(&dependency) {
                    dependents.entry(dependency).or_default().push(i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&i, _)| i)
            .collect();

        let mut ordered = Vec::with_capacity(selected.len());
        while let Some(i) = ready.pop_first() {
            pending.remove(&i);
            ordered.push(&self.tasks[i]);

            for &dependent in dependents.get(&i).into_iter().flatten() {
                if let Some(count) = pending.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if !pending.is_empty() {
            let remaining: HashSet<usize> = pending.into_keys().collect();
            return Err(GraphError::Cycle(self.find_cycle(&remaining)));
        }

        Ok(ordered)
    }

    /// Select by tags and order in one go.
    pub fn plan(&self, tags: &[String]) -> Result<Vec<&'a DeploymentTask>, GraphError> {
        self.order(&self.select(tags))
    }

    /// Walk dependency edges inside `remaining` until a node repeats.
    ///
    /// Every node left over by the topological sort has at least one dependency that is
    /// also left over, so the walk cannot dead-end.
    fn find_cycle(&self, remaining: &HashSet<usize>) -> Vec<String> {
        let Some(&start) = remaining.iter().min() else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(&next) = self.edges[current].iter().find(|d| remaining.contains(d)) else {
                break;
            };

            if let Some(position) = path.iter().position(|&node| node == next) {
                let mut cycle: Vec<String> = path[position..]
                    .iter()
                    .map(|&i| self.tasks[i].name.clone())
                    .collect();
                cycle.push(self.tasks[next].name.clone());
                return cycle;
            }

            path.push(next);
            current = next;
        }

        path.iter().map(|&i| self.tasks[i].name.clone()).collect()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\', '\0'])
}
