use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use weave_core::error::{Result, WeaveError};

use crate::definition::Step;

/// A step inside the graph.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub step: Step,
    /// Number of distinct dependencies recorded for this node.
    pub in_degree: usize,
}

/// Dependency graph over the steps of one scope.
///
/// Edges run from a dependent step to the step it depends on. Every
/// ordering the graph produces breaks ties by step id, so identical graphs
/// always yield identical orders and levels.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    nodes: BTreeMap<String, DagNode>,
    deps: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a validated graph from a list of steps.
    pub fn build(steps: &[Step]) -> Result<Self> {
        let mut dag = Self::new();
        for step in steps {
            dag.add_node(step.clone())?;
        }
        for step in steps {
            for dep in &step.depends_on {
                if !dag.contains(dep) {
                    return Err(WeaveError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dag.add_edge(&step.id, dep)?;
            }
        }
        dag.validate()?;
        Ok(dag)
    }

    pub fn add_node(&mut self, step: Step) -> Result<()> {
        if self.nodes.contains_key(&step.id) {
            return Err(WeaveError::DuplicateStep(step.id));
        }
        let id = step.id.clone();
        self.deps.insert(id.clone(), BTreeSet::new());
        self.dependents.insert(id.clone(), BTreeSet::new());
        self.nodes.insert(id, DagNode { step, in_degree: 0 });
        Ok(())
    }

    /// Record that `dependent` must run after `dependency`.
    ///
    /// Rejects the edge, leaving the graph untouched, if it would close a
    /// cycle. Adding an edge that already exists is a no-op.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) -> Result<()> {
        for id in [dependent, dependency] {
            if !self.contains(id) {
                return Err(WeaveError::UnknownStep(id.to_string()));
            }
        }
        if self.deps[dependent].contains(dependency) {
            return Ok(());
        }
        if let Some(path) = self.path(dependency, dependent) {
            return Err(WeaveError::Cycle { remaining: path });
        }
        self.insert_edge(dependent, dependency);
        Ok(())
    }

    fn insert_edge(&mut self, dependent: &str, dependency: &str) {
        let Some(deps) = self.deps.get_mut(dependent) else {
            return;
        };
        if !deps.insert(dependency.to_string()) {
            return;
        }
        if let Some(dependents) = self.dependents.get_mut(dependency) {
            dependents.insert(dependent.to_string());
        }
        if let Some(node) = self.nodes.get_mut(dependent) {
            node.in_degree += 1;
        }
    }

    /// Dependency chain from `from` to `to`, following dependency edges.
    fn path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut stack = vec![vec![from.to_string()]];
        let mut visited = BTreeSet::new();
        while let Some(path) = stack.pop() {
            let last = path.last().cloned().unwrap_or_default();
            if last == to {
                return Some(path);
            }
            if !visited.insert(last.clone()) {
                continue;
            }
            for next in self.deps[&last].iter().rev() {
                let mut p = path.clone();
                p.push(next.clone());
                stack.push(p);
            }
        }
        None
    }

    /// All step ids ordered so that each follows its dependencies.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.as_str(), node.in_degree))
            .collect();
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for dependent in &self.dependents[id] {
                if let Some(d) = in_degree.get_mut(dependent.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let remaining = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(WeaveError::Cycle { remaining });
        }
        Ok(order)
    }

    /// Steps grouped into levels; every step sits after all its dependencies.
    pub fn levels(&self) -> Vec<Vec<String>> {
        self.executable_groups(&BTreeSet::new())
    }

    /// Remaining levels given a set of already completed steps.
    pub fn executable_groups(&self, completed: &BTreeSet<String>) -> Vec<Vec<String>> {
        let mut done = completed.clone();
        let mut groups = Vec::new();
        loop {
            let level: Vec<String> = self
                .nodes
                .keys()
                .filter(|id| !done.contains(*id))
                .filter(|id| self.deps[*id].iter().all(|d| done.contains(d)))
                .cloned()
                .collect();
            if level.is_empty() {
                break;
            }
            done.extend(level.iter().cloned());
            groups.push(level);
        }
        groups
    }

    /// Steps that can run now: not completed, with every dependency completed.
    pub fn ready_steps(&self, completed: &BTreeSet<String>) -> Vec<String> {
        self.executable_groups(completed)
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    /// Check ordering and that every declared dependency resolves.
    pub fn validate(&self) -> Result<()> {
        self.topological_sort()?;
        for (id, node) in &self.nodes {
            for dep in &node.step.depends_on {
                if !self.nodes.contains_key(dep) {
                    return Err(WeaveError::UnknownDependency {
                        step: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.nodes.get(id).map(|n| &n.step)
    }

    pub fn dependencies(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.deps.get(id)
    }

    pub fn dependents(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.dependents.get(id)
    }

    /// Every step reachable from `id` by following dependents.
    pub fn downstream(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(cur) = stack.pop() {
            if let Some(next) = self.dependents.get(&cur) {
                for n in next {
                    if out.insert(n.clone()) {
                        stack.push(n.clone());
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Display for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.topological_sort() {
            Ok(order) => order,
            Err(e) => return writeln!(f, "invalid graph: {e}"),
        };
        for (i, id) in order.iter().enumerate() {
            let node = &self.nodes[id];
            write!(f, "{}. {} [{}]", i + 1, id, node.step.kind)?;
            let deps = &self.deps[id];
            if !deps.is_empty() {
                let list: Vec<&str> = deps.iter().map(String::as_str).collect();
                write!(f, " <- {}", list.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
