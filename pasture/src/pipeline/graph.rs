//! The dependency graph between steps.

use std::collections::{HashMap, HashSet};

use crate::errors::{CycleDetectedError, ErrorInfo, PipelineValidationError};

/// Step names and their "depends on" edges.
///
/// Declaration order is kept so topological ordering is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate names or a step depending on itself.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        dependencies: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), PipelineValidationError> {
        let name = name.into();
        if self.dependencies.contains_key(&name) {
            return Err(PipelineValidationError::new(format!("Duplicate step name '{name}'"))
                .with_steps(vec![name.clone()])
                .with_error_info(
                    ErrorInfo::new("PIPELINE-DUPLICATE", format!("Step '{name}' is declared twice"))
                        .with_fix_hint("Give every step a unique name."),
                ));
        }

        let mut deps: Vec<String> = Vec::new();
        for dep in dependencies {
            let dep = dep.into();
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        if deps.contains(&name) {
            return Err(CycleDetectedError::new(vec![name.clone(), name]).into());
        }

        self.order.push(name.clone());
        self.dependencies.insert(name, deps);
        Ok(())
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the graph has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns true if `name` is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    /// Returns step names in declaration order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Returns the direct dependencies of `name`.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map_or(&[], Vec::as_slice)
    }

    /// Returns the steps that directly depend on `name`, in declaration order.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|candidate| self.dependencies(candidate).iter().any(|dep| dep == name))
            .map(String::as_str)
            .collect()
    }

    /// Checks that every edge targets a declared step and that there are no cycles.
    ///
    /// # Errors
    ///
    /// Returns `PIPELINE-EMPTY`, `PIPELINE-MISSING-DEP` or `PIPELINE-CYCLE`.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no steps").with_error_info(
                ErrorInfo::new("PIPELINE-EMPTY", "Cannot build an empty pipeline")
                    .with_fix_hint("Add at least one step before building."),
            ));
        }

        for name in &self.order {
            for dep in self.dependencies(name) {
                if !self.contains(dep) {
                    return Err(PipelineValidationError::new(format!(
                        "Step '{name}' depends on unknown step '{dep}'"
                    ))
                    .with_steps(vec![name.clone(), dep.clone()])
                    .with_error_info(
                        ErrorInfo::new("PIPELINE-MISSING-DEP", format!("Dependency '{dep}' not found"))
                            .with_fix_hint("Declare the dependency as a step or remove the edge."),
                    ));
                }
            }
        }

        self.detect_cycles()?;
        Ok(())
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for name in &self.order {
            if !visited.contains(name.as_str()) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut on_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        for dep in self.dependencies(node) {
            if on_stack.contains(dep.as_str()) {
                let start = path.iter().position(|step| *step == dep.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|step| (*step).to_string()).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep.as_str()) {
                if let Some(cycle) = self.dfs_cycle(dep, visited, on_stack, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_stack.remove(node);
        None
    }

    /// Returns a topological order: dependencies first, ties broken by declaration order.
    ///
    /// Assumes the graph has been validated.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            visited: &mut HashSet<&'a str>,
            result: &mut Vec<String>,
        ) {
            if !visited.insert(node) {
                return;
            }
            for dep in graph.dependencies(node) {
                visit(graph, dep, visited, result);
            }
            result.push(node.to_string());
        }

        let mut visited = HashSet::new();
        let mut result = Vec::with_capacity(self.order.len());
        for name in &self.order {
            visit(self, name, &mut visited, &mut result);
        }
        result
    }
}
