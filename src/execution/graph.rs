use crate::shared::ids::StepId;
use crate::task::Task;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("step id `{0}` is declared more than once")]
    DuplicateStep(StepId),
    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: StepId, dependency: StepId },
    #[error("step `{step}` depends on standby step `{dependency}`")]
    DependsOnStandby { step: StepId, dependency: StepId },
    #[error("step `{step}` names unknown alternative `{alternative}`")]
    UnknownAlternative { step: StepId, alternative: StepId },
    #[error("step `{0}` names itself as its alternative")]
    SelfAlternative(StepId),
    #[error("step dependencies form a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Dependency DAG over a task's main-flow steps.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    declared: Vec<StepId>,
    priority: HashMap<StepId, u32>,
    dependencies: HashMap<StepId, Vec<StepId>>,
    dependents: HashMap<StepId, Vec<StepId>>,
}

impl ExecutionGraph {
    pub fn from_task(task: &Task) -> Result<Self, GraphError> {
        let mut seen = HashSet::new();
        for step in &task.steps {
            if !seen.insert(step.id.clone()) {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }
        }
        for step in &task.steps {
            if let Some(alternative) = &step.alternative {
                if alternative == &step.id {
                    return Err(GraphError::SelfAlternative(step.id.clone()));
                }
                if !seen.contains(alternative) {
                    return Err(GraphError::UnknownAlternative {
                        step: step.id.clone(),
                        alternative: alternative.clone(),
                    });
                }
            }
        }

        let standby = task.alternative_step_ids();
        let main = task.main_flow_steps();
        let mut graph = Self {
            declared: main.iter().map(|step| step.id.clone()).collect(),
            priority: HashMap::new(),
            dependencies: HashMap::new(),
            dependents: HashMap::new(),
        };

        let mut previous: Option<&StepId> = None;
        for step in &main {
            let deps: Vec<StepId> = match &step.depends_on {
                Some(explicit) => explicit.clone(),
                None => previous.into_iter().cloned().collect(),
            };
            for dependency in &deps {
                if standby.contains(dependency) {
                    return Err(GraphError::DependsOnStandby {
                        step: step.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                if !seen.contains(dependency) {
                    return Err(GraphError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                graph
                    .dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(step.id.clone());
            }
            graph.priority.insert(step.id.clone(), step.priority.max(1));
            graph.dependencies.insert(step.id.clone(), deps);
            previous = Some(&step.id);
        }

        graph.topological_order()?;
        Ok(graph)
    }

    /// Kahn's algorithm; among ready steps the lowest priority value runs
    /// first, then declaration order.
    fn topological_order(&self) -> Result<Vec<StepId>, GraphError> {
        let index: HashMap<&StepId, usize> = self
            .declared
            .iter()
            .enumerate()
            .map(|(idx, id)| (id, idx))
            .collect();
        let mut in_degree: HashMap<&StepId, usize> = self
            .declared
            .iter()
            .map(|id| (id, self.dependencies.get(id).map_or(0, Vec::len)))
            .collect();

        let mut ready = BinaryHeap::new();
        for id in &self.declared {
            if in_degree.get(id) == Some(&0) {
                ready.push(Reverse((self.priority_of(id), index[id])));
            }
        }

        let mut order = Vec::with_capacity(self.declared.len());
        while let Some(Reverse((_, idx))) = ready.pop() {
            let id = &self.declared[idx];
            order.push(id.clone());
            for dependent in self.dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.priority_of(dependent), index[dependent])));
                    }
                }
            }
        }

        if order.len() < self.declared.len() {
            let placed: HashSet<&StepId> = order.iter().collect();
            let stuck = self
                .declared
                .iter()
                .filter(|id| !placed.contains(id))
                .map(|id| id.to_string())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    fn priority_of(&self, id: &StepId) -> u32 {
        self.priority.get(id).copied().unwrap_or(1)
    }

    pub fn execution_order(&self) -> Vec<StepId> {
        // Validated acyclic at construction.
        self.topological_order().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    /// Every step that directly or transitively depends on `id`.
    pub fn transitive_dependents(&self, id: &StepId) -> BTreeSet<StepId> {
        let mut found = BTreeSet::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents.get(&current).into_iter().flatten() {
                if found.insert(dependent.clone()) {
                    stack.push(dependent.clone());
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::TaskId;
    use crate::task::{Operation, Step};

    fn sid(raw: &str) -> StepId {
        StepId::parse(raw).expect("step id")
    }

    fn task(steps: Vec<Step>) -> Task {
        let mut task = Task::new(TaskId::parse("T.md").expect("task id"), "/vault/T.md");
        task.steps = steps;
        task
    }

    fn step(id: &str) -> Step {
        Step::new(sid(id), Operation::CreateFolder)
    }

    #[test]
    fn default_dependencies_chain_in_declaration_order() {
        let graph =
            ExecutionGraph::from_task(&task(vec![step("a"), step("b"), step("c")])).expect("dag");
        assert_eq!(graph.execution_order(), vec![sid("a"), sid("b"), sid("c")]);
        assert_eq!(
            graph.transitive_dependents(&sid("a")),
            [sid("b"), sid("c")].into_iter().collect()
        );
        assert!(graph.transitive_dependents(&sid("c")).is_empty());
    }

    #[test]
    fn independent_steps_order_by_priority_then_declaration() {
        let mut a = step("a");
        a.depends_on = Some(vec![]);
        a.priority = 3;
        let mut b = step("b");
        b.depends_on = Some(vec![]);
        b.priority = 1;
        let mut c = step("c");
        c.depends_on = Some(vec![]);
        c.priority = 3;
        let graph = ExecutionGraph::from_task(&task(vec![a, b, c])).expect("dag");
        assert_eq!(graph.execution_order(), vec![sid("b"), sid("a"), sid("c")]);
    }

    #[test]
    fn cycles_and_dangling_references_are_rejected() {
        let mut a = step("a");
        a.depends_on = Some(vec![sid("b")]);
        let mut b = step("b");
        b.depends_on = Some(vec![sid("a")]);
        let err = ExecutionGraph::from_task(&task(vec![a, b])).expect_err("cycle");
        assert!(matches!(err, GraphError::Cycle(_)));

        let mut dangling = step("a");
        dangling.depends_on = Some(vec![sid("zz")]);
        assert!(matches!(
            ExecutionGraph::from_task(&task(vec![dangling])).expect_err("dangling"),
            GraphError::UnknownDependency { .. }
        ));

        assert!(matches!(
            ExecutionGraph::from_task(&task(vec![step("a"), step("a")])).expect_err("dup"),
            GraphError::DuplicateStep(_)
        ));
    }

    #[test]
    fn alternatives_stay_out_of_the_main_flow() {
        let mut primary = step("a");
        primary.alternative = Some(sid("alt"));
        let graph =
            ExecutionGraph::from_task(&task(vec![primary, step("b"), step("alt")])).expect("dag");
        assert_eq!(graph.execution_order(), vec![sid("a"), sid("b")]);
        assert_eq!(graph.len(), 2);

        let mut missing = step("a");
        missing.alternative = Some(sid("nope"));
        assert!(matches!(
            ExecutionGraph::from_task(&task(vec![missing])).expect_err("missing alt"),
            GraphError::UnknownAlternative { .. }
        ));
    }
}
