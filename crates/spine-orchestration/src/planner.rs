//! Plan resolution
//!
//! Resolves a workflow definition into an executable plan:
//!
//! 1. Validate dependency references
//! 2. Detect cycles with a three-colour DFS (reports the actual cycle)
//! 3. Topologically sort with Kahn's algorithm, stable on declaration order
//! 4. Merge parameters: defaults < run params < step params
//!
//! Pure logic: no store access and no execution. Cycle detection runs before
//! the sort so failures carry a meaningful cycle report instead of a bare
//! "remaining nodes" count.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::model::{ExecutionPolicy, Step, Workflow};

/// Plan resolution failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    /// A step references an operation missing from the registry
    #[error("step '{step}' references unknown operation '{operation}'")]
    StepNotFound { step: String, operation: String },

    /// A step depends on names that do not exist in the workflow
    #[error("step '{step}' depends on unknown steps: {missing:?}")]
    DependencyError { step: String, missing: Vec<String> },

    /// The dependency graph contains a cycle
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// Two steps share a name
    #[error("duplicate step name: {name}")]
    DuplicateStep { name: String },

    /// Topological sort did not consume every node
    #[error("plan resolution incomplete, remaining steps: {remaining:?}")]
    Unresolvable { remaining: Vec<String> },
}

/// One step of an execution plan, with merged parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub step: Step,
    /// defaults < run params < step params
    pub params: Map<String, Value>,
    pub sequence_order: u32,
}

/// Topologically ordered plan ready for the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub workflow_name: String,
    pub version: u32,
    pub steps: Vec<PlannedStep>,
    pub policy: ExecutionPolicy,
    pub params: Map<String, Value>,
}

/// Resolves workflows into execution plans. Stateless and thread-safe.
#[derive(Default)]
pub struct Planner {
    operation_check: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate pipeline operation names through a registry lookup.
    pub fn with_operation_check(
        mut self,
        check: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.operation_check = Some(Box::new(check));
        self
    }

    /// Resolve a workflow into a plan.
    pub fn resolve(
        &self,
        workflow: &Workflow,
        run_params: &Map<String, Value>,
    ) -> Result<ExecutionPlan, PlanError> {
        debug!(
            workflow = %workflow.name,
            step_count = workflow.steps.len(),
            "resolving plan"
        );

        self.validate_unique_names(&workflow.steps)?;
        self.validate_operations(&workflow.steps)?;
        self.validate_dependencies(&workflow.steps)?;
        self.detect_cycles(&workflow.steps)?;
        let sorted = self.topological_sort(&workflow.steps)?;

        let steps = sorted
            .into_iter()
            .enumerate()
            .map(|(order, step)| {
                let params =
                    merge_params(&workflow.defaults, run_params, &step.params());
                PlannedStep {
                    step: step.clone(),
                    params,
                    sequence_order: order as u32,
                }
            })
            .collect();

        Ok(ExecutionPlan {
            workflow_name: workflow.name.clone(),
            version: workflow.version,
            steps,
            policy: workflow.policy.clone(),
            params: run_params.clone(),
        })
    }

    fn validate_unique_names(&self, steps: &[Step]) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for step in steps {
            if !seen.insert(step.name.as_str()) {
                return Err(PlanError::DuplicateStep {
                    name: step.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_operations(&self, steps: &[Step]) -> Result<(), PlanError> {
        let Some(ref check) = self.operation_check else {
            return Ok(());
        };
        for step in steps {
            if let crate::model::StepKind::Pipeline { operation, .. } = &step.kind {
                if !check(operation) {
                    return Err(PlanError::StepNotFound {
                        step: step.name.clone(),
                        operation: operation.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_dependencies(&self, steps: &[Step]) -> Result<(), PlanError> {
        let names: HashSet<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        for step in steps {
            let missing: Vec<String> = step
                .depends_on
                .iter()
                .filter(|dep| !names.contains(dep.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(PlanError::DependencyError {
                    step: step.name.clone(),
                    missing,
                });
            }
        }
        Ok(())
    }

    /// Three-colour DFS. White = unvisited, grey = on the current path,
    /// black = done. Hitting a grey node closes a cycle; the reported list
    /// is the path from the first occurrence of that node, with the node
    /// repeated at the end.
    fn detect_cycles(&self, steps: &[Step]) -> Result<(), PlanError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let graph: HashMap<&str, &[String]> = steps
            .iter()
            .map(|s| (s.name.as_str(), s.depends_on.as_slice()))
            .collect();
        let mut colour: HashMap<&str, Colour> =
            steps.iter().map(|s| (s.name.as_str(), Colour::White)).collect();

        fn visit<'a>(
            node: &'a str,
            graph: &HashMap<&'a str, &'a [String]>,
            colour: &mut HashMap<&'a str, Colour>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            colour.insert(node, Colour::Grey);
            path.push(node);

            for neighbour in graph.get(node).copied().unwrap_or(&[]) {
                match colour.get(neighbour.as_str()).copied() {
                    Some(Colour::Grey) => {
                        let start = path
                            .iter()
                            .position(|n| *n == neighbour.as_str())
                            .unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(neighbour.clone());
                        return Some(cycle);
                    }
                    Some(Colour::White) => {
                        if let Some(cycle) = visit(neighbour, graph, colour, path) {
                            return Some(cycle);
                        }
                    }
                    _ => {}
                }
            }

            colour.insert(node, Colour::Black);
            path.pop();
            None
        }

        for step in steps {
            if colour[step.name.as_str()] == Colour::White {
                let mut path = Vec::new();
                if let Some(cycle) = visit(&step.name, &graph, &mut colour, &mut path) {
                    return Err(PlanError::CycleDetected { cycle });
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm. The queue is seeded in declaration order and new
    /// zero-indegree nodes append in discovery order, so ties preserve the
    /// workflow's declared ordering.
    fn topological_sort<'a>(&self, steps: &'a [Step]) -> Result<Vec<&'a Step>, PlanError> {
        let step_map: HashMap<&str, &Step> =
            steps.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> =
            steps.iter().map(|s| (s.name.as_str(), 0)).collect();

        for step in steps {
            for dep in &step.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.name.as_str());
                if let Some(degree) = in_degree.get_mut(step.name.as_str()) {
                    *degree += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = steps
            .iter()
            .filter(|s| in_degree[s.name.as_str()] == 0)
            .map(|s| s.name.as_str())
            .collect();
        let mut result = Vec::with_capacity(steps.len());

        while let Some(node) = queue.pop_front() {
            result.push(step_map[node]);
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if result.len() != steps.len() {
            let done: HashSet<&str> = result.iter().map(|s| s.name.as_str()).collect();
            let remaining = steps
                .iter()
                .filter(|s| !done.contains(s.name.as_str()))
                .map(|s| s.name.clone())
                .collect();
            return Err(PlanError::Unresolvable { remaining });
        }

        Ok(result)
    }
}

/// Merge parameters with precedence: defaults < run params < step params.
/// Shallow by key; later maps override earlier ones.
pub fn merge_params(
    defaults: &Map<String, Value>,
    run_params: &Map<String, Value>,
    step_params: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = Map::new();
    for (key, value) in defaults.iter().chain(run_params).chain(step_params) {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepKind;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow::new("test", steps).unwrap()
    }

    #[test]
    fn test_linear_chain_order() {
        let wf = workflow(vec![
            Step::pipeline("c", "op.c").with_depends_on(["b"]),
            Step::pipeline("a", "op.a"),
            Step::pipeline("b", "op.b").with_depends_on(["a"]),
        ]);

        let plan = Planner::new().resolve(&wf, &Map::new()).unwrap();
        let order: Vec<&str> = plan.steps.iter().map(|s| s.step.name.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(plan.steps[0].sequence_order, 0);
    }

    #[test]
    fn test_declaration_order_preserved_on_ties() {
        let wf = workflow(vec![
            Step::pipeline("first", "op"),
            Step::pipeline("second", "op"),
            Step::pipeline("third", "op"),
        ]);

        let plan = Planner::new().resolve(&wf, &Map::new()).unwrap();
        let order: Vec<&str> = plan.steps.iter().map(|s| s.step.name.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_every_step_after_its_dependencies() {
        let wf = workflow(vec![
            Step::pipeline("publish", "op").with_depends_on(["aggregate", "validate"]),
            Step::pipeline("ingest", "op"),
            Step::pipeline("validate", "op").with_depends_on(["ingest"]),
            Step::pipeline("aggregate", "op").with_depends_on(["validate"]),
        ]);

        let plan = Planner::new().resolve(&wf, &Map::new()).unwrap();
        let position: HashMap<&str, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step.name.as_str(), i))
            .collect();

        for planned in &plan.steps {
            for dep in &planned.step.depends_on {
                assert!(position[dep.as_str()] < position[planned.step.name.as_str()]);
            }
        }
    }

    #[test]
    fn test_cycle_detected_with_report() {
        // A <- B <- C <- B: B and C form the cycle
        let wf = workflow(vec![
            Step::pipeline("a", "op"),
            Step::pipeline("b", "op").with_depends_on(["a", "c"]),
            Step::pipeline("c", "op").with_depends_on(["b"]),
        ]);

        let err = Planner::new().resolve(&wf, &Map::new()).unwrap_err();
        let PlanError::CycleDetected { cycle } = err else {
            panic!("expected cycle error, got {err}");
        };
        assert!(cycle.contains(&"b".to_string()));
        assert!(cycle.contains(&"c".to_string()));
        // The closing node appears exactly twice
        let closer = cycle.last().unwrap();
        assert_eq!(cycle.iter().filter(|n| n == &closer).count(), 2);
    }

    #[test]
    fn test_self_cycle() {
        let wf = workflow(vec![Step::pipeline("a", "op").with_depends_on(["a"])]);
        let err = Planner::new().resolve(&wf, &Map::new()).unwrap_err();
        assert!(matches!(err, PlanError::CycleDetected { .. }));
    }

    #[test]
    fn test_unknown_dependency() {
        let wf = workflow(vec![Step::pipeline("a", "op").with_depends_on(["ghost"])]);
        let err = Planner::new().resolve(&wf, &Map::new()).unwrap_err();
        let PlanError::DependencyError { step, missing } = err else {
            panic!("expected dependency error");
        };
        assert_eq!(step, "a");
        assert_eq!(missing, vec!["ghost"]);
    }

    #[test]
    fn test_operation_check() {
        let wf = workflow(vec![Step::pipeline("a", "op.known")]);
        let planner = Planner::new().with_operation_check(|op| op == "op.known");
        assert!(planner.resolve(&wf, &Map::new()).is_ok());

        let wf = workflow(vec![Step::pipeline("a", "op.unknown")]);
        let err = planner.resolve(&wf, &Map::new()).unwrap_err();
        assert!(matches!(err, PlanError::StepNotFound { .. }));
    }

    #[test]
    fn test_merge_precedence() {
        let defaults = map(&[("tier", json!("T1")), ("window", json!(7))]);
        let run = map(&[("tier", json!("T2")), ("week", json!("2026-01-03"))]);
        let step = map(&[("tier", json!("T3"))]);

        let merged = merge_params(&defaults, &run, &step);
        assert_eq!(merged.get("tier"), Some(&json!("T3")));
        assert_eq!(merged.get("window"), Some(&json!(7)));
        assert_eq!(merged.get("week"), Some(&json!("2026-01-03")));
    }

    #[test]
    fn test_merged_params_on_planned_steps() {
        let mut wf = workflow(vec![
            Step::pipeline("a", "op").with_params(map(&[("k", json!("step"))]))
        ]);
        wf.defaults = map(&[("k", json!("default")), ("base", json!(1))]);

        let plan = Planner::new()
            .resolve(&wf, &map(&[("k", json!("run"))]))
            .unwrap();
        assert_eq!(plan.steps[0].params.get("k"), Some(&json!("step")));
        assert_eq!(plan.steps[0].params.get("base"), Some(&json!(1)));

        // Non-pipeline steps still get defaults + run params
        let wf2 = workflow(vec![Step::wait_seconds("w", 1)]);
        let plan2 = Planner::new()
            .resolve(&wf2, &map(&[("k", json!("run"))]))
            .unwrap();
        assert_eq!(plan2.steps[0].params.get("k"), Some(&json!("run")));
        assert!(matches!(plan2.steps[0].step.kind, StepKind::Wait { .. }));
    }
}
