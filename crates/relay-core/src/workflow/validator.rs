//! Static checks over a workflow definition.
//!
//! Every check runs even after earlier ones fail, so a single report lists
//! all problems. Errors block `start`; warnings are informational unless
//! strict mode escalates them.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::workflow::catalog::{Catalog, ResolutionContext};
use crate::workflow::schema::{ErrorHandlingStrategy, Step, WorkflowDefinition};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Err(Definition)` when there are errors; the warnings otherwise.
    pub fn into_result(self) -> Result<Vec<String>, EngineError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(EngineError::Definition(self.errors))
        }
    }

    fn escalate(&mut self) {
        let warnings = std::mem::take(&mut self.warnings);
        self.errors
            .extend(warnings.into_iter().map(|w| format!("(strict) {}", w)));
    }
}

/// Load the catalog for `context` and validate against it. A catalog that
/// cannot be loaded (for example a missing group directory) is reported as
/// an error and every reference is then treated as unresolved.
pub fn validate_in_context(
    def: &WorkflowDefinition,
    catalog_root: &Path,
    context: ResolutionContext,
    strict: bool,
) -> (ValidationReport, Catalog) {
    match Catalog::load(catalog_root, context.clone()) {
        Ok(catalog) => (validate(def, &catalog, strict), catalog),
        Err(e) => {
            let catalog = Catalog::new(context);
            let mut report = validate(def, &catalog, strict);
            report.errors.insert(0, format!("catalog: {}", e));
            (report, catalog)
        }
    }
}

pub fn validate(def: &WorkflowDefinition, catalog: &Catalog, strict: bool) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_required(def, &mut report);
    check_identifiers(def, &mut report);
    check_catalog(def, catalog, &mut report);
    check_targets(def, &mut report);
    check_policy(def, &mut report);

    if let Some(graph) = Graph::build(def, &mut report) {
        graph.check_reachability(def, &mut report);
        graph.check_control_cycles(def, &mut report);
        graph.check_dataflow(def, &mut report);
    }

    if strict {
        report.escalate();
    }

    tracing::debug!(
        "[Validator] {}: {} errors, {} warnings",
        def.id,
        report.errors.len(),
        report.warnings.len()
    );
    report
}

fn check_required(def: &WorkflowDefinition, report: &mut ValidationReport) {
    if def.id.is_empty() {
        report.errors.push("workflow 'id' is required".to_string());
    }
    if def.name.is_empty() {
        report.errors.push("workflow 'name' is required".to_string());
    }
    if def.steps.is_empty() {
        report.errors.push("workflow has no steps".to_string());
    }

    let mut seen = HashSet::new();
    for (i, step) in def.steps.iter().enumerate() {
        if step.id().is_empty() {
            report.errors.push(format!("step #{} has an empty id", i + 1));
        } else if !seen.insert(step.id()) {
            report.errors.push(format!("duplicate step id '{}'", step.id()));
        }
        match step {
            Step::Action(a) => {
                if a.agent.trim().is_empty() {
                    report.errors.push(format!("step '{}': 'agent' is required", a.id));
                }
                if a.task.trim().is_empty() {
                    report.errors.push(format!("step '{}': 'task' is required", a.id));
                }
            }
            Step::Routing(r) => {
                for c in r.conditions.iter().filter(|c| c.when.trim().is_empty()) {
                    report.errors.push(format!(
                        "step '{}': condition targeting '{}' has an empty predicate",
                        r.id, c.target
                    ));
                }
                if r.conditions.is_empty() && r.default.is_none() {
                    report.errors.push(format!(
                        "routing step '{}' has neither conditions nor a default",
                        r.id
                    ));
                }
            }
            Step::Phase(_) => {}
        }
    }

    if let Some(ref entry) = def.entry {
        if def.step(entry).is_none() {
            report
                .errors
                .push(format!("entry step '{}' does not exist", entry));
        }
    }
}

fn check_identifiers(def: &WorkflowDefinition, report: &mut ValidationReport) {
    let pattern = match Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$") {
        Ok(p) => p,
        Err(_) => return,
    };
    let mut check = |what: &str, id: &str| {
        if !id.is_empty() && !pattern.is_match(id) {
            report
                .warnings
                .push(format!("{} '{}' is not a well-formed identifier", what, id));
        }
    };

    check("workflow id", &def.id);
    for step in &def.steps {
        check("step id", step.id());
        if let Step::Action(a) = step {
            if let Some(ref key) = a.produces {
                check("output key", key);
            }
        }
    }
}

fn check_catalog(def: &WorkflowDefinition, catalog: &Catalog, report: &mut ValidationReport) {
    let scope = match catalog.context() {
        ResolutionContext::Core => "core".to_string(),
        ResolutionContext::Group(g) => format!("group '{}'", g),
        ResolutionContext::Hybrid(Some(g)) => format!("core + group '{}'", g),
        ResolutionContext::Hybrid(None) => "core (hybrid)".to_string(),
    };

    for a in def.action_steps() {
        if !a.agent.trim().is_empty() && catalog.resolve_agent(&a.agent).is_none() {
            report.errors.push(format!(
                "step '{}': agent '{}' not found in {}",
                a.id, a.agent, scope
            ));
        }
        if !a.task.trim().is_empty() && catalog.resolve_task(&a.task).is_none() {
            report.errors.push(format!(
                "step '{}': task '{}' not found in {}",
                a.id, a.task, scope
            ));
        }
    }
    report
        .warnings
        .extend(catalog.load_warnings.iter().map(|w| format!("catalog: {}", w)));
}

fn check_targets(def: &WorkflowDefinition, report: &mut ValidationReport) {
    for step in &def.steps {
        for target in step.targets() {
            if def.step(target).is_none() {
                report.errors.push(format!(
                    "step '{}' targets unknown step '{}'",
                    step.id(),
                    target
                ));
            } else if target == step.id() && matches!(step, Step::Routing(_)) {
                report
                    .errors
                    .push(format!("routing step '{}' targets itself", step.id()));
            }
        }
    }
}

fn check_policy(def: &WorkflowDefinition, report: &mut ValidationReport) {
    let policy_fallback = def.policy.fallback_step.as_deref();
    if let Some(fb) = policy_fallback {
        if def.step(fb).is_none() {
            report
                .errors
                .push(format!("policy fallback_step '{}' does not exist", fb));
        }
    }

    let mut any_fallback = policy_fallback.is_some();
    for a in def.action_steps() {
        if let Some(ref fb) = a.fallback {
            any_fallback = true;
            if def.step(fb).is_none() {
                report.errors.push(format!(
                    "step '{}': fallback '{}' does not exist",
                    a.id, fb
                ));
            } else if *fb == a.id {
                report
                    .warnings
                    .push(format!("step '{}' falls back to itself", a.id));
            }
        }
    }

    if def.policy.error_handling == Some(ErrorHandlingStrategy::RetryThenFallback) && !any_fallback {
        report.warnings.push(
            "error_handling is retry-then-fallback but no fallback step is configured; \
             failures will abort"
                .to_string(),
        );
    }
}

/// Control-flow graph over step indices.
struct Graph {
    entry: usize,
    succ: Vec<Vec<usize>>,
    pred: Vec<Vec<usize>>,
    terminal: Vec<bool>,
}

impl Graph {
    fn build(def: &WorkflowDefinition, report: &mut ValidationReport) -> Option<Self> {
        let entry = def.entry_step_id().and_then(|id| def.index_of(id))?;
        let n = def.steps.len();
        let mut succ = vec![Vec::new(); n];
        let mut pred = vec![Vec::new(); n];
        let mut terminal = vec![false; n];

        for (i, step) in def.steps.iter().enumerate() {
            terminal[i] = def.is_terminal(step);
            let targets: Vec<&str> = match step {
                Step::Routing(_) => step.targets(),
                _ => def.successor(step).into_iter().collect(),
            };
            for t in targets {
                if let Some(j) = def.index_of(t) {
                    if !succ[i].contains(&j) {
                        succ[i].push(j);
                        pred[j].push(i);
                    }
                }
            }
        }

        if !terminal.iter().any(|t| *t) {
            report.errors.push("workflow has no terminal step".to_string());
        }

        Some(Self {
            entry,
            succ,
            pred,
            terminal,
        })
    }

    fn reachable_from_entry(&self) -> Vec<bool> {
        let mut seen = vec![false; self.succ.len()];
        let mut queue = VecDeque::from([self.entry]);
        seen[self.entry] = true;
        while let Some(i) = queue.pop_front() {
            for &j in &self.succ[i] {
                if !seen[j] {
                    seen[j] = true;
                    queue.push_back(j);
                }
            }
        }
        seen
    }

    fn check_reachability(&self, def: &WorkflowDefinition, report: &mut ValidationReport) {
        let reachable = self.reachable_from_entry();

        let mut reaches_terminal = self.terminal.clone();
        let mut queue: VecDeque<usize> = (0..self.terminal.len()).filter(|&i| self.terminal[i]).collect();
        while let Some(i) = queue.pop_front() {
            for &p in &self.pred[i] {
                if !reaches_terminal[p] {
                    reaches_terminal[p] = true;
                    queue.push_back(p);
                }
            }
        }

        for (i, step) in def.steps.iter().enumerate() {
            if !reachable[i] {
                report.warnings.push(format!(
                    "step '{}' is unreachable from entry '{}'",
                    step.id(),
                    def.steps[self.entry].id()
                ));
            } else if !reaches_terminal[i] {
                report
                    .warnings
                    .push(format!("no terminal step is reachable from step '{}'", step.id()));
            }
        }
    }

    /// Cycles made only of routing and phase steps would spin forever
    /// without dispatching any work.
    fn check_control_cycles(&self, def: &WorkflowDefinition, report: &mut ValidationReport) {
        let n = self.succ.len();
        let is_control = |i: usize| !matches!(def.steps[i], Step::Action(_));
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut color = vec![0u8; n];
        let mut reported: HashSet<BTreeSet<usize>> = HashSet::new();

        for start in (0..n).filter(|&i| is_control(i)) {
            if color[start] != 0 {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            let mut path: Vec<usize> = vec![start];
            color[start] = 1;

            while let Some(&(node, next)) = stack.last() {
                let edges: Vec<usize> = self.succ[node]
                    .iter()
                    .copied()
                    .filter(|&j| is_control(j))
                    .filter(|&j| !(j == node && matches!(def.steps[node], Step::Routing(_))))
                    .collect();
                if next < edges.len() {
                    let j = edges[next];
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match color[j] {
                        0 => {
                            color[j] = 1;
                            stack.push((j, 0));
                            path.push(j);
                        }
                        1 => {
                            let pos = path.iter().position(|&p| p == j).unwrap_or(0);
                            let cycle: Vec<usize> = path[pos..].to_vec();
                            if reported.insert(cycle.iter().copied().collect()) {
                                let names: Vec<&str> =
                                    cycle.iter().map(|&c| def.steps[c].id()).collect();
                                report.errors.push(format!(
                                    "cycle without any action step: {} -> {}",
                                    names.join(" -> "),
                                    def.steps[j].id()
                                ));
                            }
                        }
                        _ => {}
                    }
                } else {
                    color[node] = 2;
                    stack.pop();
                    path.pop();
                }
            }
        }
    }

    /// Forward availability analysis of output keys. A key is *maybe*
    /// available at a step if some path from the entry produces it, and
    /// *surely* available if every path does.
    fn check_dataflow(&self, def: &WorkflowDefinition, report: &mut ValidationReport) {
        let n = self.succ.len();
        let reachable = self.reachable_from_entry();
        let produces: Vec<Option<&str>> = def
            .steps
            .iter()
            .map(|s| match s {
                Step::Action(a) => a.produces.as_deref(),
                _ => None,
            })
            .collect();
        let universe: BTreeSet<&str> = produces.iter().flatten().copied().collect();

        let mut may_out: Vec<BTreeSet<&str>> = vec![BTreeSet::new(); n];
        let mut must_out: Vec<BTreeSet<&str>> = vec![universe.clone(); n];
        let mut may_in: Vec<BTreeSet<&str>> = vec![BTreeSet::new(); n];
        let mut must_in: Vec<BTreeSet<&str>> = vec![BTreeSet::new(); n];

        let mut changed = true;
        while changed {
            changed = false;
            for i in (0..n).filter(|&i| reachable[i]) {
                let preds: Vec<usize> = self.pred[i].iter().copied().filter(|&p| reachable[p]).collect();

                let mut may: BTreeSet<&str> = BTreeSet::new();
                for &p in &preds {
                    may.extend(may_out[p].iter().copied());
                }
                let must: BTreeSet<&str> = if i == self.entry {
                    BTreeSet::new()
                } else {
                    let mut iter = preds.iter();
                    match iter.next() {
                        Some(&first) => iter.fold(must_out[first].clone(), |acc, &p| {
                            acc.intersection(&must_out[p]).copied().collect()
                        }),
                        None => BTreeSet::new(),
                    }
                };

                let mut new_may = may.clone();
                let mut new_must = must.clone();
                if let Some(key) = produces[i] {
                    new_may.insert(key);
                    new_must.insert(key);
                }
                if new_may != may_out[i] || new_must != must_out[i] {
                    may_out[i] = new_may;
                    must_out[i] = new_must;
                    changed = true;
                }
                may_in[i] = may;
                must_in[i] = must;
            }
        }

        let producers: HashMap<&str, Vec<&str>> = def.steps.iter().fold(HashMap::new(), |mut acc, s| {
            if let Step::Action(a) = s {
                if let Some(ref key) = a.produces {
                    acc.entry(key.as_str()).or_default().push(a.id.as_str());
                }
            }
            acc
        });

        for (i, step) in def.steps.iter().enumerate() {
            let Step::Action(a) = step else { continue };
            if !reachable[i] {
                continue;
            }
            for key in &a.requires {
                if !may_in[i].contains(key.as_str()) {
                    let detail = match producers.get(key.as_str()) {
                        Some(ids) => format!(" (produced by {} only after it)", ids.join(", ")),
                        None => " (no step produces it)".to_string(),
                    };
                    report.errors.push(format!(
                        "step '{}' requires '{}' which is not produced on any path before it{}",
                        a.id, key, detail
                    ));
                } else if !must_in[i].contains(key.as_str()) {
                    report.warnings.push(format!(
                        "step '{}' requires '{}' which is only produced on some paths before it",
                        a.id, key
                    ));
                }
            }
        }
    }
}
