//! Action plans.
//!
//! A plan is a list of actions plus ordering edges: `prerequisites[i]` holds the indices of the
//! actions that must succeed before action `i` may run. Actions without a path between them are
//! independent and may run concurrently.

use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use crate::action::{Action, ActionKind};
use crate::error::PlanError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    actions: Vec<Action>,
    prerequisites: Vec<BTreeSet<usize>>,
}

impl Plan {
    /// Create a plan with no ordering edges.
    pub fn new(actions: Vec<Action>) -> Self {
        let prerequisites = vec![BTreeSet::new(); actions.len()];
        Self {
            actions,
            prerequisites,
        }
    }

    /// Require action `before` to complete before action `after`.
    ///
    /// Self-edges and out-of-range indices are ignored and return false.
    pub fn add_edge(&mut self, before: usize, after: usize) -> bool {
        if before == after || before >= self.actions.len() || after >= self.actions.len() {
            return false;
        }
        self.prerequisites[after].insert(before)
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn prerequisites(&self, index: usize) -> Option<&BTreeSet<usize>> {
        self.prerequisites.get(index)
    }

    /// For every action, the actions that wait for it.
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.actions.len()];
        for (after, before_set) in self.prerequisites.iter().enumerate() {
            for &before in before_set {
                dependents[before].push(after);
            }
        }
        dependents
    }

    /// A sequential order honouring every edge. Among ready actions the lowest index goes first,
    /// so the order is deterministic.
    ///
    /// Fails with [`PlanError::Cycle`] naming every action that can never become ready.
    pub fn linearize(&self) -> Result<Vec<usize>, PlanError> {
        let dependents = self.dependents();
        let mut pending: Vec<usize> = self.prerequisites.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.actions.len())
            .filter(|&i| pending[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.actions.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &d in &dependents[next] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() < self.actions.len() {
            let placed: BTreeSet<usize> = order.iter().copied().collect();
            let stuck = (0..self.actions.len()).filter(|i| !placed.contains(i));
            return Err(self.cycle_error(stuck));
        }
        Ok(order)
    }

    /// Actions in [`Plan::linearize`] order.
    pub fn ordered_actions(&self) -> Result<Vec<&Action>, PlanError> {
        Ok(self
            .linearize()?
            .into_iter()
            .map(|i| &self.actions[i])
            .collect())
    }

    /// A [`PlanError::Cycle`] naming the given actions.
    pub fn cycle_error(&self, indices: impl IntoIterator<Item = usize>) -> PlanError {
        PlanError::Cycle {
            actions: indices
                .into_iter()
                .filter_map(|i| self.actions.get(i))
                .map(Action::id)
                .collect(),
        }
    }

    /// Indices reachable from `index` through dependent edges, in breadth-first order.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let dependents = self.dependents();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = dependents.get(index).cloned().unwrap_or_default().into();
        let mut out = Vec::new();
        while let Some(i) = queue.pop_front() {
            if seen.insert(i) {
                out.push(i);
                queue.extend(dependents[i].iter().copied());
            }
        }
        out
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action.kind() {
                ActionKind::Create => summary.create += 1,
                ActionKind::Update => summary.update += 1,
                ActionKind::Delete => summary.delete += 1,
                ActionKind::AttachClaim => summary.attach += 1,
                ActionKind::DetachClaim => summary.detach += 1,
            }
        }
        summary
    }
}

/// Human-readable rendering, grouped by action kind.
impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.actions.is_empty() {
            return write!(f, "(none)");
        }

        let groups = [
            (ActionKind::Delete, "[-] Destroy component instances"),
            (ActionKind::Create, "[+] Deploy component instances"),
            (ActionKind::Update, "[*] Update component instances"),
            (ActionKind::AttachClaim, "[>] Attach claims"),
            (ActionKind::DetachClaim, "[<] Detach claims"),
        ];
        let (ordered, cycle) = match self.ordered_actions() {
            Ok(ordered) => (ordered, None),
            Err(err) => (self.actions.iter().collect(), Some(err)),
        };
        let mut first = true;

        for (kind, title) in groups {
            let members: Vec<&&Action> = ordered.iter().filter(|a| a.kind() == kind).collect();
            if members.is_empty() {
                continue;
            }
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{}", title)?;
            for action in members {
                match action {
                    Action::AttachClaim { key, claim } | Action::DetachClaim { key, claim } => {
                        write!(f, "\n  - {} -> {}", claim, key)?
                    }
                    _ => write!(f, "\n  - {}", action.key())?,
                }
            }
        }
        if let Some(err) = cycle {
            write!(f, "\n[!] {}", err)?;
        }
        Ok(())
    }
}

/// Action counts per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub attach: usize,
    pub detach: usize,
}

impl PlanSummary {
    pub fn total(&self) -> usize {
        self.create + self.update + self.delete + self.attach + self.detach
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} create, {} update, {} delete, {} attach, {} detach",
            self.create, self.update, self.delete, self.attach, self.detach
        )
    }
}
