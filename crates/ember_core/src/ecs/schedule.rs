//! # Update Schedule
//!
//! Component and module descriptors declare named update functions. Each
//! frame phase runs its functions in an order where every declared
//! dependency comes first; otherwise registration order is kept. In the
//! async phase the same dependencies become happens-before edges between
//! tasks.
//!
//! A dependency is satisfied by a function of the same phase or of an
//! earlier phase. Anything else (unknown name, later phase, cycle) leaves
//! the function unscheduled and is reported.

use std::collections::HashMap;

use smallvec::SmallVec;

use super::registry::{ComponentTypeId, ModuleTypeId};

/// Frame phase an update function runs in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdatePhase {
    /// Sequential, first.
    #[default]
    PreAsync,
    /// Parallel tasks against a read-only view.
    Async,
    /// Sequential, after the async barrier.
    PostAsync,
    /// Sequential, after transform propagation.
    PostTransform,
}

impl UpdatePhase {
    /// All phases in execution order.
    pub const ALL: [Self; 4] = [Self::PreAsync, Self::Async, Self::PostAsync, Self::PostTransform];

    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::PreAsync => 0,
            Self::Async => 1,
            Self::PostAsync => 2,
            Self::PostTransform => 3,
        }
    }
}

/// Declaration of one named update function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFunction {
    name: &'static str,
    phase: UpdatePhase,
    depends_on: SmallVec<[&'static str; 2]>,
    only_when_simulating: bool,
    granularity: Option<usize>,
}

impl UpdateFunction {
    /// Declares a function. Names must be unique across the registry.
    #[must_use]
    pub fn new(name: &'static str, phase: UpdatePhase) -> Self {
        Self {
            name,
            phase,
            depends_on: SmallVec::new(),
            only_when_simulating: false,
            granularity: None,
        }
    }

    /// Moves the function to another phase.
    #[must_use]
    pub fn in_phase(mut self, phase: UpdatePhase) -> Self {
        self.phase = phase;
        self
    }

    /// Runs this function after `dependency`.
    #[must_use]
    pub fn after(mut self, dependency: &'static str) -> Self {
        self.depends_on.push(dependency);
        self
    }

    /// Skips the function while simulation is disabled.
    #[must_use]
    pub fn only_when_simulating(mut self) -> Self {
        self.only_when_simulating = true;
        self
    }

    /// Components handed to one async task. `0` puts all in one task.
    #[must_use]
    pub fn granularity(mut self, granularity: usize) -> Self {
        self.granularity = Some(granularity);
        self
    }

    /// Function name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Phase.
    #[must_use]
    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Declared dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[&'static str] {
        &self.depends_on
    }

    /// True if skipped while simulation is disabled.
    #[must_use]
    pub fn runs_only_when_simulating(&self) -> bool {
        self.only_when_simulating
    }

    /// Requested async batch size.
    #[must_use]
    pub fn granularity_hint(&self) -> Option<usize> {
        self.granularity
    }
}

/// Who owns an update function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum UpdateTarget {
    /// `updates[index]` of a component type.
    Component {
        type_id: ComponentTypeId,
        index: usize,
    },
    /// A module; `update`/`update_async` gets the function name.
    Module(ModuleTypeId),
}

/// A function placed in its phase order.
#[derive(Clone, Debug)]
pub(crate) struct ScheduledUpdate {
    pub name: &'static str,
    pub target: UpdateTarget,
    pub only_when_simulating: bool,
    pub granularity: Option<usize>,
    /// Positions of same-phase dependencies in the ordered list.
    pub depends_on: SmallVec<[usize; 2]>,
}

/// A function that could not be scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Unresolved {
    pub function: &'static str,
    pub missing: &'static str,
}

/// Ordered update functions of every phase.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    phases: [Vec<ScheduledUpdate>; 4],
}

impl Schedule {
    /// Orders `candidates` (given in registration order).
    pub fn build<'a>(
        candidates: impl IntoIterator<Item = (UpdateTarget, &'a UpdateFunction)>,
    ) -> (Self, Vec<Unresolved>) {
        let candidates: Vec<(UpdateTarget, &UpdateFunction)> = candidates.into_iter().collect();
        let phase_of: HashMap<&'static str, UpdatePhase> = candidates
            .iter()
            .map(|(_, function)| (function.name, function.phase))
            .collect();

        // Drop functions whose dependencies are missing or in a later phase,
        // then everything that depended on a dropped function.
        let mut unresolved = Vec::new();
        let mut alive: Vec<bool> = vec![true; candidates.len()];
        loop {
            let mut changed = false;
            let alive_names: HashMap<&'static str, bool> = candidates
                .iter()
                .zip(&alive)
                .map(|((_, f), &a)| (f.name, a))
                .collect();
            for (i, (_, function)) in candidates.iter().enumerate() {
                if !alive[i] {
                    continue;
                }
                let missing = function.depends_on.iter().copied().find(|dep| {
                    let placed = phase_of.get(dep).is_some_and(|&p| p <= function.phase);
                    !placed || !alive_names.get(dep).copied().unwrap_or(false)
                });
                if let Some(missing) = missing {
                    alive[i] = false;
                    changed = true;
                    unresolved.push(Unresolved {
                        function: function.name,
                        missing,
                    });
                }
            }
            if !changed {
                break;
            }
        }

        let mut schedule = Self::default();
        for phase in UpdatePhase::ALL {
            let members: Vec<usize> = (0..candidates.len())
                .filter(|&i| alive[i] && candidates[i].1.phase == phase)
                .collect();
            let (ordered, cyclic) = order_phase(&candidates, &members);
            for i in cyclic {
                let function = candidates[i].1;
                unresolved.push(Unresolved {
                    function: function.name,
                    missing: function.depends_on.first().copied().unwrap_or(function.name),
                });
            }

            let position: HashMap<&'static str, usize> = ordered
                .iter()
                .enumerate()
                .map(|(pos, &i)| (candidates[i].1.name, pos))
                .collect();
            schedule.phases[phase.slot()] = ordered
                .iter()
                .map(|&i| {
                    let (target, function) = candidates[i];
                    ScheduledUpdate {
                        name: function.name,
                        target,
                        only_when_simulating: function.only_when_simulating,
                        granularity: function.granularity,
                        depends_on: function
                            .depends_on
                            .iter()
                            .filter_map(|dep| position.get(dep).copied())
                            .collect(),
                    }
                })
                .collect();
        }
        (schedule, unresolved)
    }

    /// Functions of one phase in execution order.
    pub fn phase(&self, phase: UpdatePhase) -> &[ScheduledUpdate] {
        &self.phases[phase.slot()]
    }

    /// Total number of scheduled functions.
    pub fn len(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }
}

/// Kahn's algorithm, always picking the earliest registered ready function.
///
/// Returns the order and the members left over by a cycle.
fn order_phase(candidates: &[(UpdateTarget, &UpdateFunction)], members: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let mut placed: Vec<&'static str> = Vec::with_capacity(members.len());
    let mut remaining: Vec<usize> = members.to_vec();
    let mut ordered = Vec::with_capacity(members.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|&i| {
            candidates[i].1.depends_on.iter().all(|dep| {
                // Earlier-phase dependencies are already satisfied
                let same_phase = members.iter().any(|&m| candidates[m].1.name == *dep);
                !same_phase || placed.contains(dep)
            })
        });
        let Some(ready) = ready else {
            break;
        };
        let i = remaining.remove(ready);
        placed.push(candidates[i].1.name);
        ordered.push(i);
    }
    (ordered, remaining)
}
