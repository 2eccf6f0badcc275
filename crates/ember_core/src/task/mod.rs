//! # Task Scheduling
//!
//! The world never owns threads. Each frame it fills a [`TaskGroup`] with the
//! async update work and hands it to a [`TaskScheduler`]; `execute` returning
//! is the barrier.
//!
//! ## Dependency Levels
//!
//! Dependencies are turned into levels: level 0 holds every task without
//! prerequisites, level `n` every task whose prerequisites all sit in lower
//! levels. Schedulers run level by level, tasks of one level in any order.

#[cfg(feature = "parallel")]
mod pool;

#[cfg(feature = "parallel")]
pub use self::pool::RayonScheduler;

use smallvec::SmallVec;

use crate::error::TaskError;

/// A unit of work borrowed from the frame that submits it.
pub type Task<'scope> = Box<dyn FnOnce() + Send + 'scope>;

/// Identifies a task inside its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(usize);

impl TaskHandle {
    /// Submission index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

struct Node<'scope> {
    name: &'static str,
    task: Task<'scope>,
    prerequisites: SmallVec<[usize; 2]>,
}

/// Tasks plus happens-before edges, executed as one unit.
#[derive(Default)]
pub struct TaskGroup<'scope> {
    nodes: Vec<Node<'scope>>,
}

impl<'scope> TaskGroup<'scope> {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Adds a task.
    pub fn submit(&mut self, name: &'static str, task: Task<'scope>) -> TaskHandle {
        self.nodes.push(Node {
            name,
            task,
            prerequisites: SmallVec::new(),
        });
        TaskHandle(self.nodes.len() - 1)
    }

    /// Makes `task` wait for `prerequisite`.
    pub fn depends_on(&mut self, task: TaskHandle, prerequisite: TaskHandle) -> Result<(), TaskError> {
        if prerequisite.0 >= self.nodes.len() {
            return Err(TaskError::UnknownTask(prerequisite.0));
        }
        let node = self
            .nodes
            .get_mut(task.0)
            .ok_or(TaskError::UnknownTask(task.0))?;
        if !node.prerequisites.contains(&prerequisite.0) {
            node.prerequisites.push(prerequisite.0);
        }
        Ok(())
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if there is nothing to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Name of a task that sits on a dependency cycle, if there is one.
    #[must_use]
    pub fn find_cycle(&self) -> Option<&'static str> {
        self.level_of().err()
    }

    /// Drops every edge, leaving tasks in submission order.
    pub fn clear_dependencies(&mut self) {
        for node in &mut self.nodes {
            node.prerequisites.clear();
        }
    }

    /// Splits the group into dependency levels.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Cycle`] naming a task on the cycle; nothing is
    /// handed out in that case.
    pub fn into_levels(self) -> Result<Vec<Vec<(&'static str, Task<'scope>)>>, TaskError> {
        let (level_of, depth) = self.level_of().map_err(TaskError::Cycle)?;
        let mut levels: Vec<Vec<(&'static str, Task<'scope>)>> = (0..depth).map(|_| Vec::new()).collect();
        for (node, level) in self.nodes.into_iter().zip(level_of) {
            levels[level].push((node.name, node.task));
        }
        Ok(levels)
    }

    fn level_of(&self) -> Result<(Vec<usize>, usize), &'static str> {
        let count = self.nodes.len();
        let mut level_of: Vec<Option<usize>> = vec![None; count];
        let mut placed = 0;
        let mut depth = 0;

        while placed < count {
            let ready: Vec<usize> = (0..count)
                .filter(|&i| level_of[i].is_none())
                .filter(|&i| {
                    self.nodes[i]
                        .prerequisites
                        .iter()
                        .all(|&p| level_of[p].is_some_and(|l| l < depth))
                })
                .collect();
            if ready.is_empty() {
                let stuck = (0..count).find(|&i| level_of[i].is_none()).unwrap_or(0);
                return Err(self.nodes[stuck].name);
            }
            for &i in &ready {
                level_of[i] = Some(depth);
            }
            placed += ready.len();
            depth += 1;
        }
        Ok((level_of.into_iter().map(|l| l.unwrap_or(0)).collect(), depth))
    }
}

impl std::fmt::Debug for TaskGroup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|n| (n.name, &n.prerequisites)))
            .finish()
    }
}

/// Runs task groups. Shared by every world that uses it.
pub trait TaskScheduler: Send + Sync {
    /// Scheduler name, for logs.
    fn name(&self) -> &'static str;

    /// Runs every task of `group`, honoring its edges, and returns once all
    /// of them have finished.
    fn execute(&self, group: TaskGroup<'_>) -> Result<(), TaskError>;

    /// Threads available to one group.
    fn worker_count(&self) -> usize {
        1
    }
}

/// Runs everything on the calling thread, level by level.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn execute(&self, group: TaskGroup<'_>) -> Result<(), TaskError> {
        for level in group.into_levels()? {
            for (name, task) in level {
                let _span = tracing::trace_span!("task", name).entered();
                task();
            }
        }
        Ok(())
    }
}
