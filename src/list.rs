use crate::system::sys_debug;
use crate::task::{Joinable, Task, TaskNode, make_task};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Identifies a task within a [`TaskList`].
///
/// Ids are strictly increasing and never reused. The default id (and any id
/// the list has never handed out or has already retired) names no node and
/// counts as an already-satisfied dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TaskId(u64);

impl TaskId {
    /// A dependency that is always satisfied.
    pub const NONE: TaskId = TaskId(0);

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ListInner {
    ids: u64,
    nodes: HashMap<TaskId, Arc<TaskNode>>,
    /// Id of the barrier created by the last `flush`, if any. The node is
    /// also in `nodes` under the same id.
    flushed: Option<TaskId>,
}

/// A DAG of tasks keyed by id, with flush barriers.
///
/// Every appended node carries one wait count per dependency plus one
/// "release" count the list itself consumes in [`TaskList::flush`] or
/// [`TaskList::finish`]. Dependency ids that name no current node are
/// silently treated as satisfied; that is what lets a flush id be used as a
/// dependency across flushes without the client tracking the list's
/// bookkeeping.
pub struct TaskList {
    inner: Mutex<ListInner>,
}

impl TaskList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ListInner {
                ids: 0,
                nodes: HashMap::new(),
                flushed: None,
            }),
        }
    }

    /// Adds a task gated on `deps`, returning its id.
    pub fn append(&self, task: Arc<dyn Task>, deps: &[TaskId]) -> TaskId {
        let mut inner = self.inner.lock();

        inner.ids += 1;
        let id = TaskId(inner.ids);

        sys_debug!("task_list::append", "id {} <- {} dependencies", id, deps.len());

        // One count per dependency plus the list's own release.
        let node = TaskNode::new("task_list", task, deps.len() as u32 + 1, true);

        for dep in deps {
            match inner.nodes.get(dep) {
                Some(dep_node) => dep_node.add_to_notify(&node),
                // Unknown or retired ids are already satisfied.
                None => node.notify(),
            }
        }

        inner.nodes.insert(id, node);
        id
    }

    /// Erects a barrier behind everything currently appended and returns its
    /// id.
    ///
    /// The barrier finishes only after every node appended before the flush
    /// has finished; appending with the returned id serialises subsequent
    /// work behind that point. Chained barriers wait for their predecessor
    /// before the new one is wired up.
    pub fn flush(&self) -> TaskId {
        // Wait for the previous barrier with the list lock released: its
        // predecessors may still be running on the pool and can touch this
        // list themselves. It stays in the map meanwhile so appends naming
        // its id keep wiring to it.
        let prev = {
            let inner = self.inner.lock();
            inner.flushed.and_then(|id| inner.nodes.get(&id).cloned())
        };
        if let Some(prev) = prev {
            prev.join();
        }

        let mut inner = self.inner.lock();
        if let Some(id) = inner.flushed.take() {
            inner.nodes.remove(&id);
        }

        // Count the barrier's waits before anything can finish: one per
        // current node plus the release issued below. Attaching before the
        // matching notify is what makes a dependency finishing in between
        // harmless; the late-subscriber guarantee turns it into an immediate
        // release instead of a lost wakeup.
        let count = inner.nodes.len();
        debug!(nodes = count, "flush barrier");
        sys_debug!("task_list::flush", "{} nodes behind barrier", count);

        let empty: Arc<dyn Task> = make_task(|| ());
        let barrier = TaskNode::new("flush", empty, count as u32 + 1, true);

        for node in inner.nodes.values() {
            node.add_to_notify(&barrier);
            node.notify();
        }

        inner.nodes.clear();
        inner.ids += 1;
        let id = TaskId(inner.ids);
        inner.nodes.insert(id, Arc::clone(&barrier));
        inner.flushed = Some(id);

        barrier.notify();
        id
    }

    /// Releases every appended node and waits for completion.
    ///
    /// With `detached` set, returns a [`Joinable`] that waits for the
    /// released nodes instead of waiting inline. Either way the list is
    /// empty again on return; ids keep increasing.
    pub fn finish(&self, detached: bool) -> Joinable {
        // A pending barrier already consumed its release in flush. Wait for
        // it with the list lock released, as in `flush`, then retire it so
        // it is not released twice.
        let prev = {
            let inner = self.inner.lock();
            inner.flushed.and_then(|id| inner.nodes.get(&id).cloned())
        };
        if let Some(prev) = prev {
            prev.join();
        }

        let mut inner = self.inner.lock();
        if let Some(id) = inner.flushed.take() {
            inner.nodes.remove(&id);
        }

        sys_debug!(
            "task_list::finish",
            "{} nodes, detached {}",
            inner.nodes.len(),
            detached,
        );

        for node in inner.nodes.values() {
            node.notify();
        }

        let nodes: Vec<Arc<TaskNode>> = inner.nodes.drain().map(|(_, node)| node).collect();
        drop(inner);

        if detached {
            Joinable::new(move || {
                for node in &nodes {
                    node.join();
                }
            })
        } else {
            for node in &nodes {
                node.join();
            }
            Joinable::default()
        }
    }
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskList")
            .field("ids", &inner.ids)
            .field("nodes", &inner.nodes.len())
            .field("flushed", &inner.flushed)
            .finish()
    }
}
