//! # Message Routing
//!
//! Messages are plain data values with a dense, registration-assigned type
//! id. Delivery goes through the registry's handler table:
//!
//! - `send` looks up `[component type][message type]` and calls the handler
//!   right away (or does nothing if there is none)
//! - `post` stores the message in one of three timer queues, each drained
//!   once per frame at a fixed phase
//!
//! Queued messages are ordered by `(fire time, post sequence)`, so messages
//! with equal fire times are delivered in the order they were posted.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use super::component::ComponentHandle;
use super::object::GameObjectHandle;
use super::registry::MessageTypeId;

/// Which per-frame drain point a posted message waits for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MessageQueue {
    /// Drained at the start of the next frame, before PreAsync updates.
    #[default]
    NextFrame,
    /// Drained after the async barrier, before PostAsync updates.
    PostAsync,
    /// Drained after transform propagation, before PostTransform updates.
    PostTransform,
}

impl MessageQueue {
    /// All queues in drain order.
    pub const ALL: [Self; 3] = [Self::NextFrame, Self::PostAsync, Self::PostTransform];

    const fn slot(self) -> usize {
        match self {
            Self::NextFrame => 0,
            Self::PostAsync => 1,
            Self::PostTransform => 2,
        }
    }
}

/// Receiver of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageTarget {
    /// One component.
    Component(ComponentHandle),
    /// Every component of one object, in attachment order.
    Object(GameObjectHandle),
    /// Every component of an object and, depth first, of all its descendants.
    ObjectRecursive(GameObjectHandle),
}

impl From<ComponentHandle> for MessageTarget {
    fn from(handle: ComponentHandle) -> Self {
        Self::Component(handle)
    }
}

impl From<GameObjectHandle> for MessageTarget {
    fn from(handle: GameObjectHandle) -> Self {
        Self::Object(handle)
    }
}

/// Whether an object gained or lost its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentChange {
    /// Attached to `parent`.
    Linked,
    /// Detached from `parent`.
    Unlinked,
}

/// Sent to an object's components when its parent changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParentChanged {
    /// Linked or unlinked.
    pub kind: ParentChange,
    /// The parent involved.
    pub parent: GameObjectHandle,
}

/// Whether a child was added or removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildChange {
    /// `child` was attached.
    Added,
    /// `child` was detached or destroyed.
    Removed,
}

/// Sent to a parent's components when its child list changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildrenChanged {
    /// Added or removed.
    pub kind: ChildChange,
    /// The parent whose list changed.
    pub parent: GameObjectHandle,
    /// The child involved.
    pub child: GameObjectHandle,
}

/// Whether a component was attached or detached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentChange {
    /// `component` was attached.
    Added,
    /// `component` was detached.
    Removed,
}

/// Sent to an object's components when its component list changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComponentsChanged {
    /// Added or removed.
    pub kind: ComponentChange,
    /// Object whose list changed.
    pub owner: GameObjectHandle,
    /// The component involved.
    pub component: ComponentHandle,
}

/// Destroys the target object when processed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeleteObject;

/// A message waiting in a timer queue.
pub(crate) struct QueuedMessage {
    pub due: Duration,
    pub seq: u64,
    pub target: MessageTarget,
    pub message_type: MessageTypeId,
    pub type_name: &'static str,
    pub payload: Box<dyn Any + Send + Sync>,
    pub depth: u32,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    // Reversed: BinaryHeap is a max-heap, we want the earliest first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

/// The three timer queues.
#[derive(Default)]
pub(crate) struct MessageRouter {
    queues: [BinaryHeap<QueuedMessage>; 3],
    next_seq: u64,
}

impl MessageRouter {
    /// Queues a message due at `due`.
    pub fn push(
        &mut self,
        queue: MessageQueue,
        due: Duration,
        target: MessageTarget,
        message_type: MessageTypeId,
        type_name: &'static str,
        payload: Box<dyn Any + Send + Sync>,
        depth: u32,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queues[queue.slot()].push(QueuedMessage {
            due,
            seq,
            target,
            message_type,
            type_name,
            payload,
            depth,
        });
    }

    /// Sequence number that marks the start of a drain.
    ///
    /// Messages posted after this point (with seq >= the cutoff) wait for
    /// the next drain even when already due.
    pub fn drain_cutoff(&self) -> u64 {
        self.next_seq
    }

    /// Pops the next message that is due at `now` and older than `cutoff`.
    pub fn pop_due(&mut self, queue: MessageQueue, now: Duration, cutoff: u64) -> Option<QueuedMessage> {
        let heap = &mut self.queues[queue.slot()];
        let next = heap.peek()?;
        if next.due > now || next.seq >= cutoff {
            return None;
        }
        heap.pop()
    }

    /// Number of messages waiting in all queues.
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(BinaryHeap::len).sum()
    }

    /// Drops every queued message.
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::handle::Handle;

    fn push(router: &mut MessageRouter, due_ms: u64, tag: u32) {
        let target = MessageTarget::Object(Handle::new(tag, 0, 1));
        router.push(
            MessageQueue::NextFrame,
            Duration::from_millis(due_ms),
            target,
            MessageTypeId(0),
            "u32",
            Box::new(tag),
            0,
        );
    }

    fn drain(router: &mut MessageRouter, now_ms: u64) -> Vec<u32> {
        let cutoff = router.drain_cutoff();
        let mut out = Vec::new();
        while let Some(msg) =
            router.pop_due(MessageQueue::NextFrame, Duration::from_millis(now_ms), cutoff)
        {
            out.push(*msg.payload.downcast::<u32>().unwrap());
        }
        out
    }

    #[test]
    fn test_fire_time_then_fifo() {
        let mut router = MessageRouter::default();
        push(&mut router, 20, 1);
        push(&mut router, 10, 2);
        push(&mut router, 10, 3);
        push(&mut router, 0, 4);
        assert_eq!(drain(&mut router, 10), vec![4, 2, 3]);
        assert_eq!(router.total_len(), 1);
        assert_eq!(drain(&mut router, 19), Vec::<u32>::new());
        assert_eq!(drain(&mut router, 20), vec![1]);
    }

    #[test]
    fn test_posts_during_drain_wait() {
        let mut router = MessageRouter::default();
        push(&mut router, 0, 1);
        let cutoff = router.drain_cutoff();
        let first = router.pop_due(MessageQueue::NextFrame, Duration::ZERO, cutoff);
        assert!(first.is_some());

        // Posted while draining: due, but past the cutoff
        push(&mut router, 0, 2);
        assert!(router
            .pop_due(MessageQueue::NextFrame, Duration::ZERO, cutoff)
            .is_none());
        assert_eq!(drain(&mut router, 0), vec![2]);
    }

    #[test]
    fn test_queues_are_independent() {
        let mut router = MessageRouter::default();
        push(&mut router, 0, 1);
        let cutoff = router.drain_cutoff();
        assert!(router
            .pop_due(MessageQueue::PostAsync, Duration::ZERO, cutoff)
            .is_none());
        assert_eq!(router.total_len(), 1);
        router.clear();
        assert_eq!(router.total_len(), 0);
    }
}
