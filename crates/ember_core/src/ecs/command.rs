//! # World Commands
//!
//! Structural mutations requested from places that cannot touch the world
//! directly: message handlers, component updates and async tasks. They are
//! replayed by the world at the next sequential point, in the order queued.

use std::any::{type_name, Any, TypeId};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use ember_shared::Transform;

use super::component::{Component, ComponentHandle, Message};
use super::message::{MessageQueue, MessageTarget};
use super::object::{GameObjectDesc, GameObjectHandle, ParentPreserve};

/// A message payload waiting to be routed.
pub struct PostedMessage {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) payload: Box<dyn Any + Send + Sync>,
}

impl PostedMessage {
    /// Boxes a message for later delivery.
    #[must_use]
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            type_name: type_name::<M>(),
            payload: Box::new(message),
        }
    }

    /// Rust type name of the payload.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for PostedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostedMessage").field("type", &self.type_name).finish()
    }
}

/// A deferred structural mutation.
pub enum WorldCommand {
    /// Create a game object.
    CreateObject(GameObjectDesc),
    /// Destroy a game object and its subtree.
    DestroyObject(GameObjectHandle),
    /// Attach a component.
    AddComponent {
        /// Object that will own the component.
        owner: GameObjectHandle,
        /// The component, already constructed.
        component: Box<dyn Component>,
    },
    /// Detach and destroy a component.
    RemoveComponent(ComponentHandle),
    /// Re-parent an object (`None` detaches it).
    SetParent {
        /// Object to move.
        child: GameObjectHandle,
        /// New parent.
        parent: Option<GameObjectHandle>,
        /// Which transform survives the move.
        preserve: ParentPreserve,
    },
    /// Set or clear an object's global key.
    SetGlobalKey(GameObjectHandle, Option<String>),
    /// Overwrite an object's local transform.
    SetLocalTransform(GameObjectHandle, Transform),
    /// Set an object's own active flag.
    SetActive(GameObjectHandle, bool),
    /// Route a message.
    Post {
        /// Receiver.
        target: MessageTarget,
        /// Payload.
        message: PostedMessage,
        /// Delay in simulated time.
        delay: Duration,
        /// Queue the message is drained from.
        queue: MessageQueue,
        /// Re-post depth of this post.
        depth: u32,
    },
    /// Load a serialized world stream next to the current contents.
    Load(Vec<u8>),
    /// Destroy every object.
    Clear,
}

impl std::fmt::Debug for WorldCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateObject(desc) => f.debug_tuple("CreateObject").field(&desc.name).finish(),
            Self::DestroyObject(h) => f.debug_tuple("DestroyObject").field(h).finish(),
            Self::AddComponent { owner, .. } => {
                f.debug_struct("AddComponent").field("owner", owner).finish_non_exhaustive()
            }
            Self::RemoveComponent(h) => f.debug_tuple("RemoveComponent").field(h).finish(),
            Self::SetParent {
                child,
                parent,
                preserve,
            } => f
                .debug_struct("SetParent")
                .field("child", child)
                .field("parent", parent)
                .field("preserve", preserve)
                .finish(),
            Self::SetGlobalKey(h, key) => f.debug_tuple("SetGlobalKey").field(h).field(key).finish(),
            Self::SetLocalTransform(h, _) => f.debug_tuple("SetLocalTransform").field(h).finish(),
            Self::SetActive(h, active) => {
                f.debug_tuple("SetActive").field(h).field(active).finish()
            }
            Self::Post {
                target,
                message,
                delay,
                queue,
                depth,
            } => f
                .debug_struct("Post")
                .field("target", target)
                .field("message", message)
                .field("delay", delay)
                .field("queue", queue)
                .field("depth", depth)
                .finish(),
            Self::Load(bytes) => f.debug_tuple("Load").field(&bytes.len()).finish(),
            Self::Clear => f.write_str("Clear"),
        }
    }
}

/// Anything that can queue world commands.
///
/// Implemented by [`CommandBuffer`] (sequential phases) and
/// [`CommandSender`] (async tasks).
pub trait Commands {
    /// Re-post depth applied to messages posted through this queue.
    fn depth(&self) -> u32 {
        0
    }

    /// Queues a raw command.
    fn queue(&mut self, command: WorldCommand);

    /// Queues object creation.
    fn create_object(&mut self, desc: GameObjectDesc) {
        self.queue(WorldCommand::CreateObject(desc));
    }

    /// Queues object destruction.
    fn destroy_object(&mut self, object: GameObjectHandle) {
        self.queue(WorldCommand::DestroyObject(object));
    }

    /// Queues attaching `component` to `owner`.
    fn add_component<C: Component>(&mut self, owner: GameObjectHandle, component: C)
    where
        Self: Sized,
    {
        self.queue(WorldCommand::AddComponent {
            owner,
            component: Box::new(component),
        });
    }

    /// Queues component removal.
    fn remove_component(&mut self, component: ComponentHandle) {
        self.queue(WorldCommand::RemoveComponent(component));
    }

    /// Queues a re-parent.
    fn set_parent(&mut self, child: GameObjectHandle, parent: Option<GameObjectHandle>) {
        self.queue(WorldCommand::SetParent {
            child,
            parent,
            preserve: ParentPreserve::KeepLocal,
        });
    }

    /// Queues a local transform write.
    fn set_local_transform(&mut self, object: GameObjectHandle, transform: Transform) {
        self.queue(WorldCommand::SetLocalTransform(object, transform));
    }

    /// Queues an active flag change.
    fn set_active(&mut self, object: GameObjectHandle, active: bool) {
        self.queue(WorldCommand::SetActive(object, active));
    }

    /// Posts `message` to `target` on the next-frame queue.
    fn post<M: Message>(&mut self, target: impl Into<MessageTarget>, message: M, delay: Duration)
    where
        Self: Sized,
    {
        self.post_to_queue(target, message, delay, MessageQueue::NextFrame);
    }

    /// Posts `message` to `target` on a specific queue.
    fn post_to_queue<M: Message>(
        &mut self,
        target: impl Into<MessageTarget>,
        message: M,
        delay: Duration,
        queue: MessageQueue,
    ) where
        Self: Sized,
    {
        let depth = self.depth() + 1;
        self.queue(WorldCommand::Post {
            target: target.into(),
            message: PostedMessage::new(message),
            delay,
            queue,
            depth,
        });
    }
}

/// Command queue for sequential code.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<WorldCommand>,
}

impl CommandBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Takes every queued command, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<WorldCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl Commands for CommandBuffer {
    fn queue(&mut self, command: WorldCommand) {
        self.commands.push(command);
    }
}

/// Thread-safe command queue handed to async tasks.
///
/// Cloning is cheap; every clone feeds the same world.
#[derive(Clone, Debug)]
pub struct CommandSender {
    sender: Sender<WorldCommand>,
}

impl CommandSender {
    /// Queues a command; returns `false` if the world is gone.
    pub fn send(&self, command: WorldCommand) -> bool {
        self.sender.send(command).is_ok()
    }
}

impl Commands for CommandSender {
    fn queue(&mut self, command: WorldCommand) {
        if !self.send(command) {
            tracing::debug!("command dropped: world receiver closed");
        }
    }
}

/// Creates the command channel between async tasks and the world.
pub(crate) fn command_channel() -> (CommandSender, Receiver<WorldCommand>) {
    let (sender, receiver) = unbounded();
    (CommandSender { sender }, receiver)
}
