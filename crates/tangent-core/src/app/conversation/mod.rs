mod branch_index;
mod message;
mod store;
mod subtree;

pub use branch_index::{
    BranchIndex, Direction, ParentKey, ROOT_PARENT_KEY, SiblingEntry, SiblingPosition,
};
pub use message::{ContentDelta, MediaRef, Message, MessagePart, Role};
pub use store::{MessageStore, PathError, StreamStatus, validate_path};
pub use subtree::collect_subtree;
