//! Page and object model: the page arena, its queues, and the free list.

pub mod freelist;
pub mod object;
pub mod page;
pub mod queues;
pub mod speculative;

pub use freelist::FreeList;
pub use object::{ObjectGuard, ObjectKind, ObjectState, PagingToken, Purgeable, VmObject};
pub use page::{LaundryKind, Page, PageInfo, PageState, QueueId};
pub use queues::{PageQueues, Placement, QueueCounts};
pub use speculative::SpeculativeRing;
