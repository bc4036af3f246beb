#![allow(missing_docs)]

use tracing::trace;

use crate::primitives::hal::Pmap;
use crate::vm::{Page, PageQueues, PageState, QueueId};

/// Moves pages from the head of the active queue to the inactive queues
/// while inactive plus speculative pages stay below the inactive target.
///
/// Each examined page costs one unit of `budget`, moved or not. Wired,
/// guard, busy and kernel-owned pages go back to the active tail. Returns
/// the number of pages deactivated.
pub fn balance(queues: &mut PageQueues, pmap: &dyn Pmap, budget: u32) -> u32 {
    let mut remaining = budget;
    let mut moved = 0;
    let target = queues.inactive_target();
    while remaining > 0 && queues.inactive_count() + queues.speculative_count() < target {
        let Some(idx) = queues.head(QueueId::Active) else {
            break;
        };
        remaining -= 1;
        if queues.page(idx).map_or(true, pinned) {
            queues.requeue(idx);
            continue;
        }
        // No TLB flush: a stale entry costs at most one extra reactivation.
        pmap.clear_reference(idx);
        queues.deactivate(idx);
        moved += 1;
    }
    if moved > 0 {
        trace!(moved, target, "pageout.balance.deactivated");
    }
    moved
}

fn pinned(page: &Page) -> bool {
    page.guard
        || page.wire_count > 0
        || page.kernel_owned
        || matches!(page.state(), PageState::Wired | PageState::Busy)
}
