//!
//! Staging of accepted views between worker ticks
//!

use markercal_core::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::status::{Status, StatusBoard};
use crate::correspondence::ViewCorrespondences;

/// Views accepted by submitters and not yet merged by the worker
///
/// The committed count is only written while the staging lock is held, so staged plus
/// committed read under that lock is a consistent total.
#[derive(Debug, Default)]
pub(crate) struct ObservationBuffer {
    staged: Mutex<Vec<ViewCorrespondences>>,
    committed: AtomicUsize,
}
impl ObservationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `view` if it covers at least `min_markers` markers
    ///
    /// While the total stays below `min_views`, the status reports how many views are
    /// still missing. Returns whether the view was staged.
    pub fn submit(
        &self,
        view: ViewCorrespondences,
        min_markers: usize,
        min_views: usize,
        status: &StatusBoard,
    ) -> bool {
        let accepted = view.markers >= min_markers;

        let mut staged = self.staged.lock();
        if accepted {
            staged.push(view);
        } else {
            debug!("discarding frame with {} matched markers", view.markers);
        }
        let total = staged.len() + self.committed.load(Ordering::Acquire);
        if total < min_views {
            status.set(Status::NeedMore(min_views - total));
        }

        accepted
    }

    /// Move every staged view to the end of `committed`, returning how many moved
    pub fn drain_into(&self, committed: &mut Vec<ViewCorrespondences>) -> usize {
        let mut staged = self.staged.lock();
        let moved = staged.len();
        committed.append(&mut staged);
        self.committed.store(committed.len(), Ordering::Release);

        moved
    }

    pub fn staged_len(&self) -> usize {
        self.staged.lock().len()
    }

    /// Staged views plus `committed`, read under the staging lock
    pub fn total_with(&self, committed: usize) -> usize {
        self.staged.lock().len() + committed
    }

    /// Drop every staged view and forget the committed count
    pub fn clear(&self) {
        let mut staged = self.staged.lock();
        staged.clear();
        self.committed.store(0, Ordering::Release);
    }
}
