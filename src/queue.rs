use indexmap::IndexSet;

use crate::endpoint::Endpoint;

/// The staging queue: an insertion-ordered, deduplicating set of `Endpoint`s
/// waiting to be dialed.
///
/// `indexmap::IndexSet` is exactly the primitive this needs — a combination
/// of an ordered sequence and a membership set in one structure — so the
/// queue is a thin wrapper rather than hand-rolled `VecDeque` + `HashSet`.
#[derive(Default)]
pub struct StagingQueue {
    pending: IndexSet<Endpoint>,
}

impl StagingQueue {
    pub fn new() -> StagingQueue {
        StagingQueue {
            pending: IndexSet::new(),
        }
    }

    /// Inserts `endpoint` if it isn't already pending. Returns `true` if it
    /// was newly inserted. Duplicate records arriving on the ingest pipe are
    /// collapsed here.
    pub fn insert(&mut self, endpoint: Endpoint) -> bool {
        self.pending.insert(endpoint)
    }

    /// Pops the oldest pending endpoint (FIFO drain order).
    pub fn pop_front(&mut self) -> Option<Endpoint> {
        self.pending.shift_remove_index(0)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
