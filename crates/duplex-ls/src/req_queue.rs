//! The request-response correlation table.
//!
//! Incoming holds the executions of requests received from the peer;
//! Outgoing holds the completion slots of requests sent to the peer and the
//! id allocator shared by both protocols. The connection stores the whole
//! queue behind one mutex and keeps the per-slot data in `I` and `O`.

use core::fmt;
use std::collections::HashMap;

use crate::msg::RequestId;

/// Manages the set of pending requests, both incoming and outgoing.
pub struct ReqQueue<I, O> {
    /// The incoming requests.
    pub incoming: Incoming<I>,
    /// The outgoing requests.
    pub outgoing: Outgoing<O>,
}

impl<I, O> Default for ReqQueue<I, O> {
    fn default() -> ReqQueue<I, O> {
        ReqQueue {
            incoming: Incoming {
                pending: HashMap::default(),
            },
            outgoing: Outgoing {
                next_id: 1,
                pending: HashMap::default(),
            },
        }
    }
}

impl<I, O> fmt::Debug for ReqQueue<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReqQueue").finish()
    }
}

/// The incoming request queue.
#[derive(Debug)]
pub struct Incoming<I> {
    pending: HashMap<RequestId, I>,
}

/// The outgoing request queue.
///
/// It holds the next request id and the pending completion slots. Ids are
/// allocated monotonically starting at 1; responses and events on the DAP
/// side draw their `seq` from the same counter.
#[derive(Debug)]
pub struct Outgoing<O> {
    next_id: i32,
    pending: HashMap<RequestId, O>,
}

impl<I> Incoming<I> {
    /// Registers a request with the given id and data.
    pub fn register(&mut self, id: RequestId, data: I) {
        self.pending.insert(id, data);
    }

    /// Checks if there are *any* pending requests.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Checks if a request with the given id is completed.
    pub fn is_completed(&self, id: &RequestId) -> bool {
        !self.pending.contains_key(id)
    }

    /// Returns the data of a pending request without completing it.
    pub fn get(&self, id: &RequestId) -> Option<&I> {
        self.pending.get(id)
    }

    /// Completes a request with the given id. At most one caller observes
    /// the data, so a request is answered at most once.
    pub fn complete(&mut self, id: &RequestId) -> Option<I> {
        self.pending.remove(id)
    }
}

impl<O> Outgoing<O> {
    /// Allocates a request id.
    pub fn alloc_request_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Registers a completion slot under the given id.
    pub fn register(&mut self, id: RequestId, data: O) {
        self.pending.insert(id, data);
    }

    /// Completes a request with the given id, removing its slot.
    pub fn complete(&mut self, id: RequestId) -> Option<O> {
        self.pending.remove(&id)
    }

    /// Takes every remaining slot, used to settle all pending requests when
    /// the connection closes.
    pub fn drain(&mut self) -> Vec<(RequestId, O)> {
        self.pending.drain().collect()
    }

    /// Checks if there are *any* pending requests.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::ReqQueue;

    #[test]
    fn ids_start_at_one_and_increase() {
        let mut queue = ReqQueue::<(), ()>::default();
        assert_eq!(queue.outgoing.alloc_request_id(), 1);
        assert_eq!(queue.outgoing.alloc_request_id(), 2);
        assert_eq!(queue.outgoing.alloc_request_id(), 3);
    }

    #[test]
    fn outgoing_complete_is_at_most_once() {
        let mut queue = ReqQueue::<(), &'static str>::default();
        let id = crate::RequestId::from(queue.outgoing.alloc_request_id());
        queue.outgoing.register(id.clone(), "slot");

        assert_eq!(queue.outgoing.complete(id.clone()), Some("slot"));
        assert_eq!(queue.outgoing.complete(id), None);
    }

    #[test]
    fn drain_takes_everything() {
        let mut queue = ReqQueue::<(), u32>::default();
        for n in 0..4 {
            let id = crate::RequestId::from(queue.outgoing.alloc_request_id());
            queue.outgoing.register(id, n);
        }
        assert!(queue.outgoing.has_pending());
        assert_eq!(queue.outgoing.drain().len(), 4);
        assert!(!queue.outgoing.has_pending());
    }

    #[test]
    fn incoming_answered_at_most_once() {
        let mut queue = ReqQueue::<&'static str, ()>::default();
        let id = crate::RequestId::from(7);
        queue.incoming.register(id.clone(), "execution");
        assert!(!queue.incoming.is_completed(&id));

        assert_eq!(queue.incoming.complete(&id), Some("execution"));
        assert_eq!(queue.incoming.complete(&id), None);
        assert!(queue.incoming.is_completed(&id));
    }
}
