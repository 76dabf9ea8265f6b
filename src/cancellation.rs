//! Cancellation signal shared by the scheduler, battles and sandbox invocations.
//!
//! A [`Cancellation`] is a node in a tree: cancelling a node (or reaching its deadline)
//! cancels every node derived from it with [`Cancellation::child`]. The tournament run owns
//! the root, each battle gets a child carrying the battle deadline, and every suspension point
//! polls [`Cancellation::is_cancelled`].

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[derive(Debug)]
struct Node {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Arc<Node>>,
}

/// Why a [`Cancellation`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel` was called on this node or an ancestor.
    Requested,
    /// The deadline of this node or an ancestor passed.
    DeadlineExceeded,
}

/// Cloneable handle on a cancellation node.
#[derive(Debug, Clone)]
pub struct Cancellation {
    node: Arc<Node>,
}

impl Cancellation {
    /// A root signal without deadline.
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    /// A root signal that fires once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now().checked_add(timeout))
    }

    fn with_deadline(deadline: Option<Instant>) -> Self {
        Cancellation {
            node: Arc::new(Node {
                cancelled: AtomicBool::new(false),
                deadline,
                parent: None,
            }),
        }
    }

    /// Derive a child signal, optionally with its own timeout counted from now.
    ///
    /// The child fires whenever this signal fires.
    pub fn child(&self, timeout: Option<Duration>) -> Cancellation {
        Cancellation {
            node: Arc::new(Node {
                cancelled: AtomicBool::new(false),
                deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
                parent: Some(self.node.clone()),
            }),
        }
    }

    /// Fire this signal and all of its descendants.
    pub fn cancel(&self) {
        self.node.cancelled.store(true, Ordering::Release);
    }

    /// True once this signal or an ancestor was cancelled or passed its deadline.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// The reason of the closest fired node, walking up to the root.
    pub fn reason(&self) -> Option<CancelReason> {
        let now = Instant::now();
        let mut node = Some(&self.node);
        while let Some(current) = node {
            if current.cancelled.load(Ordering::Acquire) {
                return Some(CancelReason::Requested);
            }
            if current.deadline.is_some_and(|d| now >= d) {
                return Some(CancelReason::DeadlineExceeded);
            }
            node = current.parent.as_ref();
        }
        None
    }

    /// True if this very node fired and no ancestor fired before it.
    ///
    /// An ancestor that was cancelled explicitly always takes precedence. When only deadlines
    /// passed, the earliest one decides.
    pub fn fired_locally(&self) -> bool {
        let now = Instant::now();
        let requested = self.node.cancelled.load(Ordering::Acquire);
        let own_deadline = self.node.deadline.filter(|d| now >= *d);
        if !requested && own_deadline.is_none() {
            return false;
        }
        let mut node = self.node.parent.as_ref();
        while let Some(current) = node {
            if current.cancelled.load(Ordering::Acquire) {
                return false;
            }
            if let Some(deadline) = current.deadline.filter(|d| now >= *d) {
                match own_deadline {
                    Some(own) if own < deadline => {}
                    _ => return false,
                }
            }
            node = current.parent.as_ref();
        }
        true
    }

    /// Time left before the closest deadline in the chain, if any.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut closest: Option<Instant> = None;
        let mut node = Some(&self.node);
        while let Some(current) = node {
            if let Some(d) = current.deadline {
                closest = Some(closest.map_or(d, |c| c.min(d)));
            }
            node = current.parent.as_ref();
        }
        closest.map(|d| d.saturating_duration_since(now))
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
