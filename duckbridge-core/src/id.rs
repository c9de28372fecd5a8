//! Identifiers handed out by the reactor, the worker pool and the
//! connection cache.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! define_id_type {
    ($name:ident, $generator:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(u64);

        impl $name {
            /// Create a new ID from a u64 value
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            /// Get the underlying u64 ID
            pub fn id(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        #[derive(Debug)]
        pub struct $generator {
            next_id: AtomicU64,
        }

        impl $generator {
            pub fn new() -> Self {
                Self {
                    next_id: AtomicU64::new(1),
                }
            }

            pub fn next(&self) -> $name {
                $name::new(self.next_id.fetch_add(1, Ordering::SeqCst))
            }
        }

        impl Default for $generator {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

define_id_type!(
    TriggerId,
    TriggerIdGenerator,
    "Handle of a reactor system-event trigger, used to remove it again"
);
define_id_type!(
    ConnectionId,
    ConnectionIdGenerator,
    "Identity of one cached database connection"
);
define_id_type!(WorkerId, WorkerIdGenerator, "Identity of one worker thread");
