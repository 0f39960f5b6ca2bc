use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

// Macro keeps all ID wrappers structurally identical, so store and view code can treat them alike.
macro_rules! define_storage_id {
    ($name:ident) => {
        /// Client-generated identifier. Any non-empty string is accepted so ids
        /// minted elsewhere round-trip unchanged.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_storage_id!(ConversationId);
define_storage_id!(MessageId);

static LAST_TIMESTAMP_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Returns epoch milliseconds that strictly increase across calls in this process.
///
/// Two messages created within the same millisecond (the optimistic user message
/// and its assistant placeholder) must still sort deterministically.
pub fn monotonic_timestamp_millis() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64);

    let mut previous = LAST_TIMESTAMP_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = now.max(previous + 1);
        match LAST_TIMESTAMP_MILLIS.compare_exchange_weak(
            previous,
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(current) => previous = current,
        }
    }
}
