//! Ascending, prefixed identifiers.
//!
//! Ids embed a process-wide monotonic counter derived from wall-clock millis,
//! so two ids minted in sequence always compare in mint order, both as
//! strings and as numbers. Part replay order relies on this.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use strum::{Display, EnumString, IntoStaticStr};

/// Counter slots per millisecond.
const COUNTER_BITS: u64 = 12;
const HEX_WIDTH: usize = 13;
const RANDOM_LEN: usize = 14;

static LAST: AtomicU64 = AtomicU64::new(0);

/// Kind of record an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Prefix {
    #[strum(serialize = "ses")]
    Session,
    #[strum(serialize = "msg")]
    Message,
    #[strum(serialize = "prt")]
    Part,
    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "per")]
    Permission,
}

/// Mint a new ascending id for `prefix`.
pub fn ascending(prefix: Prefix) -> String {
    let value = next_value();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{prefix}_{value:0width$x}{}",
        &random[..RANDOM_LEN],
        width = HEX_WIDTH
    )
}

/// Check that `id` carries `prefix`.
pub fn has_prefix(id: &str, prefix: Prefix) -> bool {
    let tag: &'static str = prefix.into();
    id.strip_prefix(tag)
        .is_some_and(|rest| rest.starts_with('_'))
}

fn next_value() -> u64 {
    let now = (Utc::now().timestamp_millis().max(0) as u64) << COUNTER_BITS;
    let mut current = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(current + 1);
        match LAST.compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_ascending() {
        let ids: Vec<String> = (0..10_000).map(|_| ascending(Prefix::Part)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn ids_carry_their_prefix() {
        let id = ascending(Prefix::Message);
        assert!(id.starts_with("msg_"));
        assert!(has_prefix(&id, Prefix::Message));
        assert!(!has_prefix(&id, Prefix::Session));
        assert_eq!(id.len(), "msg_".len() + HEX_WIDTH + RANDOM_LEN);
    }

    #[test]
    fn ascending_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..500).map(|_| next_value()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let before = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), before);
    }
}
