use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// Last revision handed out in this process.
static LAST_REVISION: AtomicU64 = AtomicU64::new(0);

/// Identifies a generation of workers, i.e. everything that was built on top of the same
/// broker connection.
///
/// Revisions are derived from the UTC wall clock (nanoseconds since the epoch) and are strictly
/// increasing within a process, even if the clock stalls or steps backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(u64);

impl Revision {
    /// Mint a revision greater than every revision minted before it.
    pub(crate) fn next() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        let mut last = LAST_REVISION.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match LAST_REVISION.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self(candidate),
                Err(current) => last = current,
            }
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
