use std::sync::atomic::{AtomicU64, Ordering};

// Global counters (low overhead). These are coarse-grained and process-wide.
static ENQUEUED: AtomicU64 = AtomicU64::new(0);
static DELIVERED: AtomicU64 = AtomicU64::new(0);
static ACKNOWLEDGED: AtomicU64 = AtomicU64::new(0);
static REDELIVERED: AtomicU64 = AtomicU64::new(0);
static DEQUEUED: AtomicU64 = AtomicU64::new(0);
static NO_CONSUMERS: AtomicU64 = AtomicU64::new(0);
static CLEANUP_FAILURES: AtomicU64 = AtomicU64::new(0);
static THRESHOLD_NOTIFICATIONS: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn inc_enqueued(n: u64) {
    ENQUEUED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_delivered(n: u64) {
    DELIVERED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_acknowledged(n: u64) {
    ACKNOWLEDGED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_redelivered(n: u64) {
    REDELIVERED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_dequeued(n: u64) {
    DEQUEUED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_no_consumers(n: u64) {
    NO_CONSUMERS.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_cleanup_failures(n: u64) {
    CLEANUP_FAILURES.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_threshold_notifications(n: u64) {
    THRESHOLD_NOTIFICATIONS.fetch_add(n, Ordering::Relaxed);
}

pub fn cleanup_failures() -> u64 {
    CLEANUP_FAILURES.load(Ordering::Relaxed)
}

pub fn snapshot() -> String {
    // Simple text format (Prometheus-style without HELP/TYPE lines for brevity)
    format!(
        "blipq_enqueued {}\nblipq_delivered {}\nblipq_acknowledged {}\nblipq_redelivered {}\nblipq_dequeued {}\nblipq_no_consumers {}\nblipq_cleanup_failures {}\nblipq_threshold_notifications {}\n",
        ENQUEUED.load(Ordering::Relaxed),
        DELIVERED.load(Ordering::Relaxed),
        ACKNOWLEDGED.load(Ordering::Relaxed),
        REDELIVERED.load(Ordering::Relaxed),
        DEQUEUED.load(Ordering::Relaxed),
        NO_CONSUMERS.load(Ordering::Relaxed),
        CLEANUP_FAILURES.load(Ordering::Relaxed),
        THRESHOLD_NOTIFICATIONS.load(Ordering::Relaxed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lists_every_counter() {
        inc_no_consumers(1);
        let text = snapshot();
        assert_eq!(text.lines().count(), 8);
        assert!(text.lines().all(|l| l.starts_with("blipq_")));
        assert!(text.contains("blipq_no_consumers "));
    }
}
