use std::sync::atomic::{AtomicU64, Ordering};

// Process-wide counters. Relaxed ordering; values are only ever reported.
static INGRESS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static INGRESS_REJECTED: AtomicU64 = AtomicU64::new(0);
static INGRESS_STORE_ERRORS: AtomicU64 = AtomicU64::new(0);
static SCANNED: AtomicU64 = AtomicU64::new(0);
static PUBLISHED: AtomicU64 = AtomicU64::new(0);
static PUBLISH_FAILURES: AtomicU64 = AtomicU64::new(0);
static DEAD_LETTERED: AtomicU64 = AtomicU64::new(0);
static REQUEUED: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn inc_ingress_accepted(n: u64) {
    INGRESS_ACCEPTED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_ingress_rejected(n: u64) {
    INGRESS_REJECTED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_ingress_store_errors(n: u64) {
    INGRESS_STORE_ERRORS.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_scanned(n: u64) {
    SCANNED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_published(n: u64) {
    PUBLISHED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_publish_failures(n: u64) {
    PUBLISH_FAILURES.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_dead_lettered(n: u64) {
    DEAD_LETTERED.fetch_add(n, Ordering::Relaxed);
}
/// Messages written back to the store during shutdown.
#[inline]
pub fn inc_requeued(n: u64) {
    REQUEUED.fetch_add(n, Ordering::Relaxed);
}

pub fn snapshot() -> String {
    // Prometheus text format without HELP/TYPE lines
    format!(
        "nsqdelay_ingress_accepted {}\nnsqdelay_ingress_rejected {}\nnsqdelay_ingress_store_errors {}\nnsqdelay_scanned {}\nnsqdelay_published {}\nnsqdelay_publish_failures {}\nnsqdelay_dead_lettered {}\nnsqdelay_requeued {}\n",
        INGRESS_ACCEPTED.load(Ordering::Relaxed),
        INGRESS_REJECTED.load(Ordering::Relaxed),
        INGRESS_STORE_ERRORS.load(Ordering::Relaxed),
        SCANNED.load(Ordering::Relaxed),
        PUBLISHED.load(Ordering::Relaxed),
        PUBLISH_FAILURES.load(Ordering::Relaxed),
        DEAD_LETTERED.load(Ordering::Relaxed),
        REQUEUED.load(Ordering::Relaxed),
    )
}
