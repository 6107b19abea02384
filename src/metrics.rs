use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    // Events
    pub events_appended_total: AtomicU64,
    pub events_deleted_total: AtomicU64,
    pub event_conflicts_total: AtomicU64,
    pub listener_notifications_total: AtomicU64,

    // Documents
    pub doc_reads_total: AtomicU64,
    pub doc_writes_total: AtomicU64,

    // Sessions
    pub session_commits_total: AtomicU64,
    pub session_rollbacks_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            events_appended_total: AtomicU64::new(0),
            events_deleted_total: AtomicU64::new(0),
            event_conflicts_total: AtomicU64::new(0),
            listener_notifications_total: AtomicU64::new(0),
            doc_reads_total: AtomicU64::new(0),
            doc_writes_total: AtomicU64::new(0),
            session_commits_total: AtomicU64::new(0),
            session_rollbacks_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_event_appends(count: u64) {
    metrics()
        .events_appended_total
        .fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_event_deletes(count: u64) {
    metrics()
        .events_deleted_total
        .fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_event_conflict() {
    metrics()
        .event_conflicts_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_notifications(count: u64) {
    metrics()
        .listener_notifications_total
        .fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_doc_read(count: u64) {
    metrics().doc_reads_total.fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_doc_write(count: u64) {
    metrics().doc_writes_total.fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_commit() {
    metrics()
        .session_commits_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_rollback() {
    metrics()
        .session_rollbacks_total
        .fetch_add(1, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    // events
    let _ = writeln!(
        s,
        "# TYPE events_appended_total counter\nevents_appended_total {}",
        m.events_appended_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE events_deleted_total counter\nevents_deleted_total {}",
        m.events_deleted_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE event_conflicts_total counter\nevent_conflicts_total {}",
        m.event_conflicts_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE listener_notifications_total counter\nlistener_notifications_total {}",
        m.listener_notifications_total.load(Ordering::Relaxed)
    );
    // docs
    let _ = writeln!(
        s,
        "# TYPE doc_reads_total counter\ndoc_reads_total {}",
        m.doc_reads_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE doc_writes_total counter\ndoc_writes_total {}",
        m.doc_writes_total.load(Ordering::Relaxed)
    );
    // sessions
    let _ = writeln!(
        s,
        "# TYPE session_commits_total counter\nsession_commits_total {}",
        m.session_commits_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE session_rollbacks_total counter\nsession_rollbacks_total {}",
        m.session_rollbacks_total.load(Ordering::Relaxed)
    );
    s
}
