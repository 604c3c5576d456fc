//! Monotonic event counters.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of times something happened, exported as a Prometheus counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    events: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            events: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Record `events` occurrences at once, e.g. a batch of applied topologies.
    pub fn inc_by(&self, events: u64) {
        self.events.fetch_add(events, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Append the `# HELP`, `# TYPE` and sample lines to `out`.
    pub fn expose(&self, out: &mut String) {
        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {events}\n",
            name = self.name,
            help = self.help,
            events = self.get()
        );
    }
}
