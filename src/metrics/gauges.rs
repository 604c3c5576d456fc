//! Levels that rise and fall.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};

/// Current level of something in flight, exported as a Prometheus gauge.
///
/// Every `inc` must be paired with a `dec` once the tracked item is gone.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    level: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            level: AtomicI64::new(0),
        }
    }

    pub fn inc(&self) {
        self.level.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.level.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.level.load(Ordering::Relaxed)
    }

    /// Append the `# HELP`, `# TYPE` and sample lines to `out`.
    pub fn expose(&self, out: &mut String) {
        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {level}\n",
            name = self.name,
            help = self.help,
            level = self.get()
        );
    }
}
