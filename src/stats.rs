use crate::clock::Clock;
use crate::system::System;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default)]
struct StatData {
    busy: f32,
    idle: f32,
    num: u32,
}

/// One named busy/idle counter, typically owned by a pool worker.
///
/// `report_busy` also counts one processed item.
#[derive(Debug)]
pub struct Stat {
    name: String,
    data: Mutex<StatData>,
}

impl Stat {
    fn new(name: String) -> Self {
        Self {
            name,
            data: Mutex::new(StatData::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn report_busy(&self, seconds: f32) {
        let mut data = self.data.lock();
        data.busy += seconds;
        data.num += 1;
    }

    pub fn report_idle(&self, seconds: f32) {
        self.data.lock().idle += seconds;
    }

    /// Busy share of the observed window, 0.0 when nothing was observed.
    pub fn load(&self) -> f32 {
        let data = self.data.lock();
        let total = data.busy + data.idle;
        if total > 0.0 { data.busy / total } else { 0.0 }
    }

    pub fn busy_seconds(&self) -> f32 {
        self.data.lock().busy
    }

    pub fn count(&self) -> u32 {
        self.data.lock().num
    }

    pub fn reset(&self) {
        *self.data.lock() = StatData::default();
    }
}

struct StatsInner {
    stats: Vec<Arc<Stat>>,
    window: Clock,
}

/// Registry of [`Stat`] counters with a grouped load report.
///
/// Stats whose names share the prefix before `"."` are reported as one group
/// (workers register as `cpu.0`, `cpu.1`, ...). A default instance lives
/// behind [`Stats::global`].
pub struct Stats {
    inner: Mutex<StatsInner>,
}

static GLOBAL: OnceLock<Stats> = OnceLock::new();

impl Stats {
    pub fn global() -> &'static Stats {
        GLOBAL.get_or_init(Stats::new)
    }

    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                stats: Vec::new(),
                window: Clock::new(),
            }),
        }
    }

    pub fn make_stat(&self, name: impl Into<String>) -> Arc<Stat> {
        let stat = Arc::new(Stat::new(name.into()));

        let mut inner = self.inner.lock();
        inner.stats.push(Arc::clone(&stat));
        inner.stats.sort_by(|a, b| a.name().cmp(b.name()));

        stat
    }

    /// Logs per-stat and per-group load lines through the [`System`] sink,
    /// then resets every stat and the report window.
    pub fn show(&self) {
        let mut inner = self.inner.lock();
        let total_seconds = inner.window.reset();

        let mut groups: BTreeMap<&str, Vec<&Arc<Stat>>> = BTreeMap::new();
        for stat in &inner.stats {
            let group = stat.name().split('.').next().unwrap_or_default();
            groups.entry(group).or_default().push(stat);
        }

        let system = System::global();
        for (group, stats) in groups {
            let mut total_load = 0.0;
            let mut total_busy = 0.0;
            let mut total_num = 0;

            for stat in stats {
                system.log(&format!(
                    "Load '{}': {:.3} ({} vthreads)\n",
                    stat.name(),
                    stat.load(),
                    stat.count(),
                ));

                total_load += stat.load();
                total_busy += stat.busy_seconds();
                total_num += stat.count();

                stat.reset();
            }

            system.log(&format!(
                "Load '{}' (all): {:.3} ({} vthreads), total busy {:.3}% ({:.3} seconds)\n",
                group,
                total_load,
                total_num,
                if total_seconds > 0.0 {
                    (total_busy / total_seconds) * 100.0
                } else {
                    0.0
                },
                total_seconds,
            ));
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stats")
            .field("stats", &self.inner.lock().stats.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_and_load() {
        let stats = Stats::new();
        let stat = stats.make_stat("cpu.0");

        stat.report_busy(0.3);
        stat.report_busy(0.3);
        stat.report_idle(0.4);

        assert!((stat.load() - 0.6).abs() < 1e-6);
        assert_eq!(stat.count(), 2);
        assert!((stat.busy_seconds() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_load_without_observations() {
        let stats = Stats::new();
        let stat = stats.make_stat("cpu.0");
        assert_eq!(stat.load(), 0.0);
    }

    #[test]
    fn test_show_resets_stats() {
        let stats = Stats::new();
        let a = stats.make_stat("cpu.0");
        let b = stats.make_stat("gpu.0");

        a.report_busy(0.5);
        b.report_idle(0.5);

        stats.show();

        assert_eq!(a.count(), 0);
        assert_eq!(a.busy_seconds(), 0.0);
        assert_eq!(b.load(), 0.0);
    }

    #[test]
    fn test_stats_sorted_by_name() {
        let stats = Stats::new();
        stats.make_stat("cpu.1");
        stats.make_stat("cpu.0");

        let names: Vec<String> = stats
            .inner
            .lock()
            .stats
            .iter()
            .map(|s| s.name().to_owned())
            .collect();
        assert_eq!(names, vec!["cpu.0", "cpu.1"]);
    }
}
