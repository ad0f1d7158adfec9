use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// When the log sink forwards its buffer to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoFlush {
    /// Only on explicit `flush` (or via the flush thread).
    #[default]
    Never,
    /// After every `log` call.
    Always,
    /// After every `log` call whose text ends with a newline.
    EndOfLine,
}

/// Configuration applied when constructing a [`System`].
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    /// Global debug level; 0 disables debug narration.
    pub debug_level: i32,
    /// Per-topic overrides: the first key contained in a topic wins.
    pub debug_level_for: Vec<(String, i32)>,
    pub auto_flush: AutoFlush,
    /// When set, a background thread flushes the sink every N milliseconds.
    pub flush_thread_interval_ms: Option<u64>,
}

struct Levels {
    global: i32,
    overrides: Vec<(String, i32)>,
}

struct Sink {
    buf: String,
    mode: AutoFlush,
}

struct FlushThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Process-wide configuration and log surface.
///
/// Holds the debug-level flags consulted by the scheduler's narration, and a
/// buffered log sink that drains to stderr according to its [`AutoFlush`]
/// mode. A default instance lives behind [`System::global`]; tests construct
/// their own.
pub struct System {
    levels: RwLock<Levels>,
    sink: Arc<Mutex<Sink>>,
    flusher: Mutex<Option<FlushThread>>,
}

static GLOBAL: OnceLock<System> = OnceLock::new();

impl System {
    pub fn global() -> &'static System {
        GLOBAL.get_or_init(|| System::new(SystemConfig::default()))
    }

    pub fn new(cfg: SystemConfig) -> Self {
        let system = Self {
            levels: RwLock::new(Levels {
                global: cfg.debug_level,
                overrides: cfg.debug_level_for,
            }),
            sink: Arc::new(Mutex::new(Sink {
                buf: String::new(),
                mode: cfg.auto_flush,
            })),
            flusher: Mutex::new(None),
        };

        if let Some(ms) = cfg.flush_thread_interval_ms {
            system.start_flush_thread(ms);
        }

        system
    }

    pub fn debug_level(&self) -> i32 {
        self.levels.read().global
    }

    pub fn set_debug_level(&self, level: i32) {
        self.levels.write().global = level;
    }

    /// Level for a topic: the first override whose key is contained in the
    /// topic wins, otherwise the global level.
    pub fn debug_level_for(&self, topic: &str) -> i32 {
        let levels = self.levels.read();
        levels
            .overrides
            .iter()
            .find(|(key, _)| topic.contains(key.as_str()))
            .map(|(_, level)| *level)
            .unwrap_or(levels.global)
    }

    pub fn set_debug_level_for(&self, key: impl Into<String>, level: i32) {
        let key = key.into();
        let mut levels = self.levels.write();
        match levels.overrides.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = level,
            None => levels.overrides.push((key, level)),
        }
    }

    pub fn set_auto_flush(&self, mode: AutoFlush) {
        self.sink.lock().mode = mode;
    }

    /// Appends to the sink, then flushes if the auto-flush mode asks for it.
    pub fn log(&self, text: &str) {
        let should_flush = {
            let mut sink = self.sink.lock();
            sink.buf.push_str(text);

            match sink.mode {
                AutoFlush::Always => true,
                AutoFlush::EndOfLine => text.ends_with('\n'),
                AutoFlush::Never => false,
            }
        };

        if should_flush {
            self.flush();
        }
    }

    /// Timestamped debug line; callers gate on [`System::debug_level_for`].
    pub fn log_debug(&self, topic: &str, args: fmt::Arguments<'_>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = now.as_secs();
        let line = format!(
            "(-) [{:02}:{:02}:{:02}.{:03}] ({:?}) {}: {}\n",
            (secs / 3600) % 24,
            (secs / 60) % 60,
            secs % 60,
            now.subsec_millis(),
            thread::current().id(),
            topic,
            args,
        );
        self.log(&line);
    }

    /// Drains the buffer to stderr.
    pub fn flush(&self) {
        flush_sink(&self.sink);
    }

    /// Bytes currently buffered in the sink.
    pub fn pending(&self) -> usize {
        self.sink.lock().buf.len()
    }

    /// Starts the background flusher. A second call while one is running is
    /// a no-op.
    pub fn start_flush_thread(&self, interval_ms: u64) {
        let mut flusher = self.flusher.lock();
        if flusher.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let sink = Arc::clone(&self.sink);
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("weft-flush".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(interval_ms));
                    flush_sink(&sink);
                }
                flush_sink(&sink);
            })
            .expect("failed to spawn flush thread");

        *flusher = Some(FlushThread { stop, handle });
    }

    /// Stops the background flusher and waits for its final flush.
    pub fn stop_flush_thread(&self) {
        let flusher = self.flusher.lock().take();
        if let Some(FlushThread { stop, handle }) = flusher {
            stop.store(true, Ordering::Release);
            let _ = handle.join();
        }
    }

    /// Restores defaults: no flush thread, level 0, empty sink.
    pub fn reset(&self) {
        self.stop_flush_thread();

        {
            let mut levels = self.levels.write();
            levels.global = 0;
            levels.overrides.clear();
        }

        let mut sink = self.sink.lock();
        sink.buf.clear();
        sink.mode = AutoFlush::Never;
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.stop_flush_thread();
        self.flush();
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("debug_level", &self.debug_level())
            .field("pending", &self.pending())
            .finish()
    }
}

fn flush_sink(sink: &Mutex<Sink>) {
    let out = std::mem::take(&mut sink.lock().buf);
    if !out.is_empty() {
        eprint!("{out}");
    }
}

pub fn set_debug_level(level: i32) {
    System::global().set_debug_level(level);
}

pub fn set_debug_level_for(key: impl Into<String>, level: i32) {
    System::global().set_debug_level_for(key, level);
}

pub fn debug_level(topic: &str) -> i32 {
    System::global().debug_level_for(topic)
}

/// Debug narration into the global sink, gated by the topic's debug level.
macro_rules! sys_debug {
    ($topic:expr, $($arg:tt)*) => {{
        let system = $crate::system::System::global();
        if system.debug_level_for($topic) > 0 {
            system.log_debug($topic, format_args!($($arg)*));
        }
    }};
}
pub(crate) use sys_debug;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_level_lookup() {
        let system = System::new(SystemConfig {
            debug_level: 1,
            debug_level_for: vec![("task_node::".into(), 3), ("task_".into(), 2)],
            ..Default::default()
        });

        // First matching override wins; fall back to the global level.
        assert_eq!(system.debug_level_for("task_node::notify"), 3);
        assert_eq!(system.debug_level_for("task_list::append"), 2);
        assert_eq!(system.debug_level_for("vthread::start"), 1);

        system.set_debug_level_for("vthread", 0);
        assert_eq!(system.debug_level_for("vthread::start"), 0);
    }

    #[test]
    fn test_end_of_line_flushes_on_newline() {
        let system = System::new(SystemConfig {
            auto_flush: AutoFlush::EndOfLine,
            ..Default::default()
        });

        system.log("partial");
        assert!(system.pending() > 0);

        system.log(" line\n");
        assert_eq!(system.pending(), 0);
    }

    #[test]
    fn test_always_flushes_immediately() {
        let system = System::new(SystemConfig {
            auto_flush: AutoFlush::Always,
            ..Default::default()
        });

        system.log("no newline");
        assert_eq!(system.pending(), 0);
    }

    #[test]
    fn test_flush_thread_drains_sink() {
        let system = System::new(SystemConfig {
            flush_thread_interval_ms: Some(5),
            ..Default::default()
        });

        system.log("buffered");
        let mut drained = false;
        for _ in 0..100 {
            if system.pending() == 0 {
                drained = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(drained);
        system.stop_flush_thread();
    }

    #[test]
    fn test_reset_restores_defaults() {
        let system = System::new(SystemConfig {
            debug_level: 5,
            auto_flush: AutoFlush::Always,
            flush_thread_interval_ms: Some(50),
            ..Default::default()
        });

        system.reset();

        assert_eq!(system.debug_level(), 0);
        assert_eq!(system.pending(), 0);
        assert!(system.flusher.lock().is_none());
    }
}
