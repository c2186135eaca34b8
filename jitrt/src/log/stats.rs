//! Records statistics about the JIT and the runtime it is part of. "Durations" are wall-clock
//! time, so they are "best effort" rather than precise.

#[cfg(not(test))]
use std::env;
use std::{
    cell::Cell,
    fs,
    ops::DerefMut,
    sync::Mutex,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if enabled. Outside of tests, this is only enabled if the user defines the
/// environment variable `JITRT_LOG_STATS`. In tests it is always enabled, with output sent to
/// `stderr`.
pub struct Stats {
    // Most runs won't record statistics, so "are stats enabled?" must be a cheap check: only if
    // they are do we pay for locking a `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

/// A copy of the counters at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsCounts {
    pub functions_compiled_ok: u64,
    pub functions_compiled_err: u64,
    pub bailouts: u64,
    pub invalidations: u64,
    pub jit_entries: u64,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    counts: StatsCounts,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        Self {
            inner: env::var("JITRT_LOG_STATS")
                .ok()
                .map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If statistics are enabled, update `inner` by running `f`, otherwise return immediately
    /// without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            if let Ok(mut lk) = mtx.lock() {
                f(lk.deref_mut());
            }
        }
    }

    pub fn function_compiled_ok(&self) {
        self.update_with(|inner| inner.counts.functions_compiled_ok += 1);
    }

    pub fn function_compiled_err(&self) {
        self.update_with(|inner| inner.counts.functions_compiled_err += 1);
    }

    pub fn bailout(&self) {
        self.update_with(|inner| inner.counts.bailouts += 1);
    }

    pub fn invalidation(&self) {
        self.update_with(|inner| inner.counts.invalidations += 1);
    }

    pub fn jit_entry(&self) {
        self.update_with(|inner| inner.counts.jit_entries += 1);
    }

    /// The current counters, or `None` if statistics are disabled.
    pub fn counts(&self) -> Option<StatsCounts> {
        let mtx = self.inner.as_ref()?;
        mtx.lock().ok().map(|lk| lk.counts)
    }

    /// Change the [TimingState] the current thread is in, returning the previous state.
    pub fn timing_state(&self, new_state: TimingState) -> TimingState {
        let now = Instant::now();
        let (prev_state, then) = VM_STATE.replace((new_state, now));
        self.update_with(|inner| {
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
        prev_state
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            counts: StatsCounts::default(),
            durations: [Duration::new(0, 0); TimingState::COUNT],
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. Fields are sorted by name so that the output can be
    /// matched textually.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let c = &self.counts;
        let mut fields = vec![
            ("bailouts".to_owned(), c.bailouts.to_string()),
            (
                "functions_compiled_err".to_owned(),
                c.functions_compiled_err.to_string(),
            ),
            (
                "functions_compiled_ok".to_owned(),
                c.functions_compiled_ok.to_string(),
            ),
            ("invalidations".to_owned(), c.invalidations.to_string()),
            ("jit_entries".to_owned(), c.jit_entries.to_string()),
        ];
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The different timing states a thread can go through.
///
/// Variants must range over `0..TimingState::COUNT` (no explicit discriminants). A state whose
/// `to_string` is empty is not shown in the JSON output.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
pub enum TimingState {
    /// The "we don't know what this thread is doing" state.
    #[strum(to_string = "")]
    None,
    #[strum(to_string = "duration_compiling")]
    Compiling,
    #[strum(to_string = "duration_bailing_out")]
    BailingOut,
    #[strum(to_string = "duration_jit_executing")]
    JitExecuting,
    #[strum(to_string = "duration_interpreting")]
    Interpreting,
}

thread_local! {
    static VM_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_is_sorted() {
        let stats = Stats::new();
        stats.bailout();
        stats.bailout();
        stats.function_compiled_ok();
        stats.timing_state(TimingState::Compiling);
        stats.timing_state(TimingState::None);
        assert_eq!(stats.counts().unwrap().bailouts, 2);
        let json = stats.inner.as_ref().unwrap().lock().unwrap().to_json();
        fm::FMatcher::new(
            r#"{
    "bailouts": 2,
    "duration_bailing_out": ...
    "duration_compiling": ...
    "duration_interpreting": ...
    "duration_jit_executing": ...
    "functions_compiled_err": 0,
    "functions_compiled_ok": 1,
    "invalidations": 0,
    "jit_entries": 0
}"#,
        )
        .unwrap()
        .matches(&json)
        .unwrap();
    }
}
