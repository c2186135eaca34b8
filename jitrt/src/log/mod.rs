//! The implementation of the `JITRT_LOG*` environment variables.
//!
//! Note that IR logging is only meaningfully available when the `jitrt_debug` feature is enabled:
//! otherwise we expose no-op functions.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings (including compilation aborts).
    Warning,
    /// Log transitions of a function's JIT state.
    FunctionTransition,
    /// Log JIT events (compilations, bailouts, invalidations).
    JitEvent,
}

pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    /// Create a [Log] configured by `JITRT_LOG`.
    pub fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("JITRT_LOG") {
            Ok(s) => Self::from_str(&s),
            Err(_) => Ok(Self::with_level(Verbosity::Error)),
        }
    }

    /// Parse `[<path>|-:]<level>`.
    pub fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any existing log so that appends don't mix with a previous run.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("JITRT_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid JITRT_LOG level '{s}': {e}"))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("JITRT_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { level, path })
    }

    pub fn with_level(level: Verbosity) -> Self {
        Self { level, path: None }
    }

    pub fn level(&self) -> Verbosity {
        self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "jitrt-error",
                Verbosity::Warning => "jitrt-warning",
                Verbosity::FunctionTransition => "jitrt-transition",
                Verbosity::JitEvent => "jitrt-jit-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => eprintln!("{prefix}: {msg}"),
            }
        }
    }
}

/// The points in the compilation pipeline whose IR can be logged with `JITRT_LOG_IR`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum IRPhase {
    /// The MIR as built from bytecode.
    Mir,
    /// The MIR after the optimisation passes.
    MirOpt,
    /// The LIR after register allocation.
    Lir,
    /// The generated code.
    Asm,
}

#[cfg(not(feature = "jitrt_debug"))]
mod internals {
    use super::IRPhase;

    pub(crate) fn should_log_ir(_: IRPhase) -> bool {
        false
    }

    pub(crate) fn log_ir(_: &str) {}
}

#[cfg(feature = "jitrt_debug")]
mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let x = env::var("JITRT_LOG_IR").ok()?;
        let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
            [path, phases] => (*path, *phases),
            [phases] => ("-", *phases),
            _ => panic!("JITRT_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"),
        };
        let mut log_phases = HashSet::new();
        for x in phases.split(',') {
            log_phases.insert(IRPhase::from_str(x).unwrap());
        }
        if path != "-" {
            File::create(path).ok();
        }
        Some((path.to_string(), log_phases))
    });

    impl IRPhase {
        fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "mir" => Ok(Self::Mir),
                "mir-opt" => Ok(Self::MirOpt),
                "lir" => Ok(Self::Lir),
                "asm" => Ok(Self::Asm),
                _ => Err(format!("Invalid JITRT_LOG_IR value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        LOG_IR
            .as_ref()
            .map(|(_, phases)| phases.contains(&phase))
            .unwrap_or(false)
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};
