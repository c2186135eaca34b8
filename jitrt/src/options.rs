//! Runtime configuration.
//!
//! Every option has a default and can be overridden by the embedder with the `with_*` methods or
//! by the user with a `JITRT_*` environment variable (see [JitOptions::from_env]).

use std::{env, error::Error, fmt, str::FromStr};

/// The instruction set generated code is emitted for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target {
    /// The portable reference instruction set, executed in-process.
    Sim,
    /// The same, without floating point instructions: any function that needs a double operation
    /// cannot be compiled.
    SimNoFpu,
}

impl Target {
    pub(crate) fn has_fpu(self) -> bool {
        matches!(self, Target::Sim)
    }
}

impl FromStr for Target {
    type Err = Box<dyn Error>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sim" => Ok(Target::Sim),
            "sim-nofpu" => Ok(Target::SimNoFpu),
            _ => Err(format!("Unknown target '{s}'").into()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Sim => write!(f, "sim"),
            Target::SimNoFpu => write!(f, "sim-nofpu"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct JitOptions {
    /// How many interpreted calls a function needs before it is compiled.
    pub hot_threshold: u32,
    /// How many bailouts one guard site may take before the function is never compiled again.
    pub bailout_threshold: u32,
    /// How many times a function may be recompiled after invalidation.
    pub max_recompiles: u32,
    /// How deep calls are inlined.
    pub max_inline_depth: u32,
    /// The largest callee (in bytecode instructions) that is inlined.
    pub max_inline_size: u32,
    /// Compilation aborts if the graph grows beyond this many nodes.
    pub max_graph_nodes: u32,
    /// The most interpreter frames one activation may hold.
    pub max_frames: u32,
    pub target: Target,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            hot_threshold: 10,
            bailout_threshold: 10,
            max_recompiles: 4,
            max_inline_depth: 3,
            max_inline_size: 64,
            max_graph_nodes: 10_000,
            max_frames: 1000,
            target: Target::Sim,
        }
    }
}

impl JitOptions {
    /// The defaults, overridden by any `JITRT_*` environment variables that are set.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut opts = Self::default();
        env_override("JITRT_HOT_THRESHOLD", &mut opts.hot_threshold)?;
        env_override("JITRT_BAILOUT_THRESHOLD", &mut opts.bailout_threshold)?;
        env_override("JITRT_MAX_RECOMPILES", &mut opts.max_recompiles)?;
        env_override("JITRT_MAX_INLINE_DEPTH", &mut opts.max_inline_depth)?;
        env_override("JITRT_MAX_INLINE_SIZE", &mut opts.max_inline_size)?;
        env_override("JITRT_MAX_GRAPH_NODES", &mut opts.max_graph_nodes)?;
        env_override("JITRT_MAX_FRAMES", &mut opts.max_frames)?;
        env_override("JITRT_TARGET", &mut opts.target)?;
        if opts.max_frames == 0 {
            return Err("JITRT_MAX_FRAMES must be at least 1".into());
        }
        Ok(opts)
    }

    pub fn with_hot_threshold(mut self, x: u32) -> Self {
        self.hot_threshold = x;
        self
    }

    pub fn with_bailout_threshold(mut self, x: u32) -> Self {
        self.bailout_threshold = x;
        self
    }

    pub fn with_max_recompiles(mut self, x: u32) -> Self {
        self.max_recompiles = x;
        self
    }

    pub fn with_max_inline_depth(mut self, x: u32) -> Self {
        self.max_inline_depth = x;
        self
    }

    pub fn with_max_inline_size(mut self, x: u32) -> Self {
        self.max_inline_size = x;
        self
    }

    pub fn with_max_graph_nodes(mut self, x: u32) -> Self {
        self.max_graph_nodes = x;
        self
    }

    pub fn with_max_frames(mut self, x: u32) -> Self {
        self.max_frames = x;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}

fn env_override<T>(name: &str, slot: &mut T) -> Result<(), Box<dyn Error>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Ok(s) = env::var(name) {
        *slot = s
            .parse::<T>()
            .map_err(|e| format!("Invalid {name} value '{s}': {e}"))?;
    }
    Ok(())
}
