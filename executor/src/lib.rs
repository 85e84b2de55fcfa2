//! Sandboxed executors: the isolate-backed per-case path and the warm
//! pre-spawned runner path. Both take a loaded problem plus submission
//! source and return a fully-shaped run result; infrastructure failures are
//! folded into error-shaped results with `internal` attribution.

mod isolate;
mod meta;
mod stage;
mod warm;

pub use isolate::IsolateConfig;
pub use isolate::IsolateExecutor;
pub use stage::ensure_harness;
pub use warm::ChildCommand;
pub use warm::HardeningSpec;
pub use warm::INFRA_ERROR_MARKER;
pub use warm::ResourceLimits;
pub use warm::WarmConfig;
pub use warm::WarmError;
pub use warm::WarmExecutor;
pub use warm::WarmJobSpec;
pub use warm::run_warm_child;

pub(crate) use warm::spec::THREAD_ENV_DEFAULTS;
