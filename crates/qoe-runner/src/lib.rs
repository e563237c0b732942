pub mod dispatcher;
pub mod fsutil;
pub mod metrics;
pub mod orchestrator;
pub mod probe;
pub mod queue;
pub mod result;
pub mod scheduler;
pub mod session;
pub mod simulated;
pub mod trace;

pub use dispatcher::{DispatchConfig, DispatchError, Dispatcher, JobPlan};
pub use metrics::{derive, summarize, DerivedMetrics, QoeSummary};
pub use orchestrator::{run_experiment, ExperimentConfig, ExperimentOrchestrator, RunError, RunStage};
pub use queue::{Job, JobQueue, MemoryQueue, RedisQueue};
pub use result::{ExperimentResult, TelemetryMode};
pub use scheduler::{ReplayOutcome, ReplayPolicy};
pub use session::{ControlSession, SessionError, SessionFactory};
pub use simulated::{SimulatedFactory, SimulatedSession, SimulationConfig};
pub use trace::{NetworkProfile, Trace, TraceError};
