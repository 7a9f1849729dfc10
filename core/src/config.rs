//! Engine and pool configuration.

use std::time::Duration;

use delver_protocol::limits::EXECUTE_DEADLINE;

use crate::retry::RetryConfig;

/// Knobs for one engine instance. All sessions run by the engine share
/// this configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard ceiling on loop iterations per session.
    pub max_iterations: u32,
    /// Nudges in a row tolerated before a codeless turn forfeits its
    /// iteration; bounds total model calls per session.
    pub max_consecutive_nudges: u32,
    /// Wall-clock budget for one execute call.
    pub execute_timeout: Duration,
    /// Largest `content` accepted by `llm_query`; bigger raises in the
    /// sandbox.
    pub max_subcall_content_chars: usize,
    /// Sandbox output beyond this many chars is truncated before being
    /// shown to the model.
    pub max_output_chars: usize,
    /// Run the mechanical citation check on terminal answers.
    pub verify_citations: bool,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_consecutive_nudges: 2,
            execute_timeout: EXECUTE_DEADLINE,
            max_subcall_content_chars: 500_000,
            max_output_chars: 50_000,
            verify_citations: true,
            retry: RetryConfig::default(),
        }
    }
}

/// Knobs for the warm worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of pre-warmed workers.
    pub size: usize,
    /// Idle executors older than this are recycled.
    pub max_executor_age: Duration,
    /// Cadence of the recycling pass.
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 3,
            max_executor_age: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}
