use thiserror::Error;

/// Contract violations inside the task pipeline. These are programming
/// errors, not runtime conditions: a caller that trips one has misused the
/// task context or handed the manager a payload it cannot decode. Transport
/// and storage failures travel as `anyhow::Error` task outcomes instead.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("cannot enter {wanted} state from state {current}")]
    InvalidStateTransition {
        current: &'static str,
        wanted: &'static str,
    },
    #[error("unknown task id {0}")]
    UnknownTask(i64),
    #[error("task payload failed to decode: {0}")]
    PayloadDecode(String),
}
