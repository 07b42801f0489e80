// localrunner-sdk: foundation layer for the local workflow runner.
// No dependencies on other localrunner crates. Provides the trace-writer seam,
// child process invocation with cancellation, and executable lookup.

pub mod process_invoker;
pub mod trace;
pub mod which_util;

pub use process_invoker::{ProcessExitCodeError, ProcessInvoker, ProcessOutputLine, ProcessSpec};
pub use trace::TraceWriter;
pub use which_util::WhichUtil;
