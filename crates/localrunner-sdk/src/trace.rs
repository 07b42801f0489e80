/// Lightweight diagnostic output seam.
///
/// Components that may run outside a job (process invocation, lookups) write
/// through this trait instead of depending on the execution context.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str) {
        self.info(&format!("##[warning]{message}"));
    }

    /// Log an error message.
    fn error(&self, message: &str) {
        self.info(&format!("##[error]{message}"));
    }
}

/// Forwards to the `tracing` crate under a fixed target.
#[derive(Debug, Clone)]
pub struct TracingTraceWriter {
    target: &'static str,
}

impl TracingTraceWriter {
    pub fn new(target: &'static str) -> Self {
        Self { target }
    }
}

impl TraceWriter for TracingTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!(target: "trace", component = self.target, "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(target: "trace", component = self.target, "{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!(target: "trace", component = self.target, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "trace", component = self.target, "{}", message);
    }
}

/// Discards everything.
#[derive(Debug, Clone)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// The level of a collected trace message.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TraceLevel {
    Info,
    Verbose,
    Warning,
    Error,
}

/// Collects all messages in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CollectingTraceWriter {
    messages: parking_lot::Mutex<Vec<(TraceLevel, String)>>,
}

#[cfg(test)]
impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return all collected messages.
    pub fn messages(&self) -> Vec<(TraceLevel, String)> {
        self.messages.lock().clone()
    }

    fn push(&self, level: TraceLevel, message: &str) {
        self.messages.lock().push((level, message.to_string()));
    }
}

#[cfg(test)]
impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.push(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.push(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.push(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.push(TraceLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_writer_keeps_order_and_level() {
        let writer = CollectingTraceWriter::new();
        writer.info("hello");
        writer.warning("warn");
        writer.error("err");
        writer.verbose("verb");
        let msgs = writer.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0], (TraceLevel::Info, "hello".into()));
        assert_eq!(msgs[1], (TraceLevel::Warning, "warn".into()));
        assert_eq!(msgs[2], (TraceLevel::Error, "err".into()));
        assert_eq!(msgs[3], (TraceLevel::Verbose, "verb".into()));
    }

    #[test]
    fn default_warning_prefixes_info() {
        struct InfoOnly(parking_lot::Mutex<Vec<String>>);
        impl TraceWriter for InfoOnly {
            fn info(&self, message: &str) {
                self.0.lock().push(message.to_string());
            }
            fn verbose(&self, _message: &str) {}
        }

        let writer = InfoOnly(parking_lot::Mutex::new(Vec::new()));
        writer.warning("careful");
        writer.error("broken");
        assert_eq!(
            *writer.0.lock(),
            vec!["##[warning]careful".to_string(), "##[error]broken".to_string()]
        );
    }
}
