// -------------------------------------------------------------------------------------------------
// ---- LogLevel -----------------------------------------------------------------------------------

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Filter directive for `tracing_subscriber::EnvFilter`.
    ///
    /// Statement echo is logged at debug level under this crate's target, so
    /// asking for echo raises just that target when the base level is quieter.
    pub fn directive(self, echo: bool) -> String {
        match (self, echo) {
            (LogLevel::Trace | LogLevel::Debug, _) | (_, false) => self.as_str().to_string(),
            (_, true) => format!("{},pgkeeper=debug", self.as_str()),
        }
    }
}

// -------------------------------------------------------------------------------------------------
// ---- Tests --------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_raises_only_the_crate_target() {
        assert_eq!(LogLevel::Warn.directive(false), "warn");
        assert_eq!(LogLevel::Warn.directive(true), "warn,pgkeeper=debug");
        assert_eq!(LogLevel::Trace.directive(true), "trace");
    }
}

// -------------------------------------------------------------------------------------------------
// -------------------------------------------------------------------------------------------------
