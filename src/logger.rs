use std::fmt;
use std::sync::Arc;

use log::Level;

/// Scoped logger handed to each component by its owner.
///
/// Every line goes through the `log` facade under the `llama_worker` target,
/// prefixed with the scope so worker, coordinator and per-request output can
/// be told apart in one file.
#[derive(Clone)]
pub struct Logger {
    scope: Arc<str>,
}

impl Logger {
    pub const TARGET: &'static str = "llama_worker";

    pub fn new(scope: &str) -> Self {
        Self {
            scope: Arc::from(scope),
        }
    }

    pub fn log(&self, level: Level, message: &str) {
        log::log!(target: Self::TARGET, level, "[{}] {}", self.scope, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("scope", &self.scope).finish()
    }
}

// Convenience macros
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {
        $logger.info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {
        $logger.warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.error(&format!($($arg)*))
    };
}

/// Install a log4rs file appender under `log_dir` plus a stderr appender.
///
/// Used by binaries; the library itself only talks to the `log` facade.
pub fn setup_logging(
    log_dir: &str,
    level: log::LevelFilter,
) -> Result<(), Box<dyn std::error::Error>> {
    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    std::fs::create_dir_all(log_dir)?;
    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H_%M").to_string();
    let log_path = format!("{log_dir}/{timestamp}.log");

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}",
        )))
        .build(log_path)?;
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{l} - {m}{n}")))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(
            Root::builder()
                .appender("file")
                .appender("stderr")
                .build(level),
        )?;

    log4rs::init_config(config)?;

    Ok(())
}
