//! Logger setup.
//!
//! Binaries log to stderr through `env_logger`. With the `python` feature,
//! records are forwarded into Python's `logging` module instead, under
//! logger names derived from the Rust target (`analog_input_rs.framer`, ...).

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static RUST_LOG_ONCE: Once = Once::new();

/// Level picked at first initialization.
static INSTALLED_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

/// `ANALOG_INPUT_LOG`, then `RUST_LOG`, then `info`.
pub fn env_level() -> LevelFilter {
    std::env::var("ANALOG_INPUT_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

/// Parse a level name such as `"debug"`; `None` for anything else.
pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Level chosen by whichever init function ran first.
pub fn installed_level() -> Option<LevelFilter> {
    INSTALLED_LEVEL.get().copied()
}

/// Initialize stderr logging for Rust binaries. Later calls are no-ops.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let level = *INSTALLED_LEVEL.get_or_init(env_level);
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use bridge::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once, PoisonError};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule};

    use super::{env_level, INSTALLED_LEVEL};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    struct PyLogger {
        level: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn py_level(level: Level) -> u8 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn level(&self) -> LevelFilter {
            *self.level.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = self.loggers.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(logger) = loggers.get(target) {
                return Ok(logger.clone_ref(py));
            }
            let logger = self
                .logging
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?
                .unbind();
            loggers.insert(target.to_string(), logger.clone_ref(py));
            Ok(logger)
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let logger = self.logger_for(py, &target)?;
            let logger = logger.bind(py);
            let level = py_level(record.level());
            if !logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                return Ok(());
            }
            logger.call_method1("log", (level, record.args().to_string()))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust log records into Python's `logging`. Safe to call repeatedly.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let mut result = Ok(());
        PY_LOG_ONCE.call_once(|| {
            let level = *INSTALLED_LEVEL.get_or_init(env_level);
            match py.import("logging") {
                Ok(logging) => {
                    let logger: &'static PyLogger = Box::leak(Box::new(PyLogger {
                        level: Mutex::new(level),
                        logging: logging.unbind(),
                        loggers: Mutex::new(HashMap::new()),
                    }));
                    if log::set_logger(logger).is_ok() {
                        log::set_max_level(level);
                        let _ = PY_LOGGER.set(logger);
                    }
                }
                Err(e) => result = Err(e),
            }
        });
        result
    }

    /// Change the forwarded level at runtime; `None` re-reads the environment.
    pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        init_python_logging(py)?;
        let level = level.and_then(super::parse_level).unwrap_or_else(env_level);
        if let Some(logger) = PY_LOGGER.get() {
            *logger.level.lock().unwrap_or_else(PoisonError::into_inner) = level;
            logger
                .loggers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        log::set_max_level(level);
        Ok(())
    }
}
