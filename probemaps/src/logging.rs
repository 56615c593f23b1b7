use thiserror::Error;
use tracing::Level;
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

pub static LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

pub static LOG_FORMATS: &[&str] = &["json", "text"];

#[derive(Error, Debug)]
pub enum SetupTracingError {
    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),

    #[error(transparent)]
    SetGlobalDefault(#[from] tracing_core::dispatcher::SetGlobalDefaultError),

    #[error("unknown log level")]
    UnknownLogLevel,

    #[error("unknown log message format")]
    UnknownLogFormat,
}

fn parse_level(level: &str) -> Result<(Level, log::LevelFilter), SetupTracingError> {
    match level {
        "trace" => Ok((Level::TRACE, log::LevelFilter::Trace)),
        "debug" => Ok((Level::DEBUG, log::LevelFilter::Debug)),
        "info" => Ok((Level::INFO, log::LevelFilter::Info)),
        "warn" => Ok((Level::WARN, log::LevelFilter::Warn)),
        "error" => Ok((Level::ERROR, log::LevelFilter::Error)),
        _ => Err(SetupTracingError::UnknownLogLevel),
    }
}

/// Installs the global tracing subscriber and forwards `log` records to it.
pub fn setup_tracing(log_level: &str, log_fmt: &str) -> Result<(), SetupTracingError> {
    let (level_tracing, level_log) = parse_level(log_level)?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level_tracing)
        .with_writer(std::io::stderr);
    match log_fmt {
        "json" => {
            let subscriber = builder.json().finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "text" => {
            let subscriber = builder.finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        _ => return Err(SetupTracingError::UnknownLogFormat),
    };

    LogTracer::builder().with_max_level(level_log).init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_levels() {
        for level in LOG_LEVELS {
            assert!(parse_level(level).is_ok());
        }
        assert_eq!(
            parse_level("debug").unwrap(),
            (Level::DEBUG, log::LevelFilter::Debug)
        );
    }

    #[test]
    fn unknown_level() {
        assert!(matches!(
            parse_level("verbose"),
            Err(SetupTracingError::UnknownLogLevel)
        ));
        assert!(matches!(
            setup_tracing("verbose", "text"),
            Err(SetupTracingError::UnknownLogLevel)
        ));
    }

    #[test]
    fn unknown_format() {
        // The format is checked before anything global is installed.
        assert!(matches!(
            setup_tracing("info", "xml"),
            Err(SetupTracingError::UnknownLogFormat)
        ));
    }
}
