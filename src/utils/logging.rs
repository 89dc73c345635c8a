use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use crate::config::LoggingConfig;
use crate::utils::error::{AppError, Result};

/// Install the global subscriber. The returned guard must outlive the process'
/// logging, otherwise buffered lines written to `output_path` are lost.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let directive = format!("web_history={}", config.level)
        .parse::<Directive>()
        .map_err(|e| AppError::Parse {
            message: format!("invalid log level '{}': {}", config.level, e),
        })?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    match &config.output_path {
        Some(output_path) => {
            let path = Path::new(output_path);
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path.file_name().ok_or_else(|| AppError::Parse {
                message: format!("invalid log output path: {}", output_path),
            })?;

            let appender =
                tracing_appender::rolling::never(directory.unwrap_or(Path::new(".")), file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| AppError::Internal(format!("failed to init tracing: {}", e)))?;

            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| AppError::Internal(format!("failed to init tracing: {}", e)))?;

            Ok(None)
        }
    }
}
