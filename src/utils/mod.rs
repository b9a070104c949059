use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub mod device;
pub mod sys_route;

/// Initialize the global tracing subscriber. `level` accepts the CLI names
/// DEBUG, INFO, WARNING and ERROR; a non-empty `log_file` adds a plain-text
/// file sink instead of stderr.
pub fn init_tracing(level: &str, log_file: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match level.to_ascii_uppercase().as_str() {
        "DEBUG" => LevelFilter::DEBUG,
        "INFO" => LevelFilter::INFO,
        "WARNING" | "WARN" => LevelFilter::WARN,
        "ERROR" => LevelFilter::ERROR,
        other => return Err(format!("unknown log level: {}", other).into()),
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_line_number(true)
        .with_file(true);

    if log_file.is_empty() {
        tracing::subscriber::set_global_default(builder.finish())?;
    } else {
        let file = std::fs::File::create(resolve_path(log_file))?;
        tracing::subscriber::set_global_default(
            builder
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file))
                .finish(),
        )?;
    }
    Ok(())
}

/// Resolve a possibly-relative path against the executable directory, the
/// way service installs expect; falls back to the path as given.
pub fn resolve_path(path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        return path;
    }
    match std::env::current_exe() {
        Ok(exe) => match exe.parent() {
            Some(dir) => dir.join(path),
            None => path,
        },
        Err(_) => path,
    }
}
