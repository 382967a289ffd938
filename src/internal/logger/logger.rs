use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::internal::config::LoggingConfig;

/// Initialize the global logger with the given configuration.
///
/// The console layer writes to stderr: stdout belongs to call results and
/// must stay clean JSON.
pub fn init_logger(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    match (&cfg.output_path, cfg.disable_console) {
        // Both console and file
        (Some(output_path), false) => {
            let log_file = create_log_file(output_path, cfg.append_to_file)?;
            let file_writer = SharedFileWriter::new(log_file);

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(cfg.color)
                        .with_target(true),
                )
                .with(
                    fmt::layer()
                        .with_writer(file_writer)
                        .with_ansi(false)
                        .with_target(true),
                )
                .init();
        }
        // Only file
        (Some(output_path), true) => {
            let log_file = create_log_file(output_path, cfg.append_to_file)?;
            let file_writer = SharedFileWriter::new(log_file);

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(file_writer)
                        .with_ansi(false)
                        .with_target(true),
                )
                .init();
        }
        // Only console
        (None, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(cfg.color)
                        .with_target(true),
                )
                .init();
        }
        // No output requested
        (None, true) => {
            tracing_subscriber::registry().with(filter).init();
        }
    }

    Ok(())
}

fn create_log_file(path: &str, append: bool) -> anyhow::Result<fs::File> {
    let path = Path::new(path);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if !append && path.exists() {
        fs::remove_file(path)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(append)
        .write(true)
        .open(path)?;

    Ok(file)
}

/// Thread-safe writer for the file layer.
#[derive(Clone)]
struct SharedFileWriter {
    file: std::sync::Arc<std::sync::Mutex<fs::File>>,
}

impl SharedFileWriter {
    fn new(file: fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl io::Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().unwrap().flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for SharedFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
