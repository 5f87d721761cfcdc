use std::fs::OpenOptions;
use std::io::Write;
use whodb_core::{AppConfig, LogLevel};

/// Log writer that mirrors everything to the debug file as well as stderr.
struct TeeWriter {
    file: std::fs::File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        self.file.flush()
    }
}

pub fn init(config: &AppConfig, quiet: bool) {
    let filter = if quiet && config.log_level == LogLevel::Info {
        "warn"
    } else {
        config.log_level.as_filter()
    };

    let mut builder = env_logger::Builder::new();
    builder.parse_filters(filter);

    if config.debug_file
        && let Ok(dir) = whodb_core::data_dir()
        && let Ok(file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("debug.log"))
    {
        builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
    }

    let _ = builder.try_init();
}
