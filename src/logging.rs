use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{Local, NaiveDate};
use env_logger::{Builder, Env, Target};

use crate::config::LoggingConfig;
use crate::store::persistence::log_file_name;

/// Installs the global logger.
///
/// - Level defaults to `info`, `RUST_LOG` overrides it
/// - Lines always go to stderr
/// - With `logging.dir` set, lines are also appended to
///   `<dir>/<prefix>_<YYYY-MM-DD>.log`, one file per local day
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {}: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if let Some(dir) = &cfg.dir {
        fs::create_dir_all(dir)?;
        builder.target(Target::Pipe(Box::new(DailyTee::new(dir.clone(), &cfg.prefix))));
    }

    builder.try_init()?;
    Ok(())
}

/// Writer duplicating every line to stderr and to the current day's file.
///
/// The file is reopened when the local date changes. A file that cannot
/// be written never silences stderr.
struct DailyTee {
    dir: PathBuf,
    prefix: String,
    current: Option<(NaiveDate, File)>,
}

impl DailyTee {
    fn new(dir: PathBuf, prefix: &str) -> Self {
        Self {
            dir,
            prefix: prefix.to_string(),
            current: None,
        }
    }

    fn file_for(&mut self, today: NaiveDate) -> io::Result<&mut File> {
        let stale = self.current.as_ref().is_none_or(|(date, _)| *date != today);
        if stale {
            let path = self.dir.join(log_file_name(&self.prefix, today));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.current = Some((today, file));
        }

        match &mut self.current {
            Some((_, file)) => Ok(file),
            None => Err(io::Error::other("log file unavailable")),
        }
    }

    fn write_dated(&mut self, today: NaiveDate, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;

        if self.file_for(today).and_then(|f| f.write_all(buf)).is_err() {
            // Retried on the next line.
            self.current = None;
        }
        Ok(buf.len())
    }
}

impl Write for DailyTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_dated(Local::now().date_naive(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some((_, file)) = &mut self.current {
            file.flush()?;
        }
        Ok(())
    }
}
