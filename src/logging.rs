//! Day-rotating, size-capped log writer.
//!
//! Each stream (`monitorServiceLog`, `monitorFileLog`, `monitorCfgLog`) gets
//! its own directory of `YYYYMMDD.log` files; once the active file exceeds
//! the configured size cap a new file with a `_k` suffix is opened, `k`
//! increasing monotonically within the day.

use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::MakeWriter;

struct RollingState {
    dir: PathBuf,
    day: String,
    suffix: u32,
    cap_bytes: Option<u64>,
    file: File,
}

impl RollingState {
    fn open(dir: &Path, day: &str, suffix: u32) -> io::Result<File> {
        fs::create_dir_all(dir)?;
        let name = if suffix == 0 { format!("{day}.log") } else { format!("{day}_{suffix}.log") };
        OpenOptions::new().create(true).append(true).open(dir.join(name))
    }

    fn roll_if_needed(&mut self) -> io::Result<()> {
        let today = Local::now().format("%Y%m%d").to_string();
        if today != self.day {
            self.day = today;
            self.suffix = 0;
            self.file = Self::open(&self.dir, &self.day, self.suffix)?;
            return Ok(());
        }

        if let Some(cap) = self.cap_bytes {
            if self.file.metadata()?.len() >= cap {
                self.suffix += 1;
                self.file = Self::open(&self.dir, &self.day, self.suffix)?;
            }
        }

        Ok(())
    }
}

/// A `tracing_subscriber` writer that rotates by day and, within a day, by
/// size once `cap_mb` is exceeded.
#[derive(Clone)]
pub struct DayRollingWriter {
    state: std::sync::Arc<Mutex<RollingState>>,
}

impl DayRollingWriter {
    pub fn new(dir: impl Into<PathBuf>, cap_mb: Option<u64>) -> io::Result<Self> {
        let dir = dir.into();
        let day = Local::now().format("%Y%m%d").to_string();
        let file = RollingState::open(&dir, &day, 0)?;
        let cap_bytes = cap_mb.map(|mb| mb * 1024 * 1024);

        Ok(Self { state: std::sync::Arc::new(Mutex::new(RollingState { dir, day, suffix: 0, cap_bytes, file })) })
    }

    /// Replace the size cap, used when `[CommonData].LogFileSize` changes on
    /// a hot reload.
    pub fn set_cap_mb(&self, cap_mb: Option<u64>) {
        self.state.lock().cap_bytes = cap_mb.map(|mb| mb * 1024 * 1024);
    }
}

pub struct DayRollingGuard {
    state: std::sync::Arc<Mutex<RollingState>>,
}

impl Write for DayRollingGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.roll_if_needed()?;
        state.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for DayRollingWriter {
    type Writer = DayRollingGuard;

    fn make_writer(&'a self) -> Self::Writer {
        DayRollingGuard { state: self.state.clone() }
    }
}
