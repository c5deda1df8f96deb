//! Logging init helper and rotating file writer.
//!
//! Grounded on `tracing-appender`'s rolling-file pattern but hand-rolled to
//! match the exact `{name}.{index}.log` naming and rotation contract: the
//! active file is renamed to the next free index on rotation and files
//! beyond `max_files` are pruned, which differs from `tracing-appender`'s
//! own naming scheme.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Where log output goes and how much of it is kept.
#[derive(Clone, Debug)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub name: String,
    pub max_files: usize,
    pub max_bytes_per_file: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            name: "unilink".to_string(),
            max_files: 5,
            max_bytes_per_file: 10 * 1024 * 1024,
        }
    }
}

/// Initializes a process-wide `tracing` subscriber honoring `RUST_LOG`,
/// falling back to `info`. Safe to call more than once; subsequent calls
/// are no-ops (mirrors the runtime's lazy-singleton shutdown/reset style).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// A writer implementing `{name}.{index}.log` rotation: the active file
/// rotates to the next free index once it exceeds `max_bytes_per_file`,
/// and indices beyond `max_files` are deleted.
pub struct RollingFileWriter {
    inner: Mutex<Inner>,
}

struct Inner {
    config: LogConfig,
    current: File,
    current_len: u64,
}

impl RollingFileWriter {
    pub fn new(config: LogConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.directory)?;
        let active_path = active_path(&config);
        let current = OpenOptions::new().create(true).append(true).open(&active_path)?;
        let current_len = current.metadata()?.len();
        Ok(Self { inner: Mutex::new(Inner { config, current, current_len }) })
    }

    fn rotate(inner: &mut Inner) -> io::Result<()> {
        let active = active_path(&inner.config);
        // Shift {name}.{i}.log -> {name}.{i+1}.log from the highest index
        // down, so the just-filled active file lands at index 1. An index
        // that would land beyond max_files is removed instead of renamed.
        for idx in (1..=inner.config.max_files).rev() {
            let from = indexed_path(&inner.config, idx);
            if !from.exists() {
                continue;
            }
            let to_idx = idx + 1;
            if to_idx > inner.config.max_files {
                fs::remove_file(&from)?;
            } else {
                fs::rename(&from, indexed_path(&inner.config, to_idx))?;
            }
        }
        if active.exists() {
            fs::rename(&active, indexed_path(&inner.config, 1))?;
        }
        prune_beyond(&inner.config)?;

        inner.current = OpenOptions::new().create(true).append(true).truncate(false).open(&active)?;
        inner.current_len = 0;
        Ok(())
    }
}

fn active_path(config: &LogConfig) -> PathBuf {
    config.directory.join(format!("{}.log", config.name))
}

fn indexed_path(config: &LogConfig, index: usize) -> PathBuf {
    config.directory.join(format!("{}.{index}.log", config.name))
}

fn prune_beyond(config: &LogConfig) -> io::Result<()> {
    let mut index = config.max_files + 1;
    loop {
        let path = indexed_path(config, index);
        if !path.exists() {
            break;
        }
        fs::remove_file(&path)?;
        index += 1;
    }
    Ok(())
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.current_len + buf.len() as u64 > inner.config.max_bytes_per_file && inner.current_len > 0 {
            Self::rotate(&mut inner)?;
        }
        let n = inner.current.write(buf)?;
        inner.current_len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().unwrap().current.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingFileWriter {
    type Writer = RollingFileHandle<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RollingFileHandle(self)
    }
}

pub struct RollingFileHandle<'a>(&'a RollingFileWriter);

impl Write for RollingFileHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.0.inner.lock().unwrap();
        if inner.current_len + buf.len() as u64 > inner.config.max_bytes_per_file && inner.current_len > 0 {
            RollingFileWriter::rotate(&mut inner)?;
        }
        let n = inner.current.write(buf)?;
        inner.current_len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.inner.lock().unwrap().current.flush()
    }
}

#[cfg(test)]
fn existing_index_files(config: &LogConfig) -> Vec<PathBuf> {
    (1..=config.max_files + 1).map(|i| indexed_path(config, i)).filter(|p| p.exists()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_accumulate_in_the_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            directory: dir.path().to_path_buf(),
            name: "test".into(),
            max_files: 3,
            max_bytes_per_file: 1024,
        };
        let mut writer = RollingFileWriter::new(config.clone()).unwrap();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();
        let contents = fs::read_to_string(active_path(&config)).unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[test]
    fn rotation_renames_active_file_to_index_one() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            LogConfig { directory: dir.path().to_path_buf(), name: "test".into(), max_files: 3, max_bytes_per_file: 8 };
        let mut writer = RollingFileWriter::new(config.clone()).unwrap();
        writer.write_all(b"12345678").unwrap();
        writer.write_all(b"rotateme").unwrap();
        assert!(indexed_path(&config, 1).exists());
        assert!(active_path(&config).exists());
    }

    #[test]
    fn files_beyond_max_files_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            LogConfig { directory: dir.path().to_path_buf(), name: "test".into(), max_files: 2, max_bytes_per_file: 4 };
        let mut writer = RollingFileWriter::new(config.clone()).unwrap();
        for _ in 0..6 {
            writer.write_all(b"xxxx").unwrap();
        }
        let remaining = existing_index_files(&config);
        assert!(remaining.len() <= config.max_files);
    }
}
