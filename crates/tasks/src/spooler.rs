//! Local disk spooler.
//!
//! Spooled work is written as one JSON file per unit under
//! `<dir>/<level>/`, level 1 being the highest priority. Files are named
//! `<timestamp>-<sequence>-<uuid>.json` so a directory listing sorts oldest first.
//! Several processes on one host may share a spool directory: a file is
//! claimed by renaming it, and only the process whose rename succeeds
//! runs it. Claims left behind by a crashed process are put back when a
//! spooler opens the directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SpoolSection;
use crate::engine::Engine;
use crate::error::SpoolError;
use crate::priority::QueueTier;
use crate::shutdown::Shutdown;
use crate::task::{MessageReceipt, Session};

const LEVELS: [u8; 3] = [1, 2, 3];
const RECORD_EXT: &str = "json";
const CLAIMED_EXT: &str = "running";
const TEMP_EXT: &str = "tmp";

/// Claims and partial writes older than this belong to a dead process.
pub const STALE_AFTER: Duration = Duration::from_secs(3600);

/// Orders files enqueued by this process within one clock tick.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One spooled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub fn_name: String,
    pub level: u8,
    pub body: SpoolBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolBody {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub task: Session,
    /// Run through the standard execution wrapper.
    pub wrapped: bool,
    /// Queue message to delete once the work is done.
    pub message: Option<MessageReceipt>,
}

/// Pending spool files per tier, each counting its own level and every
/// higher-priority level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    levels: [usize; 3],
}

impl Backlog {
    pub fn get(&self, tier: QueueTier) -> usize {
        let level = tier.spool_level() as usize;
        self.levels[..level].iter().sum()
    }

    pub fn total(&self) -> usize {
        self.levels.iter().sum()
    }
}

#[derive(Clone)]
pub struct Spooler {
    root: PathBuf,
    sleep_after: Duration,
    scan_interval: Duration,
    notify: Arc<Notify>,
}

impl Spooler {
    /// Open (creating if needed) the spool directory.
    pub fn open(dir: impl Into<PathBuf>, settings: &SpoolSection) -> Result<Self, SpoolError> {
        let root = dir.into();
        for level in LEVELS {
            std::fs::create_dir_all(root.join(level.to_string()))?;
        }
        let spooler = Self {
            root,
            sleep_after: settings.sleep_after(),
            scan_interval: settings.scan_interval(),
            notify: Arc::new(Notify::new()),
        };
        let recovered = spooler.recover_stale(STALE_AFTER)?;
        info!(path = %spooler.root.display(), recovered, "spooler initialized");
        Ok(spooler)
    }

    /// Return claimed files untouched for `older_than` to the pending set
    /// and delete abandoned partial writes. Returns how many claims came
    /// back. The records may run a second time.
    pub fn recover_stale(&self, older_than: Duration) -> Result<usize, SpoolError> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut recovered = 0;
        for level in LEVELS {
            for entry in std::fs::read_dir(self.level_dir(level))? {
                let path = entry?.path();
                let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                    continue;
                };
                if ext != CLAIMED_EXT && ext != TEMP_EXT {
                    continue;
                }
                let modified = std::fs::metadata(&path)?.modified()?;
                if modified > cutoff {
                    continue;
                }
                if ext == CLAIMED_EXT {
                    match std::fs::rename(&path, path.with_extension(RECORD_EXT)) {
                        Ok(()) => {
                            warn!(path = %path.display(), "recovered abandoned spool claim");
                            recovered += 1;
                        }
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                } else if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(recovered)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn level_dir(&self, level: u8) -> PathBuf {
        self.root.join(level.clamp(1, 3).to_string())
    }

    /// Write a record atomically and wake the drain loop.
    pub async fn enqueue(&self, record: &SpoolRecord) -> Result<PathBuf, SpoolError> {
        let dir = self.level_dir(record.level);
        let name = format!(
            "{}-{:010}-{}",
            Utc::now().format("%Y%m%d%H%M%S%6f"),
            SEQUENCE.fetch_add(1, Ordering::Relaxed),
            Uuid::new_v4().simple()
        );
        let tmp = dir.join(format!(".{name}.{TEMP_EXT}"));
        let path = dir.join(format!("{name}.{RECORD_EXT}"));

        tokio::fs::write(&tmp, serde_json::to_vec(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(function = %record.fn_name, level = record.level, path = %path.display(), "spooled");
        self.notify.notify_one();
        Ok(path)
    }

    /// Count pending files per level. Another process may change the
    /// directories while they are being counted.
    pub async fn backlog(&self) -> Result<Backlog, SpoolError> {
        let mut backlog = Backlog::default();
        for (slot, level) in LEVELS.into_iter().enumerate() {
            backlog.levels[slot] = self.list_level(level).await?.len();
        }
        Ok(backlog)
    }

    /// Pending files, highest level first, oldest first within a level.
    pub async fn pending(&self) -> Result<Vec<PathBuf>, SpoolError> {
        let mut all = Vec::new();
        for level in LEVELS {
            all.extend(self.list_level(level).await?);
        }
        Ok(all)
    }

    async fn list_level(&self, level: u8) -> Result<Vec<PathBuf>, SpoolError> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(self.level_dir(level)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Take ownership of a pending file. `None` if another process got it.
    async fn claim(&self, path: &Path) -> Result<Option<PathBuf>, SpoolError> {
        let claimed = path.with_extension(CLAIMED_EXT);
        match tokio::fs::rename(path, &claimed).await {
            Ok(()) => Ok(Some(claimed)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Run every pending record once. Returns how many ran.
    pub async fn drain_once(&self, engine: &Engine) -> Result<usize, SpoolError> {
        let mut ran = 0;
        for path in self.pending().await? {
            let Some(claimed) = self.claim(&path).await? else {
                continue;
            };

            let record = tokio::fs::read(&claimed)
                .await
                .map_err(SpoolError::from)
                .and_then(|data| Ok(serde_json::from_slice::<SpoolRecord>(&data)?));
            match record {
                Ok(record) => {
                    let function = record.fn_name.clone();
                    let outcome = engine.run_record(record).await;
                    debug!(%function, ?outcome, "spooled task finished");
                    ran += 1;
                }
                Err(e) => warn!(path = %claimed.display(), error = %e, "skipping corrupt spool file"),
            }

            if let Err(e) = tokio::fs::remove_file(&claimed).await {
                warn!(path = %claimed.display(), error = %e, "failed to remove spool file");
            }
            if !self.sleep_after.is_zero() {
                tokio::time::sleep(self.sleep_after).await;
            }
        }
        Ok(ran)
    }

    /// Wait for an enqueue in this process, or the scan interval.
    async fn idle(&self) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(self.scan_interval) => {}
        }
    }
}

/// Drain the engine's spooler until shutdown.
pub async fn run_spooler(engine: Engine, shutdown: Shutdown) {
    let Some(spooler) = engine.spooler().cloned() else {
        warn!("engine has no spooler, spool loop not started");
        return;
    };
    info!(path = %spooler.root().display(), "spooler started");

    while !shutdown.is_shutdown() {
        match spooler.drain_once(&engine).await {
            Ok(0) => {}
            Ok(ran) => {
                debug!(ran, "spool drained");
                continue;
            }
            Err(e) => error!(error = %e, "spool drain failed"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = spooler.idle() => {}
        }
    }
    info!("spooler stopped");
}

impl std::fmt::Debug for Spooler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spooler").field("root", &self.root).finish()
    }
}
