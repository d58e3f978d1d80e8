//! On-disk node state: a log of seen message ids and the node's
//! subscription list.
//!
//! The seen log is appended to as messages arrive and rewritten from the
//! in-memory store once it holds twice the store's capacity, so its size
//! tracks the store rather than the node's lifetime.
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::node::messages::MsgId;

pub const SEEN_LOG_FILE: &str = "seen_msgs.log";
pub const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";

const HORIZON_PREFIX: &str = "horizon ";

/// What the seen log holds: the eviction horizon and the retained ids,
/// oldest first
#[derive(Clone, Debug, PartialEq)]
pub struct SeenSnapshot {
    pub horizon: f64,
    pub entries: Vec<(MsgId, Option<f64>)>,
}

struct LogFile {
    file: File,
    lines: usize,
}

/// One `<hex id> <origin timestamp>` per line. A bare `<hex id>` line is
/// accepted on load. A `horizon <timestamp>` line raises the horizon.
pub struct SeenLog {
    path: PathBuf,
    capacity: usize,
    log: Mutex<LogFile>,
}

impl SeenLog {
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let lines = BufReader::new(file.try_clone()?).lines().count();
        Ok(Self {
            path,
            capacity: capacity.max(1),
            log: Mutex::new(LogFile { file, lines }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, msg_id: &MsgId, timestamp: f64) -> Result<()> {
        let mut log = self.log.lock();
        writeln!(log.file, "{} {}", msg_id, timestamp)?;
        log.lines += 1;
        Ok(())
    }

    /// True once the log holds more than twice the store capacity
    pub fn needs_compaction(&self) -> bool {
        self.log.lock().lines > self.capacity * 2
    }

    /// Rewrite the log from `snapshot`, which is taken while the log is
    /// locked so no append lands between the snapshot and the rewrite.
    /// Written to a temp file and renamed.
    pub fn compact<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> SeenSnapshot,
    {
        let mut log = self.log.lock();
        let SeenSnapshot { horizon, entries } = snapshot();

        let tmp = self.path.with_extension("log.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        let mut lines = 0;
        if horizon.is_finite() {
            writeln!(writer, "{}{}", HORIZON_PREFIX, horizon)?;
            lines += 1;
        }
        for (msg_id, timestamp) in &entries {
            match timestamp {
                Some(t) => writeln!(writer, "{} {}", msg_id, t)?,
                None => writeln!(writer, "{}", msg_id)?,
            }
            lines += 1;
        }
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        debug!(
            "Compacted {} from {} to {} lines",
            self.path.display(),
            log.lines,
            lines
        );
        *log = LogFile { file, lines };
        Ok(())
    }

    /// The most recent `limit` ids in the log, oldest first. Ids pushed out
    /// by the limit raise the horizon as eviction would. Malformed lines
    /// are skipped.
    pub fn load(&self, limit: usize) -> Result<SeenSnapshot> {
        let mut snapshot = SeenSnapshot {
            horizon: f64::NEG_INFINITY,
            entries: Vec::new(),
        };
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshot),
            Err(e) => return Err(e.into()),
        };

        let mut entries = VecDeque::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(Line::Horizon(h)) => snapshot.horizon = snapshot.horizon.max(h),
                Ok(Line::Seen(id, timestamp)) => {
                    entries.push_back((id, timestamp));
                    if entries.len() > limit {
                        if let Some((_, Some(t))) = entries.pop_front() {
                            snapshot.horizon = snapshot.horizon.max(t);
                        }
                    }
                }
                Err(e) => warn!("{}:{}: {}", self.path.display(), lineno + 1, e),
            }
        }
        snapshot.entries = entries.into();
        Ok(snapshot)
    }
}

enum Line {
    Horizon(f64),
    Seen(MsgId, Option<f64>),
}

fn parse_line(line: &str) -> std::result::Result<Line, String> {
    if let Some(rest) = line.strip_prefix(HORIZON_PREFIX) {
        return rest
            .trim()
            .parse()
            .map(Line::Horizon)
            .map_err(|e| format!("bad horizon {:?}: {}", rest, e));
    }
    let mut fields = line.split_whitespace();
    let id: MsgId = fields.next().unwrap_or_default().parse()?;
    let timestamp = match fields.next() {
        Some(t) => Some(
            t.parse::<f64>()
                .map_err(|e| format!("bad timestamp {:?}: {}", t, e))?,
        ),
        None => None,
    };
    Ok(Line::Seen(id, timestamp))
}

/// JSON array of topic names
pub struct SubscriptionFile {
    path: PathBuf,
}

impl SubscriptionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the file contents; written to a temp file and renamed so a
    /// crash never leaves a partial list
    pub fn save(&self, topics: &[String]) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(topics)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Saved {} subscriptions to {}", topics.len(), self.path.display());
        Ok(())
    }
}

pub struct NodeStorage {
    pub seen_log: SeenLog,
    pub subscriptions: SubscriptionFile,
}

impl NodeStorage {
    pub fn open(data_dir: &Path, seen_capacity: usize) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            seen_log: SeenLog::open(data_dir.join(SEEN_LOG_FILE), seen_capacity)?,
            subscriptions: SubscriptionFile::new(data_dir.join(SUBSCRIPTIONS_FILE)),
        })
    }
}
