//! Flat-file persistence of the active ban set.
//!
//! One entry per line: the address, optionally followed by whitespace and the
//! RFC 3339 expiry. Bare addresses are accepted so files written by older
//! versions still load. The file is always rewritten in full through a
//! temporary sibling that is renamed over the target once the write succeeded.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::BanEntry;

/// A ban as read back from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedBan {
    pub ip: IpAddr,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PersistedBan {
    /// Parse one blacklist line; blank lines and comments yield `None`
    pub fn parse_line(line: &str) -> Option<std::result::Result<Self, String>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut fields = line.split_whitespace();
        let ip = match fields.next()?.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(e) => return Some(Err(format!("invalid address: {}", e))),
        };
        let expires_at = match fields.next() {
            Some(ts) => match DateTime::parse_from_rfc3339(ts) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(e) => return Some(Err(format!("invalid expiry {:?}: {}", ts, e))),
            },
            None => None,
        };

        Some(Ok(Self { ip, expires_at }))
    }

    /// Expiry this entry gets when restored at `now`.
    ///
    /// With `renew` every entry gets `now + duration`. Otherwise the stored
    /// expiry is kept, entries without one get a full duration, and entries
    /// that already lapsed return `None`.
    pub fn resolve(&self, now: DateTime<Utc>, duration: Duration, renew: bool) -> Option<BanEntry> {
        let expires_at = match (renew, self.expires_at) {
            (false, Some(at)) if at <= now => return None,
            (false, Some(at)) => at,
            _ => now + duration,
        };
        Some(BanEntry::new(self.ip, expires_at))
    }
}

/// Blacklist file handle
#[derive(Debug, Clone)]
pub struct Blacklist {
    path: PathBuf,
}

impl Blacklist {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "blacklist".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> Error {
        Error::Blacklist {
            path: self.path.clone(),
            source,
        }
    }

    /// Read all entries. A missing file is an empty blacklist.
    pub fn load(&self) -> Result<Vec<PersistedBan>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Blacklist {} does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let mut entries = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_error(e))?;
            match PersistedBan::parse_line(&line) {
                Some(Ok(entry)) => entries.push(entry),
                Some(Err(reason)) => warn!(
                    "Skipping line {} of {}: {}",
                    lineno + 1,
                    self.path.display(),
                    reason
                ),
                None => {}
            }
        }

        debug!("Loaded {} entries from {}", entries.len(), self.path.display());
        Ok(entries)
    }

    /// Replace the file contents with `entries`
    pub fn save(&self, entries: &[BanEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let tmp = self.temp_path();
        if let Err(e) = write_entries(&tmp, entries) {
            let _ = fs::remove_file(&tmp);
            return Err(self.io_error(e));
        }
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            self.io_error(e)
        })?;

        debug!("Wrote {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

fn write_entries(path: &Path, entries: &[BanEntry]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for entry in entries {
        writeln!(
            writer,
            "{} {}",
            entry.ip,
            entry.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}
