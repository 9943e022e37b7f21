//! Per-user log of generation calls.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};

pub const UNKNOWN_USER: &str = "Unknown";

/// Appends one line per call to `<dir>/<username>_activity.log`.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    dir: PathBuf,
}

impl ActivityLog {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, username: Option<&str>) -> PathBuf {
        self.dir
            .join(format!("{}_activity.log", sanitize_username(username)))
    }

    /// `outcome` is `Err(message)` for a failed call.
    pub fn record(
        &self,
        username: Option<&str>,
        prompt: &str,
        outcome: Result<(), &str>,
    ) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(username))?;
        file.write_all(format_entry(prompt, outcome).as_bytes())
    }
}

fn format_entry(prompt: &str, outcome: Result<(), &str>) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    // One entry per line.
    let prompt = prompt.replace(['\n', '\r'], " ");
    let (success, error) = match outcome {
        Ok(()) => (true, "N/A".to_string()),
        Err(msg) => (false, msg.replace(['\n', '\r'], " ")),
    };
    format!("{timestamp} - Prompt: {prompt} - Success: {success} - Error: {error}\n")
}

fn sanitize_username(username: Option<&str>) -> String {
    let name: String = username
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if name.is_empty() {
        UNKNOWN_USER.to_string()
    } else {
        name
    }
}
