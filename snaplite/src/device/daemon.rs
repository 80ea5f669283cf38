//! The COW daemon capability.
//!
//! The daemon runs out of process and serves dm-user block devices. The core
//! assumes at most one connection and serializes all calls over it.
//! [`SocketCowDaemon`] implements the daemon's line protocol over a Unix
//! socket: requests are comma-separated verbs terminated by a newline, and
//! every request yields exactly one response line.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::{SnapError, SnapResult};

/// Merge state of one snapshot as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonMergeState {
    /// Mapped as a read-only snapshot; no merge running.
    Snapshot,
    /// Merge in progress.
    SnapshotMerge,
    /// Merge finished.
    SnapshotMergeComplete,
    /// Merge hit an unrecoverable error.
    SnapshotMergeFailed,
}

impl DaemonMergeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonMergeState::Snapshot => "snapshot",
            DaemonMergeState::SnapshotMerge => "snapshot-merge",
            DaemonMergeState::SnapshotMergeComplete => "snapshot-merge-complete",
            DaemonMergeState::SnapshotMergeFailed => "snapshot-merge-failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "snapshot" => Some(DaemonMergeState::Snapshot),
            "snapshot-merge" => Some(DaemonMergeState::SnapshotMerge),
            "snapshot-merge-complete" => Some(DaemonMergeState::SnapshotMergeComplete),
            "snapshot-merge-failed" => Some(DaemonMergeState::SnapshotMergeFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DaemonMergeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC-style capability over the userspace COW daemon.
pub trait CowDaemon {
    /// Initialize a user-mode COW device. Returns the base device size in
    /// sectors; zero is never returned (it is an error).
    fn init_user_cow(
        &mut self,
        misc_name: &str,
        cow_device: &str,
        base_device: &str,
        base_merge: Option<&str>,
    ) -> SnapResult<u64>;

    /// Attach worker threads to an initialized device.
    fn attach(&mut self, misc_name: &str) -> SnapResult<()>;

    /// Start (or resume after reboot) the merge for one snapshot.
    fn initiate_merge(&mut self, name: &str) -> SnapResult<()>;

    fn pause_merge(&mut self) -> SnapResult<()>;
    fn resume_merge(&mut self) -> SnapResult<()>;

    fn query_snapshot_status(&mut self, name: &str) -> SnapResult<DaemonMergeState>;

    /// Overall merge completion, 0..=100.
    fn merge_percent(&mut self) -> SnapResult<f64>;

    /// Block until the daemon has released its reference to a device.
    fn wait_for_device_delete(&mut self, name: &str) -> SnapResult<()>;

    /// Detach all devices and shut the connection down.
    fn detach(&mut self) -> SnapResult<()>;

    /// Remove the marker the daemon leaves after handing off from
    /// first-stage to second-stage.
    fn remove_transitioned_daemon_indicator(&mut self) -> SnapResult<()>;
}

/// Connects [`CowDaemon`] instances on demand.
pub trait CowDaemonFactory {
    fn connect(&self, timeout: Duration) -> SnapResult<Box<dyn CowDaemon>>;
}

/// Line-protocol client over the daemon's Unix socket.
pub struct SocketCowDaemon {
    reader: BufReader<UnixStream>,
}

impl SocketCowDaemon {
    /// Connect, retrying until the socket exists or the timeout elapses. The
    /// daemon may still be starting when the core first needs it.
    pub fn connect(socket: &PathBuf, timeout: Duration) -> SnapResult<Self> {
        let start = Instant::now();
        loop {
            match UnixStream::connect(socket) {
                Ok(stream) => {
                    return Ok(Self {
                        reader: BufReader::new(stream),
                    })
                }
                Err(err) => {
                    if start.elapsed() >= timeout {
                        return Err(SnapError::Daemon(format!(
                            "unable to connect to daemon at {}: {err}",
                            socket.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn request(&mut self, parts: &[&str]) -> SnapResult<String> {
        let msg = parts.join(",");
        self.reader
            .get_mut()
            .write_all(format!("{msg}\n").as_bytes())
            .map_err(|err| SnapError::Daemon(format!("send {msg:?}: {err}")))?;

        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|err| SnapError::Daemon(format!("receive for {msg:?}: {err}")))?;
        Ok(line.trim_end().to_string())
    }

    fn expect_success(&mut self, parts: &[&str]) -> SnapResult<()> {
        let response = self.request(parts)?;
        if response == "success" {
            Ok(())
        } else {
            Err(SnapError::Daemon(format!(
                "request {:?} failed: {response}",
                parts.join(",")
            )))
        }
    }
}

impl CowDaemon for SocketCowDaemon {
    fn init_user_cow(
        &mut self,
        misc_name: &str,
        cow_device: &str,
        base_device: &str,
        base_merge: Option<&str>,
    ) -> SnapResult<u64> {
        let mut parts = vec!["init", misc_name, cow_device, base_device];
        if let Some(merge) = base_merge {
            parts.push(merge);
        }
        let response = self.request(&parts)?;
        let sectors: u64 = response.parse().map_err(|_| {
            SnapError::Daemon(format!("init {misc_name}: bad sector count {response:?}"))
        })?;
        if sectors == 0 {
            return Err(SnapError::Daemon(format!(
                "init {misc_name}: daemon reported zero base sectors"
            )));
        }
        Ok(sectors)
    }

    fn attach(&mut self, misc_name: &str) -> SnapResult<()> {
        self.expect_success(&["start", misc_name])
    }

    fn initiate_merge(&mut self, name: &str) -> SnapResult<()> {
        self.expect_success(&["initiate_merge", name])
    }

    fn pause_merge(&mut self) -> SnapResult<()> {
        self.expect_success(&["pause_merge"])
    }

    fn resume_merge(&mut self) -> SnapResult<()> {
        self.expect_success(&["resume_merge"])
    }

    fn query_snapshot_status(&mut self, name: &str) -> SnapResult<DaemonMergeState> {
        let response = self.request(&["getstatus", name])?;
        DaemonMergeState::parse(&response).ok_or_else(|| {
            SnapError::Daemon(format!("unknown merge state for {name}: {response:?}"))
        })
    }

    fn merge_percent(&mut self) -> SnapResult<f64> {
        let response = self.request(&["merge_percent"])?;
        response
            .parse()
            .map_err(|_| SnapError::Daemon(format!("bad merge percent: {response:?}")))
    }

    fn wait_for_device_delete(&mut self, name: &str) -> SnapResult<()> {
        self.expect_success(&["delete", name])
    }

    fn detach(&mut self) -> SnapResult<()> {
        // Fire and forget: the daemon exits without replying.
        let msg = "detach\n";
        self.reader
            .get_mut()
            .write_all(msg.as_bytes())
            .map_err(|err| SnapError::Daemon(format!("detach: {err}")))
    }

    fn remove_transitioned_daemon_indicator(&mut self) -> SnapResult<()> {
        self.expect_success(&["clear_transitioned"])
    }
}

/// Factory producing [`SocketCowDaemon`] connections to a fixed socket path.
pub struct SocketDaemonFactory {
    socket: PathBuf,
}

impl SocketDaemonFactory {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

impl CowDaemonFactory for SocketDaemonFactory {
    fn connect(&self, timeout: Duration) -> SnapResult<Box<dyn CowDaemon>> {
        Ok(Box::new(SocketCowDaemon::connect(&self.socket, timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_state_round_trip() {
        for state in [
            DaemonMergeState::Snapshot,
            DaemonMergeState::SnapshotMerge,
            DaemonMergeState::SnapshotMergeComplete,
            DaemonMergeState::SnapshotMergeFailed,
        ] {
            assert_eq!(DaemonMergeState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DaemonMergeState::parse("snapshot-merge-unknown"), None);
    }
}
