//! OS-level identity of peer processes.
//!
//! Everything here reads `/proc` live: privilege is re-derived on every
//! query so a process dropping its uid/gid is observed immediately.

use std::{
    fmt,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use nix::unistd::{Group, User};
use tracing::warn;

/// Name of the user and group whose members may call privileged methods.
const PRIVILEGED_NAME: &str = "privileged";

/// Longest cmdline we keep for logging.
const CMDLINE_MAX: usize = 256;

/// Outcome of a privilege query for a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    Yes,
    No,
    /// The peer's process id has not been resolved (yet).
    Unknown,
}

impl Privilege {
    /// The classic numeric rendering used in identity strings.
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Yes => 1,
            Self::No => 0,
            Self::Unknown => -1,
        }
    }
}

/// The uid/gid allowed past the privilege gate besides root.
///
/// Resolved once at startup; when the `privileged` user or group does not
/// exist the respective id stays 0, which collapses to root-only semantics.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrivilegedIds {
    pub uid: u32,
    pub gid: u32,
}

impl PrivilegedIds {
    pub fn resolve() -> Self {
        let uid = match User::from_name(PRIVILEGED_NAME) {
            Ok(Some(user)) => user.uid.as_raw(),
            Ok(None) | Err(_) => {
                warn!("no `{}` user, privileged calls are root-only", PRIVILEGED_NAME);
                0
            }
        };
        let gid = match Group::from_name(PRIVILEGED_NAME) {
            Ok(Some(group)) => group.gid.as_raw(),
            Ok(None) | Err(_) => 0,
        };
        Self { uid, gid }
    }

    pub fn with(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// Effective uid/gid of a process, from the ownership of its `/proc` entry.
pub fn process_uid_gid(pid: u32) -> Option<(u32, u32)> {
    let meta = std::fs::metadata(format!("/proc/{pid}")).ok()?;
    Some((meta.uid(), meta.gid()))
}

/// The executable behind a pid, if it can still be resolved.
pub fn process_exe(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/exe")).ok()
}

/// Printable command line of a process: NUL separators and control bytes
/// become spaces, the result is capped for log hygiene.
pub fn process_cmdline(pid: u32) -> Option<String> {
    let mut bytes = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if bytes.is_empty() {
        return None;
    }
    bytes.truncate(CMDLINE_MAX);
    let printable: String = bytes
        .iter()
        .map(|&b| if b < 0x20 { ' ' } else { b as char })
        .collect();
    Some(printable.trim_end().to_string())
}

/// Classify a (possibly unknown) pid against the configured privileged ids.
pub fn classify(pid: Option<u32>, ids: &PrivilegedIds) -> Privilege {
    let Some(pid) = pid else {
        return Privilege::Unknown;
    };
    match process_uid_gid(pid) {
        Some((uid, gid)) => classify_ids(uid, gid, ids),
        // Process already gone; its owner will drop off the bus shortly.
        None => Privilege::Unknown,
    }
}

pub fn classify_ids(uid: u32, gid: u32, ids: &PrivilegedIds) -> Privilege {
    if uid == 0 || uid == ids.uid || gid == ids.gid {
        Privilege::Yes
    } else {
        Privilege::No
    }
}

/// Whether the pid's executable is the given sandbox proxy relay.
pub fn is_sandbox_proxy(pid: u32, proxy_binary: &Path) -> bool {
    process_exe(pid).is_some_and(|exe| exe == proxy_binary)
}

/// The canonical one-line identity rendering used in logs and debug output.
pub struct IdentityLine<'a> {
    pub name: &'a str,
    pub owner: Option<&'a str>,
    pub pid: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub privilege: Privilege,
    pub cmdline: Option<&'a str>,
}

impl fmt::Display for IdentityLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name={} owner={}", self.name, self.owner.unwrap_or("NULL"))?;
        match self.pid {
            Some(pid) => write!(f, " pid={pid}")?,
            None => write!(f, " pid=-1")?,
        }
        match self.uid {
            Some(uid) => write!(f, " uid={uid}")?,
            None => write!(f, " uid=-1")?,
        }
        match self.gid {
            Some(gid) => write!(f, " gid={gid}")?,
            None => write!(f, " gid=-1")?,
        }
        write!(f, " priv={}", self.privilege.as_i8())?;
        write!(f, " cmd={}", self.cmdline.unwrap_or(""))
    }
}
