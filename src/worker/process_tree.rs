use std::collections::{HashMap, VecDeque};
use std::fs;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{GridError, Result};

/// Terminates a process together with all of its descendants.
pub trait ProcessTreeKiller: Send + Sync {
    /// Signal `pid` and every descendant. Returns how many processes were
    /// signalled; a root that is already gone is not an error.
    fn kill_tree(&self, pid: u32, signal: Signal) -> Result<usize>;
}

/// Walks `/proc` to find descendants.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsTreeKiller;

impl ProcfsTreeKiller {
    /// Parent pid from the contents of `/proc/<pid>/stat`. The command name
    /// is parenthesized and may itself contain spaces or parentheses.
    pub fn parse_ppid(stat: &str) -> Option<u32> {
        let after_comm = &stat[stat.rfind(')')? + 1..];
        let mut fields = after_comm.split_whitespace();
        let _state = fields.next()?;
        fields.next()?.parse().ok()
    }

    fn children_map() -> Result<HashMap<u32, Vec<u32>>> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes may exit while we scan
            let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(ppid) = Self::parse_ppid(&stat) {
                children.entry(ppid).or_default().push(pid);
            }
        }
        Ok(children)
    }

    /// `root` followed by its descendants, breadth first
    pub fn collect_tree(root: u32) -> Result<Vec<u32>> {
        let children = Self::children_map()?;
        let mut tree = vec![root];
        let mut pending = VecDeque::from([root]);
        while let Some(pid) = pending.pop_front() {
            for child in children.get(&pid).into_iter().flatten() {
                if !tree.contains(child) {
                    tree.push(*child);
                    pending.push_back(*child);
                }
            }
        }
        Ok(tree)
    }
}

impl ProcessTreeKiller for ProcfsTreeKiller {
    fn kill_tree(&self, pid: u32, signal: Signal) -> Result<usize> {
        let tree = Self::collect_tree(pid)?;
        let mut signalled = 0;
        for target in tree {
            let raw = i32::try_from(target)
                .map_err(|_| GridError::Internal(format!("pid {} out of range", target)))?;
            match kill(Pid::from_raw(raw), signal) {
                Ok(()) => signalled += 1,
                Err(Errno::ESRCH) => {}
                Err(e) => {
                    tracing::warn!(pid = target, error = %e, "Failed to signal process");
                }
            }
        }
        tracing::info!(root_pid = pid, signalled, signal = %signal, "Process tree signalled");
        Ok(signalled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ppid_plain() {
        let stat = "1234 (sleep) S 1200 1234 1200 0 -1 4194304";
        assert_eq!(ProcfsTreeKiller::parse_ppid(stat), Some(1200));
    }

    #[test]
    fn parse_ppid_with_awkward_comm() {
        let stat = "77 (my (odd) prog) R 5 77 5 0";
        assert_eq!(ProcfsTreeKiller::parse_ppid(stat), Some(5));
    }

    #[test]
    fn parse_ppid_garbage() {
        assert_eq!(ProcfsTreeKiller::parse_ppid("nonsense"), None);
    }
}
