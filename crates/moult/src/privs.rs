//! Dropping root privileges to a named user.

use std::sync::{Arc, Mutex};

use nix::unistd::{setgid, setuid, User};
use tracing::info;

use crate::error::Result;
use crate::flags::{FlagEntry, FlagSet, FlagValue};
use crate::log::fatal;

/// The privileges flag: a username to drop to after binding listeners.
///
/// An empty username means no drop. A requested drop that fails aborts the
/// process: continuing to run with unintended privileges is never safe.
pub struct PrivFlag {
    username: Mutex<String>,
}

impl PrivFlag {
    /// The configured username.
    pub fn username(&self) -> String {
        self.username.lock().unwrap().clone()
    }

    /// Drop to the configured user (setgid before setuid) and report
    /// whether any dropping happened.
    pub fn drop_privileges(&self) -> bool {
        let username = self.username();
        if username.is_empty() {
            return false;
        }
        let user = match User::from_name(&username) {
            Ok(Some(user)) => user,
            Ok(None) => fatal!(user = %username, "no such user"),
            Err(e) => fatal!(user = %username, error = %e, "failed to look up user"),
        };
        if let Err(e) = setgid(user.gid) {
            fatal!(gid = %user.gid, error = %e, "setgid failed");
        }
        if let Err(e) = setuid(user.uid) {
            fatal!(uid = %user.uid, error = %e, "setuid failed");
        }
        info!(user = %username, uid = %user.uid, gid = %user.gid, "dropped privileges");
        true
    }
}

impl FlagValue for PrivFlag {
    fn set(&self, _flag: &str, raw: &str) -> Result<()> {
        *self.username.lock().unwrap() = raw.to_string();
        Ok(())
    }

    fn get(&self) -> String {
        self.username()
    }
}

impl FlagSet {
    /// Register the privileges flag. A common default is `"nobody"`; an
    /// empty default leaves privileges untouched unless the operator asks.
    pub fn privileges(&mut self, name: &str, default_user: &str) -> Arc<PrivFlag> {
        let flag = Arc::new(PrivFlag {
            username: Mutex::new(default_user.to_string()),
        });
        self.register(FlagEntry::plain(
            name,
            "User to whom to drop privileges (if set)",
            flag.clone(),
        ));
        flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_username_means_no_drop() {
        let mut flags = FlagSet::new("test");
        let privs = flags.privileges("user", "");
        assert!(!privs.drop_privileges());
    }

    #[test]
    fn flag_overrides_default() {
        let mut flags = FlagSet::new("test");
        let privs = flags.privileges("user", "nobody");
        flags
            .parse_from(vec!["--user=daemon".to_string()])
            .unwrap();
        assert_eq!(privs.username(), "daemon");
    }
}
