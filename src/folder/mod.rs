pub mod imap;
pub mod maildir;
pub mod status;

use crate::error::SyncResult;
use crate::flags::FlagSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub use self::status::StatusFolder;

/// The narrow contract the sync engine needs from a mailbox, whatever its
/// backing store. UIDs are signed: positive values are canonical identifiers
/// from the authoritative side, negative values are scan-local placeholders
/// for messages with no server UID yet, and 0 marks a message that was
/// written but whose assigned UID could not be learned.
pub trait Folder {
    fn name(&self) -> &str;

    fn visible_name(&self) -> &str {
        self.name()
    }

    /// False for stores that only track metadata; spares the engine a body
    /// fetch when copying toward one.
    fn stores_messages(&self) -> bool {
        true
    }

    /// Pool name bounding concurrent message copies out of this folder, for
    /// backends where each copy costs a network round trip.
    fn copy_instance(&self) -> Option<String> {
        None
    }

    fn uid_validity(&mut self) -> SyncResult<u32>;
    fn saved_uid_validity(&mut self) -> SyncResult<Option<u32>>;
    fn save_uid_validity(&mut self) -> SyncResult<()>;

    fn is_uid_validity_ok(&mut self) -> SyncResult<bool> {
        match self.saved_uid_validity()? {
            Some(saved) => Ok(saved == self.uid_validity()?),
            None => {
                self.save_uid_validity()?;
                Ok(true)
            }
        }
    }

    /// Load the message list. Memoized; call once per sync cycle.
    fn cache_message_list(&mut self) -> SyncResult<()>;

    fn uids(&self) -> Vec<i64>;
    fn uid_exists(&self, uid: i64) -> bool;
    fn message_count(&self) -> usize;
    fn message_flags(&self, uid: i64) -> Option<FlagSet>;

    /// Receive time in unix seconds, if the store knows one.
    fn message_time(&self, uid: i64) -> Option<i64>;

    fn message(&mut self, uid: i64) -> SyncResult<Vec<u8>>;

    /// Write a message. Returns the UID the store filed it under: the one
    /// passed in, a freshly assigned one, the negative input unchanged when
    /// the store cannot mint UIDs, or 0 when it saved but cannot say where.
    fn save_message(
        &mut self,
        uid: i64,
        body: Option<&[u8]>,
        flags: &FlagSet,
        rtime: Option<i64>,
    ) -> SyncResult<i64>;

    fn save_message_flags(&mut self, uid: i64, flags: &FlagSet) -> SyncResult<()>;

    fn add_messages_flags(&mut self, uids: &[i64], flags: &FlagSet) -> SyncResult<()> {
        for &uid in uids {
            if let Some(current) = self.message_flags(uid) {
                self.save_message_flags(uid, &current.union(*flags))?;
            }
        }
        Ok(())
    }

    fn delete_messages_flags(&mut self, uids: &[i64], flags: &FlagSet) -> SyncResult<()> {
        for &uid in uids {
            if let Some(current) = self.message_flags(uid) {
                self.save_message_flags(uid, &current.subtract(*flags))?;
            }
        }
        Ok(())
    }

    fn delete_message(&mut self, uid: i64) -> SyncResult<()>;

    fn delete_messages(&mut self, uids: &[i64]) -> SyncResult<()> {
        for &uid in uids {
            self.delete_message(uid)?;
        }
        Ok(())
    }

    /// Cheap change probe against the status snapshot, used to skip quiet
    /// folders on quick cycles.
    fn quick_changed(&mut self, status: &StatusFolder) -> SyncResult<bool>;
}

/// File name a folder's metadata (UID validity, status cache) is stored
/// under: the repository separator becomes `.`, and a bare or trailing dot
/// component is spelled out so it cannot vanish as a hidden path.
pub fn folder_basename(name: &str, sep: char) -> String {
    let escaped = name.replace(sep, ".");
    if escaped == "." {
        return "dot".to_string();
    }
    match escaped.strip_suffix("/.") {
        Some(head) => format!("{}/dot", head),
        None => escaped,
    }
}

/// The per-folder UID-validity value persisted under a repository's
/// validity directory. Reads are cached; writes go through a `.tmp` rename
/// so a crash cannot leave a torn value.
pub struct ValidityFile {
    path: PathBuf,
    cached: Option<Option<u32>>,
}

impl ValidityFile {
    pub fn new(dir: &Path, folder_name: &str, sep: char) -> ValidityFile {
        ValidityFile {
            path: dir.join(folder_basename(folder_name, sep)),
            cached: None,
        }
    }

    pub fn saved(&mut self) -> SyncResult<Option<u32>> {
        if let Some(cached) = self.cached {
            return Ok(cached);
        }
        let value = match fs::read_to_string(&self.path) {
            Ok(text) => text.trim().parse::<u32>().ok(),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        self.cached = Some(value);
        Ok(value)
    }

    pub fn save(&mut self, value: u32) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut f = fs::File::create(&tmp)?;
        writeln!(f, "{}", value)?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        self.cached = Some(Some(value));
        Ok(())
    }
}
