use crate::error::SyncResult;
use crate::flags::FlagSet;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The witness store: one flat file per folder holding `uid flags` lines,
/// the snapshot of what the last successful sync left on both sides. Only
/// canonical UIDs (> 0) are ever recorded.
pub struct StatusFolder {
    path: PathBuf,
    messages: Option<HashMap<i64, FlagSet>>,
    dirty: bool,
}

impl StatusFolder {
    pub fn new(root: &Path, name: &str, sep: char) -> StatusFolder {
        StatusFolder {
            path: root.join(super::folder_basename(name, sep)),
            messages: None,
            dirty: false,
        }
    }

    pub fn cache_message_list(&mut self) -> SyncResult<()> {
        if self.messages.is_some() {
            return Ok(());
        }
        let mut messages = HashMap::new();
        match fs::read_to_string(&self.path) {
            Ok(text) => {
                for line in text.lines() {
                    let mut parts = line.split_whitespace();
                    let uid = match parts.next().and_then(|t| t.parse::<i64>().ok()) {
                        Some(uid) if uid > 0 => uid,
                        _ => continue,
                    };
                    let flags = FlagSet::from(parts.next().unwrap_or(""));
                    messages.insert(uid, flags);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(e.into()),
        }
        self.messages = Some(messages);
        Ok(())
    }

    fn list(&self) -> &HashMap<i64, FlagSet> {
        self.messages
            .as_ref()
            .expect("status message list not cached")
    }

    pub fn uids(&self) -> Vec<i64> {
        self.list().keys().cloned().collect()
    }

    pub fn uid_exists(&self, uid: i64) -> bool {
        self.list().contains_key(&uid)
    }

    pub fn message_count(&self) -> usize {
        self.list().len()
    }

    pub fn message_flags(&self, uid: i64) -> Option<FlagSet> {
        self.list().get(&uid).cloned()
    }

    /// Record a message as synced. Placeholder and unknown UIDs are never
    /// identity keys here.
    pub fn save_message(&mut self, uid: i64, flags: &FlagSet) {
        if uid <= 0 {
            return;
        }
        self.messages
            .as_mut()
            .expect("status message list not cached")
            .insert(uid, *flags);
        self.dirty = true;
    }

    pub fn add_messages_flags(&mut self, uids: &[i64], flags: &FlagSet) {
        for uid in uids {
            if let Some(current) = self.list().get(uid).cloned() {
                self.save_message(*uid, &current.union(*flags));
            }
        }
    }

    pub fn delete_messages_flags(&mut self, uids: &[i64], flags: &FlagSet) {
        for uid in uids {
            if let Some(current) = self.list().get(uid).cloned() {
                self.save_message(*uid, &current.subtract(*flags));
            }
        }
    }

    /// Forget messages and persist immediately: pass 2 relies on the status
    /// deletion hitting disk before the destination's.
    pub fn delete_messages(&mut self, uids: &[i64]) -> SyncResult<()> {
        let list = self
            .messages
            .as_mut()
            .expect("status message list not cached");
        for uid in uids {
            if list.remove(uid).is_some() {
                self.dirty = true;
            }
        }
        self.save()
    }

    /// Commit the in-memory state atomically.
    pub fn save(&mut self) -> SyncResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let list = self.list();
        let mut uids: Vec<&i64> = list.keys().collect();
        uids.sort();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            for uid in uids {
                writeln!(f, "{} {}", uid, list[uid])?;
            }
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }

    /// Drop the on-disk cache entirely, for folders whose local side turned
    /// out to be fresh.
    pub fn delete_message_list(&mut self) -> SyncResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => (),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(e.into()),
        }
        self.messages = Some(HashMap::new());
        self.dirty = false;
        Ok(())
    }
}
