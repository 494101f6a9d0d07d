use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::flags::FlagSet;
use crate::folder::{Folder, StatusFolder, ValidityFile};
use crate::imapw::{FetchResult, Imap};
use crate::repos::ImapRepository;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

struct ImapRecord {
    flags: FlagSet,
    internal_date: Option<i64>,
}

/// A remote mailbox, seen through a session borrowed from the repository's
/// connection pool for the duration of the folder sync.
pub struct ImapFolder {
    name: String,
    repo: Arc<ImapRepository>,
    imap: Option<Imap>,
    validity: ValidityFile,
    messages: Option<HashMap<i64, ImapRecord>>,
}

impl ImapFolder {
    pub fn open(repo: &Arc<ImapRepository>, name: &str, sep: Option<char>) -> SyncResult<ImapFolder> {
        let mut imap = repo.acquire()?;
        if let Err(e) = imap.select_mailbox(name) {
            repo.release(imap);
            return Err(e);
        }
        Ok(ImapFolder {
            name: name.to_string(),
            repo: Arc::clone(repo),
            imap: Some(imap),
            validity: ValidityFile::new(&repo.uiddir(), name, sep.unwrap_or('/')),
            messages: None,
        })
    }

    /// Hand the session back to the pool. Without this the session just
    /// closes on drop, which is what we want on error paths anyway.
    pub fn done(&mut self) {
        if let Some(imap) = self.imap.take() {
            self.repo.release(imap);
        }
    }

    fn imap(&mut self) -> &mut Imap {
        self.imap.as_mut().expect("imap session already released")
    }

    fn list(&self) -> &HashMap<i64, ImapRecord> {
        self.messages
            .as_ref()
            .expect("imap message list not cached")
    }

    fn positive_uids(uids: &[i64]) -> Vec<u32> {
        uids.iter()
            .filter(|u| **u > 0 && **u <= u32::MAX as i64)
            .map(|u| *u as u32)
            .collect()
    }
}

impl Folder for ImapFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn copy_instance(&self) -> Option<String> {
        Some(format!("MSGCOPY_{}", self.repo.name()))
    }

    fn uid_validity(&mut self) -> SyncResult<u32> {
        let name = self.name.clone();
        let sel = self.imap().select_mailbox(&name)?;
        sel.uid_validity.ok_or_else(|| {
            SyncError::folder(ErrorKind::Other(format!(
                "server reported no UIDVALIDITY for {}",
                name
            )))
        })
    }

    fn saved_uid_validity(&mut self) -> SyncResult<Option<u32>> {
        self.validity.saved()
    }

    fn save_uid_validity(&mut self) -> SyncResult<()> {
        let v = self.uid_validity()?;
        self.validity.save(v)
    }

    fn cache_message_list(&mut self) -> SyncResult<()> {
        if self.messages.is_some() {
            return Ok(());
        }
        let name = self.name.clone();
        self.imap().select_mailbox(&name)?;
        let mut messages = HashMap::new();
        if let Some(zc_vec_fetch) = self.imap().fetch_meta_all()? {
            for fetch in zc_vec_fetch.deref() {
                if let FetchResult::Uid(uidres) = FetchResult::from(fetch) {
                    messages.insert(
                        uidres.uid() as i64,
                        ImapRecord {
                            flags: FlagSet::from(uidres.flags()),
                            internal_date: uidres.internal_date_secs(),
                        },
                    );
                }
            }
        }
        self.messages = Some(messages);
        Ok(())
    }

    fn uids(&self) -> Vec<i64> {
        self.list().keys().cloned().collect()
    }

    fn uid_exists(&self, uid: i64) -> bool {
        self.list().contains_key(&uid)
    }

    fn message_count(&self) -> usize {
        self.list().len()
    }

    fn message_flags(&self, uid: i64) -> Option<FlagSet> {
        self.list().get(&uid).map(|r| r.flags)
    }

    fn message_time(&self, uid: i64) -> Option<i64> {
        self.list().get(&uid).and_then(|r| r.internal_date)
    }

    fn message(&mut self, uid: i64) -> SyncResult<Vec<u8>> {
        let zc_vec_fetch = self.imap().fetch_body(uid as u32)?;
        for fetch in zc_vec_fetch.deref() {
            if fetch.uid == Some(uid as u32) {
                return fetch.body().map(|b| b.to_vec()).ok_or_else(|| {
                    SyncError::message(ErrorKind::Other("no BODY in FETCH result".to_string()))
                });
            }
        }
        Err(SyncError::message(ErrorKind::Other(format!(
            "uid {} not found on server",
            uid
        ))))
    }

    /// Append and then try to learn the UID the server assigned: remember
    /// UIDNEXT before the append and search the tail afterwards. Servers
    /// where that comes back ambiguous yield 0, leaving the message
    /// untracked until the next cycle.
    fn save_message(
        &mut self,
        uid: i64,
        body: Option<&[u8]>,
        flags: &FlagSet,
        rtime: Option<i64>,
    ) -> SyncResult<i64> {
        if uid > 0 && self.uid_exists(uid) {
            self.save_message_flags(uid, flags)?;
            return Ok(uid);
        }
        let name = self.name.clone();
        let uid_next = self.imap().select_mailbox(&name)?.uid_next;
        let imap_flags = flags.as_imap_flags().unwrap_or_default();
        self.imap().append(body.unwrap_or(b""), &imap_flags)?;

        let newuid = match uid_next {
            Some(next) => {
                let found = self.imap().uid_search(&format!("UID {}:*", next))?;
                // A search for {n}:* on a mailbox whose last UID is below n
                // answers with that last message, so keep only the tail.
                let mut candidates: Vec<u32> = found.into_iter().filter(|u| *u >= next).collect();
                if candidates.len() == 1 {
                    candidates.pop().unwrap() as i64
                } else {
                    0
                }
            }
            None => 0,
        };

        if newuid > 0 {
            self.imap().note_uid_next(newuid as u32 + 1);
            if let Some(messages) = self.messages.as_mut() {
                messages.insert(
                    newuid,
                    ImapRecord {
                        flags: *flags,
                        internal_date: rtime,
                    },
                );
            }
        }
        Ok(newuid)
    }

    fn save_message_flags(&mut self, uid: i64, flags: &FlagSet) -> SyncResult<()> {
        let imap_flags = flags.as_imap_flags().unwrap_or_default();
        self.imap().set_flags_for_uid(uid as u32, &imap_flags)?;
        if let Some(rec) = self
            .messages
            .as_mut()
            .and_then(|messages| messages.get_mut(&uid))
        {
            rec.flags = *flags;
        }
        Ok(())
    }

    fn add_messages_flags(&mut self, uids: &[i64], flags: &FlagSet) -> SyncResult<()> {
        let imap_flags = match flags.as_imap_flags() {
            Some(f) => f,
            None => return Ok(()),
        };
        let set = ImapFolder::positive_uids(uids);
        if set.is_empty() {
            return Ok(());
        }
        self.imap().add_flags_for_uids(&set, &imap_flags)?;
        if let Some(messages) = self.messages.as_mut() {
            for uid in uids {
                if let Some(rec) = messages.get_mut(uid) {
                    rec.flags = rec.flags.union(*flags);
                }
            }
        }
        Ok(())
    }

    fn delete_messages_flags(&mut self, uids: &[i64], flags: &FlagSet) -> SyncResult<()> {
        let imap_flags = match flags.as_imap_flags() {
            Some(f) => f,
            None => return Ok(()),
        };
        let set = ImapFolder::positive_uids(uids);
        if set.is_empty() {
            return Ok(());
        }
        self.imap().remove_flags_for_uids(&set, &imap_flags)?;
        if let Some(messages) = self.messages.as_mut() {
            for uid in uids {
                if let Some(rec) = messages.get_mut(uid) {
                    rec.flags = rec.flags.subtract(*flags);
                }
            }
        }
        Ok(())
    }

    fn delete_message(&mut self, uid: i64) -> SyncResult<()> {
        self.delete_messages(&[uid])
    }

    fn delete_messages(&mut self, uids: &[i64]) -> SyncResult<()> {
        let set = ImapFolder::positive_uids(uids);
        if set.is_empty() {
            return Ok(());
        }
        self.imap().delete_uids(&set)?;
        if let Some(messages) = self.messages.as_mut() {
            for uid in uids {
                messages.remove(uid);
            }
        }
        Ok(())
    }

    /// One round trip: the message count of the selected mailbox against the
    /// number of status records.
    fn quick_changed(&mut self, status: &StatusFolder) -> SyncResult<bool> {
        let name = self.name.clone();
        let exists = self.imap().select_mailbox(&name)?.exists;
        Ok(exists as usize != status.message_count())
    }
}
