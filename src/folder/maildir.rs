use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::flags::{FlagSet, FlagValue};
use crate::folder::{Folder, StatusFolder, ValidityFile};
use chrono::prelude::*;
use filetime::FileTime;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

static UID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r",U=(\d+)").unwrap());
static FLAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":2,([A-Z]*)").unwrap());
static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)").unwrap());

// Unique-name state shared by every folder: second-resolution timestamp plus
// a sequence number for names minted within the same second.
static TIME_SEQ: Mutex<(i64, u32)> = Mutex::new((0, 0));

fn time_seq() -> (i64, u32) {
    let mut state = TIME_SEQ.lock().unwrap();
    let thistime = Utc::now().timestamp();
    if thistime == state.0 {
        state.1 += 1;
    } else {
        *state = (thistime, 0);
    }
    (state.0, state.1)
}

static HOSTNAME: Lazy<String> = Lazy::new(|| {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).to_string()
    } else {
        "localhost".to_string()
    }
});

struct MaildirRecord {
    flags: FlagSet,
    /// Path relative to the folder root, e.g. `cur/12345_0...:2,S`.
    filename: PathBuf,
}

#[derive(Clone)]
pub struct MaildirOptions {
    pub fsync: bool,
    pub translatecrlf: bool,
    pub restoreatime: bool,
    pub maxage: Option<i64>,
    pub maxsize: Option<u64>,
}

impl Default for MaildirOptions {
    fn default() -> MaildirOptions {
        MaildirOptions {
            fsync: true,
            translatecrlf: true,
            restoreatime: false,
            maxage: None,
            maxsize: None,
        }
    }
}

/// One Maildir mailbox: `cur/`, `new/` and `tmp/` under a folder directory,
/// messages named per the `U=<uid>,FMD5=<hex>:2,<FLAGS>` grammar.
pub struct MaildirFolder {
    name: String,
    path: PathBuf,
    opts: MaildirOptions,
    validity: ValidityFile,
    messages: Option<HashMap<i64, MaildirRecord>>,
    saved_atimes: Vec<(PathBuf, FileTime, FileTime)>,
}

impl MaildirFolder {
    pub fn new(
        root: &Path,
        name: &str,
        sep: char,
        uiddir: &Path,
        opts: MaildirOptions,
    ) -> SyncResult<MaildirFolder> {
        let path = root.join(name);
        for sub in &["cur", "new", "tmp"] {
            fs::create_dir_all(path.join(sub))?;
        }
        Ok(MaildirFolder {
            name: name.to_string(),
            path,
            opts,
            validity: ValidityFile::new(uiddir, name, sep),
            messages: None,
            saved_atimes: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn folder_md5(&self) -> String {
        format!("{:x}", md5::compute(self.name.as_bytes()))
    }

    fn list(&self) -> &HashMap<i64, MaildirRecord> {
        self.messages
            .as_ref()
            .expect("maildir message list not cached")
    }

    /// Oldest timestamp still within `maxage` days, truncated to the UTC day
    /// boundary so the filter lines up with IMAP `SINCE`.
    fn maxage_cutoff(maxage: i64) -> i64 {
        let oldest = Utc::now().timestamp() - maxage * 86400;
        let into_day = match Utc.timestamp_opt(oldest, 0).single() {
            Some(dt) => (dt.hour() * 3600 + dt.minute() * 60 + dt.second()) as i64,
            None => 0,
        };
        oldest - into_day
    }

    fn scan(&self) -> SyncResult<HashMap<i64, MaildirRecord>> {
        let mut retval = HashMap::new();
        // Messages without a UID of ours get negative placeholders.
        let mut nouidcounter: i64 = -1;
        let folderstr = format!(",FMD5={}", self.folder_md5());
        let cutoff = self.opts.maxage.map(MaildirFolder::maxage_cutoff);

        for dirannex in &["new", "cur"] {
            let dirpath = self.path.join(dirannex);
            for entry in fs::read_dir(&dirpath)? {
                let entry = entry?;
                let messagename = entry.file_name().to_string_lossy().to_string();

                if let Some(cutoff) = cutoff {
                    if let Some(m) = TIMESTAMP_RE.captures(&messagename) {
                        let stamp: i64 = m[1].parse().unwrap_or(0);
                        if stamp < cutoff {
                            continue;
                        }
                    }
                }
                if let Some(maxsize) = self.opts.maxsize {
                    if entry.metadata()?.len() > maxsize {
                        continue;
                    }
                }

                let uid = if !messagename.contains(&folderstr) {
                    // No folder marker, or one from some other folder: a
                    // foreign message whose UID we cannot trust.
                    let uid = nouidcounter;
                    nouidcounter -= 1;
                    uid
                } else {
                    match UID_RE.captures(&messagename) {
                        Some(m) => m[1].parse::<i64>().unwrap_or_else(|_| {
                            let uid = nouidcounter;
                            nouidcounter -= 1;
                            uid
                        }),
                        None => {
                            let uid = nouidcounter;
                            nouidcounter -= 1;
                            uid
                        }
                    }
                };

                let flags = match FLAG_RE.captures(&messagename) {
                    Some(m) => FlagSet::from(&m[1]),
                    None => FlagSet::new(),
                };

                retval.insert(
                    uid,
                    MaildirRecord {
                        flags,
                        filename: PathBuf::from(dirannex).join(&messagename),
                    },
                );
            }
        }
        Ok(retval)
    }

    fn record_atimes(&mut self) -> SyncResult<()> {
        if !self.opts.restoreatime || !self.saved_atimes.is_empty() {
            return Ok(());
        }
        for sub in &["cur", "new"] {
            let dir = self.path.join(sub);
            let meta = fs::metadata(&dir)?;
            self.saved_atimes.push((
                dir,
                FileTime::from_last_access_time(&meta),
                FileTime::from_last_modification_time(&meta),
            ));
        }
        Ok(())
    }

    /// Put the `cur/` and `new/` access times back the way they were before
    /// we scanned, so atime-watching mail checkers are not fooled.
    pub fn restore_atime(&mut self) -> SyncResult<()> {
        for (dir, atime, mtime) in self.saved_atimes.drain(..) {
            filetime::set_file_times(&dir, atime, mtime)?;
        }
        Ok(())
    }
}

impl Folder for MaildirFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn uid_validity(&mut self) -> SyncResult<u32> {
        // Maildirs have no notion of uidvalidity, so we just return a magic
        // token.
        Ok(42)
    }

    fn saved_uid_validity(&mut self) -> SyncResult<Option<u32>> {
        self.validity.saved()
    }

    fn save_uid_validity(&mut self) -> SyncResult<()> {
        let v = self.uid_validity()?;
        self.validity.save(v)
    }

    fn cache_message_list(&mut self) -> SyncResult<()> {
        if self.messages.is_none() {
            self.record_atimes()?;
            self.messages = Some(self.scan()?);
        }
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
        let rec = self.list().get(&uid)?;
        let meta = fs::metadata(self.path.join(&rec.filename)).ok()?;
        let mtime = meta.modified().ok()?;
        mtime.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs() as i64)
    }

    fn message(&mut self, uid: i64) -> SyncResult<Vec<u8>> {
        let rec = self.list().get(&uid).ok_or_else(|| {
            SyncError::message(ErrorKind::Other(format!("no message with uid {}", uid)))
        })?;
        let raw = fs::read(self.path.join(&rec.filename))?;
        if self.opts.translatecrlf {
            Ok(translate_crlf(&raw))
        } else {
            Ok(raw)
        }
    }

    fn save_message(
        &mut self,
        uid: i64,
        body: Option<&[u8]>,
        flags: &FlagSet,
        rtime: Option<i64>,
    ) -> SyncResult<i64> {
        if uid < 0 {
            // We cannot assign a new uid.
            return Ok(uid);
        }
        if self.uid_exists(uid) {
            // We already have it, just update flags.
            self.save_message_flags(uid, flags)?;
            return Ok(uid);
        }

        // Write to tmp/, then let save_message_flags give it a permanent
        // home in cur/ or new/.
        let (timeval, timeseq) = time_seq();
        let messagename = format!(
            "{}_{}.{}.{},U={},FMD5={}",
            timeval,
            timeseq,
            std::process::id(),
            &*HOSTNAME,
            uid,
            self.folder_md5()
        );
        let tmppath = self.path.join("tmp").join(&messagename);
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmppath)
        {
            Ok(f) => f,
            Err(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SyncError::message(ErrorKind::MessageExists(messagename)));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(body.unwrap_or(b""))?;
        // Make sure the data hits the disk.
        file.flush()?;
        if self.opts.fsync {
            file.sync_all()?;
        }
        drop(file);

        if let Some(rtime) = rtime {
            let t = FileTime::from_unix_time(rtime, 0);
            filetime::set_file_times(&tmppath, t, t)?;
        }

        self.messages
            .as_mut()
            .expect("maildir message list not cached")
            .insert(
                uid,
                MaildirRecord {
                    flags: FlagSet::new(),
                    filename: PathBuf::from("tmp").join(&messagename),
                },
            );
        self.save_message_flags(uid, flags)?;

        // By now, the message had better not be in tmp/ land.
        debug_assert!(!self.list()[&uid].filename.starts_with("tmp"));
        Ok(uid)
    }

    fn save_message_flags(&mut self, uid: i64, flags: &FlagSet) -> SyncResult<()> {
        let oldfilename = match self.list().get(&uid) {
            Some(rec) => rec.filename.clone(),
            None => {
                return Err(SyncError::message(ErrorKind::Other(format!(
                    "no message with uid {}",
                    uid
                ))))
            }
        };
        let name = oldfilename
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        // Strip any existing info section.
        let base = name.split(':').next().unwrap_or(&name).to_string();
        // A seen message lives in cur, everything else in new.
        let dir_prefix = if flags.contains(FlagValue::Seen) {
            "cur"
        } else {
            "new"
        };
        let newfilename = PathBuf::from(dir_prefix).join(format!("{}:2,{}", base, flags));

        if newfilename != oldfilename {
            fs::rename(self.path.join(&oldfilename), self.path.join(&newfilename))?;
            let rec = self
                .messages
                .as_mut()
                .expect("maildir message list not cached")
                .get_mut(&uid)
                .unwrap();
            rec.flags = *flags;
            rec.filename = newfilename;
        }
        Ok(())
    }

    fn delete_message(&mut self, uid: i64) -> SyncResult<()> {
        let filename = match self.list().get(&uid) {
            Some(rec) => rec.filename.clone(),
            None => return Ok(()),
        };
        match fs::remove_file(self.path.join(&filename)) {
            Ok(()) => (),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Some other client may have moved it (e.g. new -> cur);
                // rescan to find the current name before giving up.
                let fresh = self.scan()?;
                if let Some(rec) = fresh.get(&uid) {
                    fs::remove_file(self.path.join(&rec.filename))?;
                }
            }
            Err(e) => return Err(e.into()),
        }
        self.messages
            .as_mut()
            .expect("maildir message list not cached")
            .remove(&uid);
        Ok(())
    }

    fn quick_changed(&mut self, status: &StatusFolder) -> SyncResult<bool> {
        self.cache_message_list()?;
        let mine: HashSet<i64> = self.list().keys().cloned().collect();
        let theirs: HashSet<i64> = status.uids().into_iter().collect();
        if mine != theirs {
            return Ok(true);
        }
        // Also check for flag changes, it's quick on a Maildir.
        for (uid, rec) in self.list() {
            if status.message_flags(*uid) != Some(rec.flags) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn translate_crlf(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\r' && i + 1 < raw.len() && raw[i + 1] == b'\n' {
            i += 1;
            continue;
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::folder_basename;

    fn open(dir: &Path, name: &str, opts: MaildirOptions) -> MaildirFolder {
        let uiddir = dir.join("validity");
        let mut f = MaildirFolder::new(&dir.join("mail"), name, '/', &uiddir, opts).unwrap();
        f.cache_message_list().unwrap();
        f
    }

    fn filenames(folder: &MaildirFolder, sub: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(folder.path().join(sub))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn save_places_seen_in_cur_and_unseen_in_new() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());

        assert_eq!(
            folder
                .save_message(10, Some(b"Subject: a\n\nbody"), &FlagSet::from("S"), None)
                .unwrap(),
            10
        );
        assert_eq!(
            folder
                .save_message(11, Some(b"Subject: b\n\nbody"), &FlagSet::new(), None)
                .unwrap(),
            11
        );

        let cur = filenames(&folder, "cur");
        let new = filenames(&folder, "new");
        let md5 = format!("{:x}", md5::compute(b"INBOX"));
        assert_eq!(cur.len(), 1);
        assert!(cur[0].contains(",U=10,"));
        assert!(cur[0].contains(&format!(",FMD5={}", md5)));
        assert!(cur[0].ends_with(":2,S"));
        assert_eq!(new.len(), 1);
        assert!(new[0].contains(",U=11,"));
        assert!(new[0].ends_with(":2,"));

        // tmp/ must be empty after a successful save.
        assert!(filenames(&folder, "tmp").is_empty());
    }

    #[test]
    fn save_existing_uid_updates_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        folder
            .save_message(11, Some(b"x"), &FlagSet::new(), None)
            .unwrap();
        assert_eq!(
            folder
                .save_message(11, Some(b"ignored"), &FlagSet::from("S"), None)
                .unwrap(),
            11
        );
        assert_eq!(filenames(&folder, "new").len(), 0);
        assert_eq!(filenames(&folder, "cur").len(), 1);
        assert_eq!(folder.message_flags(11), Some(FlagSet::from("S")));
    }

    #[test]
    fn save_negative_uid_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        assert_eq!(
            folder
                .save_message(-3, Some(b"x"), &FlagSet::new(), None)
                .unwrap(),
            -3
        );
        assert_eq!(folder.message_count(), 0);
    }

    #[test]
    fn scan_round_trips_saved_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        folder
            .save_message(10, Some(b"a"), &FlagSet::from("RS"), None)
            .unwrap();
        folder
            .save_message(11, Some(b"b"), &FlagSet::new(), None)
            .unwrap();

        let mut reread = open(dir.path(), "INBOX", MaildirOptions::default());
        reread.cache_message_list().unwrap();
        let mut uids = reread.uids();
        uids.sort();
        assert_eq!(uids, vec![10, 11]);
        assert_eq!(reread.message_flags(10), Some(FlagSet::from("RS")));
    }

    #[test]
    fn foreign_messages_get_negative_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let folder = open(dir.path(), "INBOX", MaildirOptions::default());
        // Delivered by some other agent: no FMD5 marker at all.
        fs::write(folder.path().join("new/123_0.99.elsewhere"), b"x").unwrap();
        // Copied in from another folder: FMD5 mismatch, U= must be ignored.
        let other_md5 = format!("{:x}", md5::compute(b"Archive"));
        fs::write(
            folder
                .path()
                .join(format!("cur/124_0.99.host,U=7,FMD5={}:2,S", other_md5)),
            b"y",
        )
        .unwrap();

        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        folder.cache_message_list().unwrap();
        let mut uids = folder.uids();
        uids.sort();
        assert_eq!(uids, vec![-2, -1]);
        assert!(!folder.uid_exists(7));
    }

    #[test]
    fn delete_survives_a_concurrent_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        folder
            .save_message(10, Some(b"a"), &FlagSet::new(), None)
            .unwrap();

        // Another client moves the message and changes its flags.
        let name = filenames(&folder, "new").remove(0);
        let base = name.split(':').next().unwrap().to_string();
        fs::rename(
            folder.path().join("new").join(&name),
            folder.path().join("cur").join(format!("{}:2,S", base)),
        )
        .unwrap();

        folder.delete_message(10).unwrap();
        assert!(filenames(&folder, "cur").is_empty());
        assert!(!folder.uid_exists(10));
    }

    #[test]
    fn message_read_translates_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        folder
            .save_message(10, Some(b"line1\r\nline2\rstill\n"), &FlagSet::new(), None)
            .unwrap();
        assert_eq!(folder.message(10).unwrap(), b"line1\nline2\rstill\n");

        let mut raw = open(
            dir.path(),
            "INBOX",
            MaildirOptions {
                translatecrlf: false,
                ..MaildirOptions::default()
            },
        );
        raw.cache_message_list().unwrap();
        assert_eq!(raw.message(10).unwrap(), b"line1\r\nline2\rstill\n");
    }

    #[test]
    fn rtime_sets_the_file_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        folder
            .save_message(10, Some(b"a"), &FlagSet::new(), Some(1_000_000))
            .unwrap();
        assert_eq!(folder.message_time(10), Some(1_000_000));
    }

    #[test]
    fn maxsize_filters_large_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        folder
            .save_message(10, Some(&[b'x'; 100]), &FlagSet::new(), None)
            .unwrap();
        folder
            .save_message(11, Some(b"small"), &FlagSet::new(), None)
            .unwrap();

        let mut filtered = open(
            dir.path(),
            "INBOX",
            MaildirOptions {
                maxsize: Some(50),
                ..MaildirOptions::default()
            },
        );
        filtered.cache_message_list().unwrap();
        assert_eq!(filtered.uids(), vec![11]);
    }

    #[test]
    fn maxage_filters_old_messages() {
        let dir = tempfile::tempdir().unwrap();
        let folder = open(dir.path(), "INBOX", MaildirOptions::default());
        let md5 = format!("{:x}", md5::compute(b"INBOX"));
        let now = Utc::now().timestamp();
        fs::write(
            folder
                .path()
                .join(format!("cur/1000_0.1.h,U=1,FMD5={}:2,S", md5)),
            b"old",
        )
        .unwrap();
        fs::write(
            folder
                .path()
                .join(format!("cur/{}_0.1.h,U=2,FMD5={}:2,S", now, md5)),
            b"new",
        )
        .unwrap();

        let mut filtered = open(
            dir.path(),
            "INBOX",
            MaildirOptions {
                maxage: Some(1),
                ..MaildirOptions::default()
            },
        );
        filtered.cache_message_list().unwrap();
        assert_eq!(filtered.uids(), vec![2]);
    }

    #[test]
    fn quick_changed_tracks_uid_and_flag_drift() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        folder
            .save_message(10, Some(b"a"), &FlagSet::from("S"), None)
            .unwrap();

        let status_dir = tempfile::tempdir().unwrap();
        let mut status = StatusFolder::new(status_dir.path(), "INBOX", '/');
        status.cache_message_list().unwrap();

        // Status empty, folder has a message.
        assert!(folder.quick_changed(&status).unwrap());

        status.save_message(10, &FlagSet::from("S"));
        assert!(!folder.quick_changed(&status).unwrap());

        // Same UIDs, different flags.
        status.save_message(10, &FlagSet::new());
        assert!(folder.quick_changed(&status).unwrap());
    }

    #[test]
    fn uid_validity_is_the_maildir_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = open(dir.path(), "INBOX", MaildirOptions::default());
        assert_eq!(folder.uid_validity().unwrap(), 42);
        assert_eq!(folder.saved_uid_validity().unwrap(), None);
        assert!(folder.is_uid_validity_ok().unwrap());
        // First check saved the sentinel under the escaped folder name.
        let saved = dir
            .path()
            .join("validity")
            .join(folder_basename("INBOX", '/'));
        assert_eq!(fs::read_to_string(saved).unwrap().trim(), "42");
    }
}
