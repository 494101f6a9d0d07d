use crate::config::{expand_home, AccountConfig, General, RepoConfig};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::folder::maildir::{MaildirFolder, MaildirOptions};
use crate::folder::StatusFolder;
use crate::imapw::Imap;
use crate::pool::Event;
use crate::ui::Ui;
use imap::types::NameAttribute;
use regex::Regex;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

/// A remote folder as discovered by LIST.
pub struct RemoteFolderInfo {
    pub name: String,
    pub sep: Option<char>,
}

struct Keepalive {
    stop: Arc<Event>,
    handle: JoinHandle<()>,
}

/// The remote side: a pool of logged-in IMAP sessions plus the folder
/// enumeration and replication entry points. Sessions are created on demand
/// up to whatever bound the folder pools enforce, reused across cycles when
/// `holdconnectionopen` is set, and NOOPed while the account sleeps.
pub struct ImapRepository {
    name: String,
    cfg: RepoConfig,
    socktimeout: u64,
    uiddir: PathBuf,
    ui: Arc<Ui>,
    pool: Mutex<Vec<Imap>>,
    keepalive: Mutex<Option<Keepalive>>,
}

impl ImapRepository {
    pub fn new(
        name: &str,
        cfg: &RepoConfig,
        general: &General,
        metadata: &Path,
        ui: Arc<Ui>,
    ) -> SyncResult<ImapRepository> {
        let uiddir = metadata
            .join(format!("Repository-{}", name))
            .join("FolderValidity");
        fs::create_dir_all(&uiddir)?;
        Ok(ImapRepository {
            name: name.to_string(),
            cfg: cfg.clone(),
            socktimeout: general.socktimeout,
            uiddir,
            ui,
            pool: Mutex::new(Vec::new()),
            keepalive: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn readonly(&self) -> bool {
        self.cfg.readonly
    }

    pub fn uiddir(&self) -> PathBuf {
        self.uiddir.clone()
    }

    pub fn acquire(&self) -> SyncResult<Imap> {
        if let Some(imap) = self.pool.lock().unwrap().pop() {
            return Ok(imap);
        }
        Imap::connect(&self.cfg, self.socktimeout)
    }

    pub fn release(&self, imap: Imap) {
        self.pool.lock().unwrap().push(imap);
    }

    pub fn drop_connections(&self) {
        let mut pool = self.pool.lock().unwrap();
        for mut imap in pool.drain(..) {
            imap.logout();
        }
    }

    pub fn hold_or_drop_connections(&self) {
        if !self.cfg.holdconnectionopen {
            self.drop_connections();
        }
    }

    /// NOOP the pooled sessions on an interval so servers do not reap them
    /// while the account sleeps. Sessions that fail the NOOP are discarded.
    pub fn start_keepalive(self: &Arc<Self>) {
        if self.cfg.keepalive == 0 {
            return;
        }
        let mut guard = self.keepalive.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(Event::new());
        let thread_stop = Arc::clone(&stop);
        let repo = Arc::clone(self);
        let interval = Duration::from_secs(self.cfg.keepalive);
        let handle = spawn(move || {
            while !thread_stop.wait_timeout(interval) {
                let mut pool = repo.pool.lock().unwrap();
                let mut alive = Vec::with_capacity(pool.len());
                for mut imap in pool.drain(..) {
                    match imap.noop() {
                        Ok(()) => alive.push(imap),
                        Err(e) => repo
                            .ui
                            .warn(&repo.name, &format!("dropping dead connection: {}", e)),
                    }
                }
                *pool = alive;
            }
        });
        *guard = Some(Keepalive { stop, handle });
    }

    pub fn stop_keepalive(&self) {
        if let Some(ka) = self.keepalive.lock().unwrap().take() {
            ka.stop.set();
            ka.handle.join().ok();
        }
    }

    /// Enumerate selectable folders, honoring the `-f` restriction or the
    /// repository's folderfilter/folderincludes.
    pub fn get_folders(&self, restrict: Option<&[String]>) -> SyncResult<Vec<RemoteFolderInfo>> {
        let filters = self.compile_folderfilter()?;
        let mut imap = self.acquire()?;
        let listing = match imap.list() {
            Ok(l) => l,
            Err(e) => {
                self.release(imap);
                return Err(e);
            }
        };

        let mut folders = Vec::new();
        for mailbox in listing.deref().iter() {
            if mailbox.attributes().contains(&NameAttribute::NoSelect) {
                continue;
            }
            let name = mailbox.name().to_string();
            let wanted = match restrict {
                Some(names) => names.iter().any(|n| n == &name),
                None => match &filters {
                    Some(filters) => {
                        filters.iter().any(|re| re.is_match(&name))
                            || self.cfg.folderincludes.contains(&name)
                    }
                    None => true,
                },
            };
            if !wanted {
                continue;
            }
            folders.push(RemoteFolderInfo {
                sep: mailbox.delimiter().and_then(|d| d.chars().next()),
                name,
            });
        }
        self.release(imap);
        Ok(folders)
    }

    fn compile_folderfilter(&self) -> SyncResult<Option<Vec<Regex>>> {
        match &self.cfg.folderfilter {
            None => Ok(None),
            Some(patterns) => {
                let mut filters = Vec::with_capacity(patterns.len());
                for p in patterns {
                    filters.push(Regex::new(p).map_err(|e| {
                        SyncError::critical(ErrorKind::Config(format!(
                            "bad folderfilter pattern {}: {}",
                            p, e
                        )))
                    })?);
                }
                Ok(Some(filters))
            }
        }
    }

    /// Replicate the remote folder tree onto the local repository,
    /// translating separators. Local folders are only ever created, never
    /// removed.
    pub fn sync_folders_to(
        &self,
        folders: &[RemoteFolderInfo],
        local: &MaildirRepository,
    ) -> SyncResult<()> {
        for folder in folders {
            let translated = match folder.sep {
                Some(sep) => folder.name.replace(sep, &local.sep().to_string()),
                None => folder.name.clone(),
            };
            local.make_folder(&translated)?;
        }
        Ok(())
    }
}

/// The local side: Maildir folders under one root directory.
pub struct MaildirRepository {
    root: PathBuf,
    sep: char,
    readonly: bool,
    restoreatime: bool,
    opts: MaildirOptions,
    uiddir: PathBuf,
}

impl MaildirRepository {
    pub fn new(
        name: &str,
        cfg: &RepoConfig,
        acct: &AccountConfig,
        general: &General,
        metadata: &Path,
    ) -> SyncResult<MaildirRepository> {
        let localfolders = cfg.localfolders.as_deref().ok_or_else(|| {
            SyncError::critical(ErrorKind::Config(format!(
                "repository {} has no localfolders configured",
                name
            )))
        })?;
        let root = expand_home(localfolders);
        fs::create_dir_all(&root)?;
        let uiddir = metadata
            .join(format!("Repository-{}", name))
            .join("FolderValidity");
        fs::create_dir_all(&uiddir)?;
        Ok(MaildirRepository {
            root,
            sep: cfg.sep(),
            readonly: cfg.readonly,
            restoreatime: cfg.restoreatime,
            opts: MaildirOptions {
                fsync: general.fsync,
                translatecrlf: cfg.translatecrlf,
                restoreatime: cfg.restoreatime,
                maxage: acct.maxage,
                maxsize: acct.maxsize,
            },
            uiddir,
        })
    }

    pub fn sep(&self) -> char {
        self.sep
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn get_folder(&self, name: &str) -> SyncResult<MaildirFolder> {
        MaildirFolder::new(&self.root, name, self.sep, &self.uiddir, self.opts.clone())
    }

    pub fn make_folder(&self, name: &str) -> SyncResult<()> {
        let path = self.root.join(name);
        for sub in &["cur", "new", "tmp"] {
            fs::create_dir_all(path.join(sub))?;
        }
        Ok(())
    }

    pub fn restore_atime(&self, folder: &mut MaildirFolder) -> SyncResult<()> {
        if self.restoreatime {
            folder.restore_atime()?;
        }
        Ok(())
    }
}

/// The witness: per-folder status files under the account's metadata
/// directory.
pub struct StatusRepository {
    root: PathBuf,
    sep: char,
}

impl StatusRepository {
    pub fn new(metadata_account: &Path, local_sep: char) -> SyncResult<StatusRepository> {
        let root = metadata_account.join("LocalStatus");
        fs::create_dir_all(&root)?;
        Ok(StatusRepository {
            root,
            sep: local_sep,
        })
    }

    pub fn get_folder(&self, name: &str) -> StatusFolder {
        StatusFolder::new(&self.root, name, self.sep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_folder_creates_the_maildir_triple() {
        let dir = tempfile::tempdir().unwrap();
        let repo = maildir_repo(dir.path());
        repo.make_folder("Lists/rust").unwrap();
        for sub in &["cur", "new", "tmp"] {
            assert!(dir.path().join("mail/Lists/rust").join(sub).is_dir());
        }
    }

    #[test]
    fn status_folders_live_under_localstatus() {
        let dir = tempfile::tempdir().unwrap();
        let repo = StatusRepository::new(&dir.path().join("Account-test"), '/').unwrap();
        let mut folder = repo.get_folder("Lists/rust");
        folder.cache_message_list().unwrap();
        folder.save_message(1, &crate::flags::FlagSet::new());
        folder.save().unwrap();
        assert!(dir
            .path()
            .join("Account-test/LocalStatus/Lists.rust")
            .is_file());
    }

    fn maildir_repo(dir: &Path) -> MaildirRepository {
        let cfg = RepoConfig {
            rtype: crate::config::RepoType::Maildir,
            server: None,
            port: None,
            username: None,
            password: None,
            password_command: None,
            server_ca_path: None,
            maxconnections: 2,
            holdconnectionopen: false,
            keepalive: 0,
            readonly: false,
            folderfilter: None,
            folderincludes: vec![],
            localfolders: Some(dir.join("mail").to_string_lossy().to_string()),
            sep: Some("/".to_string()),
            restoreatime: false,
            translatecrlf: true,
        };
        let acct = AccountConfig {
            localrepository: "local".to_string(),
            remoterepository: "remote".to_string(),
            autorefresh: None,
            quick: 0,
            maxage: None,
            maxsize: None,
            presynchook: None,
            postsynchook: None,
        };
        MaildirRepository::new("local", &cfg, &acct, &General::default(), dir).unwrap()
    }
}
