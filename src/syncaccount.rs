use crate::config::{AccountConfig, Config, RepoType};
use crate::error::{ErrorKind, Severity, SyncError, SyncResult};
use crate::mbnames::Mbnames;
use crate::pool::{spawn_limited, Event, Limits};
use crate::repos::{ImapRepository, MaildirRepository, StatusRepository};
use crate::syncfolder::{sync_folder, SyncContext};
use crate::ui::Ui;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SleepResult {
    /// No autorefresh configured; the account is one-shot.
    NoRefresh,
    /// The refresh period elapsed.
    Timeout,
    /// A resync signal skipped this sleep; the skip is consumed.
    Skipped,
    /// The process-wide abort is set.
    Abort,
}

/// Whether this cycle runs quick. A cadence of N gives N quick cycles
/// between full ones; negative means always quick, zero never.
fn compute_quick(quickconfig: i32, quicknum: &mut i32) -> bool {
    if quickconfig < 0 {
        true
    } else if quickconfig > 0 {
        if *quicknum == 0 || *quicknum > quickconfig {
            *quicknum = 1;
            false
        } else {
            *quicknum += 1;
            true
        }
    } else {
        false
    }
}

/// One configured account: two repositories, a witness, and the loop that
/// keeps them reconciled until shutdown.
pub struct Account {
    pub name: String,
    config: Arc<Config>,
    acct: AccountConfig,
    ui: Arc<Ui>,
    limits: Arc<Limits>,
    abort: Arc<Event>,
    /// Set by the resync signal, consumed by one sleeper wakeup.
    pub skip_sleep: Arc<AtomicBool>,
    mbnames: Arc<Mbnames>,
    refresh: Option<Duration>,
    quicknum: i32,
}

impl Account {
    pub fn new(
        name: &str,
        config: Arc<Config>,
        ui: Arc<Ui>,
        limits: Arc<Limits>,
        abort: Arc<Event>,
        mbnames: Arc<Mbnames>,
    ) -> SyncResult<Account> {
        let acct = config
            .account(name)
            .map_err(|e| SyncError::critical(ErrorKind::Config(e.to_string())))?
            .clone();
        let refresh = match acct.autorefresh {
            Some(minutes) if minutes > 0.0 => {
                Some(Duration::from_secs((minutes * 60.0) as u64))
            }
            _ => None,
        };
        Ok(Account {
            name: name.to_string(),
            config,
            acct,
            ui,
            limits,
            abort,
            skip_sleep: Arc::new(AtomicBool::new(false)),
            mbnames,
            refresh,
            quicknum: 0,
        })
    }

    /// Run the account until its loop ends: instantiate the repositories,
    /// then sync with a three-strike failure budget, sleeping in between
    /// when autorefresh is configured.
    pub fn sync_runner(&mut self) -> SyncResult<()> {
        let metadata = self.config.metadata_dir();
        let acct_meta = metadata.join(format!("Account-{}", self.name));
        if !acct_meta.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&acct_meta)?;
        }

        let remote_cfg = self.repo_config(&self.acct.remoterepository, true)?;
        let local_cfg = self.repo_config(&self.acct.localrepository, false)?;
        let remote = Arc::new(ImapRepository::new(
            &self.acct.remoterepository,
            &remote_cfg,
            &self.config.general,
            &metadata,
            Arc::clone(&self.ui),
        )?);
        let local = Arc::new(MaildirRepository::new(
            &self.acct.localrepository,
            &local_cfg,
            &self.acct,
            &self.config.general,
            &metadata,
        )?);
        let status = Arc::new(StatusRepository::new(&acct_meta, local.sep())?);

        let mut looping = 3;
        loop {
            match self.sync(&remote, &local, &status) {
                Ok(()) => {
                    if self.refresh.is_some() {
                        looping = 3;
                    }
                }
                Err(e) => {
                    self.ui
                        .warn(&self.name, &format!("error syncing account: {}", e));
                    if e.severity >= Severity::Repo {
                        looping -= 1;
                        if e.severity >= Severity::Critical {
                            return Err(e);
                        }
                    }
                }
            }
            if looping == 0 {
                break;
            }
            match self.sleeper(&remote) {
                SleepResult::Abort | SleepResult::NoRefresh => break,
                SleepResult::Skipped | SleepResult::Timeout => (),
            }
        }
        self.ui.info(&self.name, "account done");
        Ok(())
    }

    fn repo_config(&self, name: &str, want_remote: bool) -> SyncResult<crate::config::RepoConfig> {
        let cfg = self
            .config
            .repository(name)
            .map_err(|e| SyncError::critical(ErrorKind::Config(e.to_string())))?;
        let ok = match cfg.rtype {
            RepoType::Imap | RepoType::Gmail => want_remote,
            RepoType::Maildir | RepoType::Backup => !want_remote,
        };
        if !ok {
            return Err(SyncError::critical(ErrorKind::Config(format!(
                "repository {} has the wrong type for its role",
                name
            ))));
        }
        Ok(cfg.clone())
    }

    /// One sync cycle: hooks around folder enumeration, tree replication
    /// and the per-folder tasks. Any failure drops both repositories'
    /// connections, since they may be stale (e.g. after suspend/resume).
    fn sync(
        &mut self,
        remote: &Arc<ImapRepository>,
        local: &Arc<MaildirRepository>,
        status: &Arc<StatusRepository>,
    ) -> SyncResult<()> {
        self.call_hook("presynchook", self.acct.presynchook.as_deref());
        let quick = compute_quick(self.acct.quick, &mut self.quicknum);

        let result = self.sync_folders(remote, local, status, quick);
        match result {
            Err(e) => {
                remote.drop_connections();
                return Err(e);
            }
            Ok(()) => {
                remote.hold_or_drop_connections();
            }
        }

        self.call_hook("postsynchook", self.acct.postsynchook.as_deref());
        Ok(())
    }

    fn sync_folders(
        &self,
        remote: &Arc<ImapRepository>,
        local: &Arc<MaildirRepository>,
        status: &Arc<StatusRepository>,
        quick: bool,
    ) -> SyncResult<()> {
        let folders = remote.get_folders(self.config.folder_restrict.as_deref())?;
        if !local.readonly() {
            remote.sync_folders_to(&folders, local)?;
        }

        let instance = format!("FOLDER_{}", remote.name());
        let mut handles = Vec::with_capacity(folders.len());
        for rinfo in folders {
            let ctx = SyncContext {
                ui: Arc::clone(&self.ui),
                limits: Arc::clone(&self.limits),
                account: self.name.clone(),
            };
            let remote = Arc::clone(remote);
            let local = Arc::clone(local);
            let status = Arc::clone(status);
            let mbnames = Arc::clone(&self.mbnames);
            let thread_name = format!("Folder sync {}[{}]", self.name, rinfo.name);
            self.ui.debug("thread", &self.name, &format!("spawning {}", thread_name));
            let handle = spawn_limited(&self.limits, &instance, thread_name, move || {
                sync_folder(&ctx, &remote, &rinfo, &local, &status, quick, &mbnames)
            })?;
            handles.push(handle);
        }

        let mut worst: Option<SyncError> = None;
        for handle in handles {
            let result = match handle.join() {
                Ok(r) => r,
                Err(_) => Err(SyncError::critical(ErrorKind::Other(
                    "folder sync thread panicked".to_string(),
                ))),
            };
            if let Err(e) = result {
                match &worst {
                    Some(w) if w.severity >= e.severity => (),
                    _ => worst = Some(e),
                }
            }
        }

        if let Err(e) = self.mbnames.write() {
            self.ui
                .warn(&self.name, &format!("could not write mbnames: {}", e));
        }

        match worst {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sleep out the refresh period with keepalive running, waking early
    /// for a skip-sleep signal (consumed, and the next cycle is a full
    /// one) or the process-wide abort.
    fn sleeper(&mut self, remote: &Arc<ImapRepository>) -> SleepResult {
        let refresh = match self.refresh {
            Some(r) => r,
            None => return SleepResult::NoRefresh,
        };

        remote.start_keepalive();
        self.ui.sleeping(&self.name, refresh.as_secs());
        let mut slept = Duration::from_secs(0);
        let result = loop {
            if self.abort.wait_timeout(Duration::from_secs(1)) {
                break SleepResult::Abort;
            }
            if self.skip_sleep.swap(false, Ordering::SeqCst) {
                break SleepResult::Skipped;
            }
            slept += Duration::from_secs(1);
            if slept >= refresh {
                break SleepResult::Timeout;
            }
        };
        remote.stop_keepalive();

        if result == SleepResult::Skipped {
            self.quicknum = 0;
        }
        result
    }

    fn call_hook(&self, which: &str, cmd: Option<&str>) {
        let cmd = match cmd {
            Some(c) if !c.is_empty() => c,
            _ => return,
        };
        self.ui
            .info(&self.name, &format!("calling {}: {}", which, cmd));
        match Command::new("sh").arg("-c").arg(cmd).output() {
            Ok(out) => {
                if !out.stdout.is_empty() {
                    self.ui.info(
                        &self.name,
                        &format!("hook stdout: {}", String::from_utf8_lossy(&out.stdout)),
                    );
                }
                if !out.stderr.is_empty() {
                    self.ui.info(
                        &self.name,
                        &format!("hook stderr: {}", String::from_utf8_lossy(&out.stderr)),
                    );
                }
                if !out.status.success() {
                    self.ui
                        .warn(&self.name, &format!("hook exited with {}", out.status));
                }
            }
            Err(e) => self
                .ui
                .warn(&self.name, &format!("could not run {}: {}", which, e)),
        }
    }
}
