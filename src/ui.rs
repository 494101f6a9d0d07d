use chrono::prelude::*;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Sink for everything the engine wants a human to see. Lines go to
/// stdout/stderr with a local timestamp, and are mirrored to a log file when
/// one is configured. The quiet backend drops informational lines from the
/// terminal but keeps warnings and the log file. Debug output is gated per
/// category (imap, maildir, thread).
pub struct Ui {
    logfile: Option<Mutex<File>>,
    debug: HashSet<String>,
    quiet: bool,
}

impl Ui {
    pub fn new(logfile: Option<&Path>, debug: &[String], quiet: bool) -> std::io::Result<Ui> {
        let logfile = match logfile {
            Some(path) => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };
        Ok(Ui {
            logfile,
            debug: debug.iter().map(|d| d.trim().to_string()).collect(),
            quiet,
        })
    }

    fn stamp() -> String {
        Local::now().format("%Y-%m-%d %H:%M:%S.%f").to_string()
    }

    fn tee(&self, line: &str) {
        if let Some(f) = &self.logfile {
            if let Ok(mut f) = f.lock() {
                writeln!(f, "{}", line).ok();
            }
        }
    }

    pub fn info(&self, ctx: &str, msg: &str) {
        let line = format!("{} {}: {}", Ui::stamp(), ctx, msg);
        if !self.quiet {
            println!("{}", line);
        }
        self.tee(&line);
    }

    pub fn warn(&self, ctx: &str, msg: &str) {
        let line = format!("{} {}: {}", Ui::stamp(), ctx, msg);
        eprintln!("{}", line);
        self.tee(&line);
    }

    pub fn debugging(&self, category: &str) -> bool {
        self.debug.contains(category)
    }

    pub fn debug(&self, category: &str, ctx: &str, msg: &str) {
        if self.debugging(category) {
            self.info(ctx, msg);
        }
    }

    // Semantic events emitted by the sync engine.

    pub fn copying_message(&self, account: &str, uid: i64, src: &str, dst: &str) {
        self.info(account, &format!("Copy message {} {} -> {}", uid, src, dst));
    }

    pub fn deleting_messages(&self, account: &str, uids: &[i64], dst: &str) {
        self.info(
            account,
            &format!("Deleting {} messages on {}: {:?}", uids.len(), dst, uids),
        );
    }

    pub fn adding_flags(&self, account: &str, uids: &[i64], flag: char, dst: &str) {
        self.info(
            account,
            &format!("Adding flag {} to {} messages on {}", flag, uids.len(), dst),
        );
    }

    pub fn deleting_flags(&self, account: &str, uids: &[i64], flag: char, dst: &str) {
        self.info(
            account,
            &format!(
                "Removing flag {} from {} messages on {}",
                flag,
                uids.len(),
                dst
            ),
        );
    }

    pub fn skipping_folder(&self, account: &str, folder: &str) {
        self.info(account, &format!("Skipping {} (quick, no changes)", folder));
    }

    pub fn syncing_folder(&self, account: &str, folder: &str) {
        self.info(account, &format!("Syncing {}", folder));
    }

    pub fn sleeping(&self, account: &str, secs: u64) {
        self.info(account, &format!("Sleeping {}s until next refresh", secs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_categories_gate_output() {
        let ui = Ui::new(None, &["imap".to_string()], false).unwrap();
        assert!(ui.debugging("imap"));
        assert!(!ui.debugging("maildir"));
    }

    #[test]
    fn log_file_mirrors_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let ui = Ui::new(Some(&path), &[], false).unwrap();
        ui.info("test", "hello");
        ui.warn("test", "oops");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("test: hello"));
        assert!(text.contains("test: oops"));
    }

    #[test]
    fn quiet_backend_still_logs_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let ui = Ui::new(Some(&path), &[], true).unwrap();
        ui.info("test", "hello");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("test: hello"));
    }
}
