extern crate anyhow;
extern crate chrono;
extern crate clap;
extern crate dirs_next;
extern crate filetime;
extern crate imap;
extern crate imap_proto;
extern crate libc;
extern crate md5;
extern crate native_tls;
extern crate once_cell;
extern crate regex;
extern crate serde;
extern crate serde_json;
extern crate thiserror;
extern crate toml;
#[macro_use]
extern crate serde_derive;

mod config;
mod error;
mod flags;
mod folder;
mod imapw;
mod mbnames;
mod pool;
mod repos;
mod signals;
mod syncaccount;
mod syncfolder;
mod ui;

use clap::Parser;
use config::{expand_home, Config};
use mbnames::Mbnames;
use pool::{spawn_limited, Event, Limits};
use std::fs;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use syncaccount::Account;
use ui::Ui;

#[derive(Parser)]
#[command(
    name = "brant",
    version,
    about = "Bidirectional IMAP / Maildir synchronization program"
)]
struct Args {
    /// Disable all multithreading and sync accounts serially
    #[arg(short = '1', long = "single-thread")]
    singlethreading: bool,

    /// Run only once, ignoring any autorefresh setting
    #[arg(short = 'o', long = "once")]
    runonce: bool,

    /// Run only quick synchronizations
    #[arg(short = 'q', long = "quick")]
    quick: bool,

    /// Comma list of accounts to sync, overriding the config file
    #[arg(short = 'a', long = "accounts")]
    accounts: Option<String>,

    /// Configuration file to use
    #[arg(short = 'c', long = "config")]
    configfile: Option<PathBuf>,

    /// Only sync these folders (untranslated names, comma separated)
    #[arg(short = 'f', long = "folders")]
    folders: Option<String>,

    /// Override a config option: [section:]option=value
    #[arg(short = 'k', long = "option", value_name = "SECTION:OPTION=VALUE")]
    overrides: Vec<String>,

    /// Log to FILE as well as the terminal
    #[arg(short = 'l', long = "logfile")]
    logfile: Option<PathBuf>,

    /// User interface backend, overriding the config file
    #[arg(short = 'u', long = "ui")]
    interface: Option<String>,

    /// Debug categories: imap, maildir, thread, or all
    #[arg(short = 'd', long = "debug")]
    debugtype: Option<String>,
}

const UI_LIST: &[&str] = &["ttyui", "quiet"];

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let configpath = args.configfile.clone().unwrap_or_else(Config::default_path);
    let mut config = match Config::load(&configpath, &args.overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return 1;
        }
    };

    if args.runonce {
        for acct in config.accounts.values_mut() {
            acct.autorefresh = None;
        }
    }
    if args.quick {
        for acct in config.accounts.values_mut() {
            acct.quick = -1;
        }
    }
    if let Some(folders) = &args.folders {
        config.folder_restrict =
            Some(folders.split(',').map(|s| s.trim().to_string()).collect());
    }

    // Debug output interleaves opaquely across threads, so any category
    // other than a lone "thread" forces single-threaded operation.
    let mut singlethreading = args.singlethreading;
    let mut debug: Vec<String> = Vec::new();
    if let Some(types) = &args.debugtype {
        let types = if types.eq_ignore_ascii_case("all") {
            "imap,maildir,thread".to_string()
        } else {
            types.clone()
        };
        debug = types.split(',').map(|s| s.trim().to_string()).collect();
        if !singlethreading && !(debug.len() == 1 && debug[0] == "thread") {
            eprintln!("debug mode: forcing single-threaded");
            singlethreading = true;
        }
    }

    let ui_type = args
        .interface
        .clone()
        .unwrap_or_else(|| config.general.ui.clone());
    if !UI_LIST.contains(&ui_type.as_str()) {
        eprintln!(
            "UI '{}' does not exist, choose one of: {}",
            ui_type,
            UI_LIST.join(", ")
        );
        return 1;
    }

    let ui = match Ui::new(args.logfile.as_deref(), &debug, ui_type == "quiet") {
        Ok(ui) => Arc::new(ui),
        Err(e) => {
            eprintln!("could not open log file: {}", e);
            return 1;
        }
    };

    let active = match config.active_accounts(args.accounts.as_deref()) {
        Ok(active) => active,
        Err(e) => {
            ui.warn("brant", &e.to_string());
            return 1;
        }
    };

    let metadata = config.metadata_dir();
    if let Err(e) = fs::create_dir_all(&metadata) {
        ui.warn(
            "brant",
            &format!("could not create {}: {}", metadata.display(), e),
        );
        return 1;
    }

    // One instance per metadata directory.
    let _lockfile = match lock(&metadata) {
        Ok(f) => f,
        Err(e) => {
            ui.warn(
                "brant",
                &format!(
                    "could not lock {}: {}; is another instance running?",
                    metadata.join("lock").display(),
                    e
                ),
            );
            return 1;
        }
    };
    fs::write(metadata.join("pid"), format!("{}\n", std::process::id())).ok();

    signals::install();

    let limits = Arc::new(Limits::new());
    limits.init(
        "ACCOUNTLIMIT",
        if singlethreading {
            1
        } else {
            config.general.maxsyncaccounts
        },
    );
    for (name, repo) in &config.repositories {
        let bound = if singlethreading { 1 } else { repo.maxconnections };
        limits.init(&format!("FOLDER_{}", name), bound);
        limits.init(&format!("MSGCOPY_{}", name), bound);
    }

    let abort = Arc::new(Event::new());
    let mbnames = Arc::new(Mbnames::new(
        config.general.mbnames.as_deref().map(expand_home),
    ));

    let config = Arc::new(config);
    let mut accounts = Vec::new();
    for name in &active {
        match Account::new(
            name,
            Arc::clone(&config),
            Arc::clone(&ui),
            Arc::clone(&limits),
            Arc::clone(&abort),
            Arc::clone(&mbnames),
        ) {
            Ok(account) => accounts.push(account),
            Err(e) => {
                ui.warn(name, &e.to_string());
                return 1;
            }
        }
    }

    signals::monitor(
        Arc::clone(&ui),
        Arc::clone(&abort),
        accounts
            .iter()
            .map(|a| Arc::clone(&a.skip_sleep))
            .collect(),
    );

    let mut failed = false;
    if singlethreading {
        for mut account in accounts {
            if let Err(e) = account.sync_runner() {
                ui.warn(&account.name, &format!("sync exited with error: {}", e));
                failed = true;
            }
        }
    } else {
        let mut threads = Vec::new();
        for account in accounts {
            let name = account.name.clone();
            let handle = spawn_limited(
                &limits,
                "ACCOUNTLIMIT",
                format!("Account sync {}", name),
                move || {
                    let mut account = account;
                    account.sync_runner()
                },
            );
            match handle {
                Ok(handle) => threads.push((name, handle)),
                Err(e) => {
                    ui.warn(&name, &format!("could not spawn account thread: {}", e));
                    failed = true;
                }
            }
        }
        for (name, thread) in threads {
            match thread.join() {
                Ok(Ok(())) => (),
                Ok(Err(e)) => {
                    ui.warn(&name, &format!("sync exited with error: {}", e));
                    failed = true;
                }
                Err(_) => {
                    ui.warn(&name, "account thread panicked");
                    failed = true;
                }
            }
        }
    }

    if failed {
        1
    } else {
        0
    }
}

fn lock(metadata: &Path) -> io::Result<File> {
    let f = File::create(metadata.join("lock"))?;
    let rc = unsafe { libc::flock(f.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(f)
}
