use anyhow::{anyhow, bail, Context};
use native_tls::Certificate;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;

#[derive(Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
    #[serde(default)]
    pub repositories: HashMap<String, RepoConfig>,
    /// `-f` on the command line: restrict syncing to these untranslated
    /// folder names, overriding folderfilter/folderincludes.
    #[serde(skip)]
    pub folder_restrict: Option<Vec<String>>,
}

#[derive(Deserialize, Clone)]
pub struct General {
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default = "default_maxsyncaccounts")]
    pub maxsyncaccounts: usize,
    #[serde(default)]
    pub socktimeout: u64,
    #[serde(default = "default_true")]
    pub fsync: bool,
    #[serde(default = "default_ui")]
    pub ui: String,
    pub metadata: Option<String>,
    pub mbnames: Option<String>,
}

impl Default for General {
    fn default() -> General {
        General {
            accounts: Vec::new(),
            maxsyncaccounts: default_maxsyncaccounts(),
            socktimeout: 0,
            fsync: true,
            ui: default_ui(),
            metadata: None,
            mbnames: None,
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct AccountConfig {
    pub localrepository: String,
    pub remoterepository: String,
    /// Minutes between syncs; absent or 0 means one-shot.
    pub autorefresh: Option<f64>,
    /// Quick cadence: <0 always quick, 0 never, >0 full sync every Nth cycle.
    #[serde(default)]
    pub quick: i32,
    pub maxage: Option<i64>,
    pub maxsize: Option<u64>,
    pub presynchook: Option<String>,
    pub postsynchook: Option<String>,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum RepoType {
    #[serde(rename = "IMAP")]
    Imap,
    Gmail,
    Maildir,
    Backup,
}

#[derive(Deserialize, Clone)]
pub struct RepoConfig {
    #[serde(rename = "type")]
    pub rtype: RepoType,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_command: Option<String>,
    pub server_ca_path: Option<String>,
    #[serde(default = "default_maxconnections")]
    pub maxconnections: usize,
    #[serde(default)]
    pub holdconnectionopen: bool,
    /// Seconds between keepalive NOOPs while the account sleeps; 0 disables.
    #[serde(default)]
    pub keepalive: u64,
    #[serde(default)]
    pub readonly: bool,
    pub folderfilter: Option<Vec<String>>,
    #[serde(default)]
    pub folderincludes: Vec<String>,
    pub localfolders: Option<String>,
    pub sep: Option<String>,
    #[serde(default)]
    pub restoreatime: bool,
    #[serde(default = "default_true")]
    pub translatecrlf: bool,
}

fn default_maxsyncaccounts() -> usize {
    1
}

fn default_maxconnections() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_ui() -> String {
    "ttyui".to_string()
}

impl RepoConfig {
    pub fn is_remote(&self) -> bool {
        matches!(self.rtype, RepoType::Imap | RepoType::Gmail)
    }

    pub fn server_host(&self) -> anyhow::Result<String> {
        match (&self.server, self.rtype) {
            (Some(s), _) => Ok(s.clone()),
            (None, RepoType::Gmail) => Ok("imap.gmail.com".to_string()),
            _ => Err(anyhow!("remote repository has no server configured")),
        }
    }

    pub fn server_port(&self) -> u16 {
        self.port.unwrap_or(993)
    }

    pub fn sep(&self) -> char {
        self.sep
            .as_ref()
            .and_then(|s| s.chars().next())
            .unwrap_or('/')
    }

    pub fn get_server_ca_cert(&self) -> anyhow::Result<Option<Certificate>> {
        if let Some(ca_path) = &self.server_ca_path {
            let mut certbuf: Vec<u8> = Vec::new();
            let mut certfile = File::open(ca_path)
                .with_context(|| format!("could not open CA file {}", ca_path))?;
            certfile.read_to_end(&mut certbuf)?;
            return Ok(Some(Certificate::from_pem(&certbuf)?));
        }
        Ok(None)
    }
}

impl Config {
    pub fn load(path: &PathBuf, overrides: &[String]) -> anyhow::Result<Config> {
        let mut f = File::open(path)
            .with_context(|| format!("could not open config file {}", path.display()))?;
        let mut buf: String = String::new();
        f.read_to_string(&mut buf)?;
        let mut value: toml::Value = toml::from_str(&buf)
            .with_context(|| format!("could not parse config file {}", path.display()))?;
        for spec in overrides {
            apply_override(&mut value, spec)?;
        }
        let mut config: Config = value.try_into().context("invalid configuration")?;
        for repo in config.repositories.values_mut() {
            repo.resolve_password()?;
        }
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        let mut dir = Config::dir();
        dir.push("config");
        dir
    }

    pub fn dir() -> PathBuf {
        let mut home = match dirs_next::home_dir() {
            Some(path) => path,
            _ => PathBuf::from(""),
        };
        home.push(".brant");
        home
    }

    pub fn metadata_dir(&self) -> PathBuf {
        match &self.general.metadata {
            Some(dir) => expand_home(dir),
            None => Config::dir(),
        }
    }

    pub fn account(&self, name: &str) -> anyhow::Result<&AccountConfig> {
        self.accounts.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.accounts.keys().map(|k| k.as_str()).collect();
            anyhow!(
                "the account \"{}\" does not exist; valid accounts are: {}",
                name,
                known.join(", ")
            )
        })
    }

    pub fn repository(&self, name: &str) -> anyhow::Result<&RepoConfig> {
        self.repositories
            .get(name)
            .ok_or_else(|| anyhow!("the repository \"{}\" does not exist", name))
    }

    /// Accounts to run this invocation: `-a` wins over `general.accounts`.
    pub fn active_accounts(&self, cli: Option<&str>) -> anyhow::Result<Vec<String>> {
        let list: Vec<String> = match cli {
            Some(csv) => csv.split(',').map(|s| s.trim().to_string()).collect(),
            None => self.general.accounts.clone(),
        };
        if list.is_empty() {
            bail!("no accounts selected; set general.accounts or pass -a");
        }
        let mut active = Vec::new();
        for name in list {
            self.account(&name)?;
            if !active.contains(&name) {
                active.push(name);
            }
        }
        Ok(active)
    }
}

impl RepoConfig {
    fn resolve_password(&mut self) -> anyhow::Result<()> {
        if !self.is_remote() || self.password.is_some() {
            return Ok(());
        }
        if let Some(cmd) = self.password_command.clone() {
            let output = Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .output()
                .with_context(|| format!("could not execute password_command {}", cmd))?;
            self.password = Some(
                String::from_utf8(output.stdout)
                    .context("password_command output was not utf-8")?
                    .trim()
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Apply a `-k [section:]option=value` override onto the parsed TOML tree.
/// The section `accounts_personal` addresses `[accounts.personal]`; a bare
/// option lands in `[general]`.
fn apply_override(root: &mut toml::Value, spec: &str) -> anyhow::Result<()> {
    let eq = spec
        .find('=')
        .ok_or_else(|| anyhow!("bad override \"{}\": expected [section:]option=value", spec))?;
    let (key, raw) = (&spec[..eq], &spec[eq + 1..]);
    let (section, option) = match key.find(':') {
        Some(colon) => (&key[..colon], &key[colon + 1..]),
        None => ("general", key),
    };

    let table = root
        .as_table_mut()
        .ok_or_else(|| anyhow!("configuration is not a table"))?;
    let target = match section.find('_') {
        None => table
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(Default::default())),
        Some(us) => {
            let (group, name) = (&section[..us], &section[us + 1..]);
            table
                .entry(group.to_string())
                .or_insert_with(|| toml::Value::Table(Default::default()))
                .as_table_mut()
                .ok_or_else(|| anyhow!("config section {} is not a table", group))?
                .entry(name.to_string())
                .or_insert_with(|| toml::Value::Table(Default::default()))
        }
    };
    target
        .as_table_mut()
        .ok_or_else(|| anyhow!("config section {} is not a table", section))?
        .insert(option.to_string(), parse_scalar(raw));
    Ok(())
}

fn parse_scalar(raw: &str) -> toml::Value {
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    toml::Value::String(raw.to_string())
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(mut home) = dirs_next::home_dir() {
            home.push(rest);
            return home;
        }
    }
    PathBuf::from(path)
}
