use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    account: String,
    mailbox: String,
}

/// Collects the mailbox names seen while syncing and writes them out as JSON
/// after every account sync, for consumers like mutt's `mailboxes` line.
pub struct Mbnames {
    path: Option<PathBuf>,
    entries: Mutex<BTreeSet<Entry>>,
}

impl Mbnames {
    pub fn new(path: Option<PathBuf>) -> Mbnames {
        Mbnames {
            path,
            entries: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn add(&self, account: &str, mailbox: &str) {
        self.entries.lock().unwrap().insert(Entry {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
        });
    }

    pub fn write(&self) -> io::Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let entries = self.entries.lock().unwrap();
        let json = serde_json::to_string_pretty(&*entries)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_sorted_unique_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mbnames");
        let mb = Mbnames::new(Some(path.clone()));
        mb.add("personal", "INBOX");
        mb.add("personal", "Archive");
        mb.add("personal", "INBOX");
        mb.write().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        let list = parsed.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["mailbox"], "Archive");
        assert_eq!(list[1]["mailbox"], "INBOX");
    }

    #[test]
    fn no_path_is_a_noop() {
        let mb = Mbnames::new(None);
        mb.add("a", "b");
        mb.write().unwrap();
    }
}
