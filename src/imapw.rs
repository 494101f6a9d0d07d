use crate::config::RepoConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use imap::types::{Fetch, Flag, Name, Uid, ZeroCopy};
use imap::Client;
use imap::Session;
use imap_proto::types::Capability;
use native_tls::TlsConnector;
use native_tls::TlsStream;
use std::collections::HashSet;
use std::convert::From;
use std::net::{TcpStream, ToSocketAddrs};
use std::ops::Deref;
use std::time::Duration;
use std::vec::Vec;

pub enum FetchResult<'a> {
    Uid(UidResult<'a>),
    Other(&'a Fetch),
}

#[derive(Debug)]
pub struct UidResult<'a> {
    fetch: &'a Fetch,
}

impl<'a> UidResult<'a> {
    pub fn uid(&self) -> Uid {
        self.fetch.uid.unwrap()
    }
    pub fn flags(&self) -> &[Flag] {
        self.fetch.flags()
    }
    pub fn internal_date_secs(&self) -> Option<i64> {
        self.fetch.internal_date().map(|d| d.timestamp())
    }
}

impl<'a> From<&'a Fetch> for FetchResult<'a> {
    fn from(fetch: &'a Fetch) -> FetchResult<'a> {
        if fetch.uid.is_some() {
            FetchResult::Uid(UidResult { fetch })
        } else {
            FetchResult::Other(fetch)
        }
    }
}

/// State of the currently selected mailbox.
pub struct Selected {
    pub name: String,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
    pub exists: u32,
}

pub struct Imap {
    session: Session<TlsStream<TcpStream>>,
    mailbox: Option<Selected>,
}

impl Imap {
    pub fn connect(config: &RepoConfig, socktimeout: u64) -> SyncResult<Imap> {
        let host = config
            .server_host()
            .map_err(|e| SyncError::critical(ErrorKind::Config(e.to_string())))?;
        let port = config.server_port();
        let username = config.username.as_deref().ok_or_else(|| {
            SyncError::critical(ErrorKind::Config("no username configured".to_string()))
        })?;
        let password = config.password.as_deref().ok_or_else(|| {
            SyncError::critical(ErrorKind::Config("no password configured".to_string()))
        })?;

        if socktimeout > 0 {
            Imap::preflight(&host, port, socktimeout)?;
        }

        let mut tlsconnector = TlsConnector::builder();
        if let Some(cert) = config
            .get_server_ca_cert()
            .map_err(|e| SyncError::critical(ErrorKind::Config(e.to_string())))?
        {
            tlsconnector.add_root_certificate(cert);
        }
        let tls = tlsconnector.build()?;

        let client: Client<TlsStream<TcpStream>> =
            imap::connect((host.as_str(), port), host.as_str(), &tls)?;
        let mut session = client.login(username, password).map_err(|(e, _)| e)?;

        // UID EXPUNGE is how pass 2 deletes without clobbering other clients'
        // \Deleted marks, so UIDPLUS is not optional.
        let capabilities = session.capabilities()?;
        if !capabilities.deref().has(&Capability::Atom("UIDPLUS")) {
            return Err(SyncError::repo(ErrorKind::MissingCapability("UIDPLUS")));
        }

        Ok(Imap {
            session,
            mailbox: None,
        })
    }

    /// Fail fast when the server is unreachable instead of waiting out the
    /// operating system's connect timeout.
    fn preflight(host: &str, port: u16, socktimeout: u64) -> SyncResult<()> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| SyncError::repo(ErrorKind::Io(e)))?
            .next()
            .ok_or_else(|| {
                SyncError::repo(ErrorKind::Other(format!("could not resolve {}", host)))
            })?;
        TcpStream::connect_timeout(&addr, Duration::from_secs(socktimeout))
            .map_err(|e| SyncError::repo(ErrorKind::Io(e)))?;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn debug(&mut self, enable: bool) {
        self.session.debug = enable;
    }

    pub fn list(&mut self) -> SyncResult<ZeroCopy<Vec<Name>>> {
        Ok(self.session.list(None, Some("*"))?)
    }

    pub fn create(&mut self, mailbox: &str) -> SyncResult<()> {
        Ok(self.session.create(mailbox)?)
    }

    pub fn select_mailbox(&mut self, mailbox: &str) -> SyncResult<&Selected> {
        match &self.mailbox {
            Some(sel) if sel.name == mailbox => (),
            _ => {
                let mbox = self
                    .session
                    .select(mailbox)
                    .map_err(|e| SyncError::folder(ErrorKind::Imap(e)))?;
                self.mailbox = Some(Selected {
                    name: mailbox.to_string(),
                    uid_validity: mbox.uid_validity,
                    uid_next: mbox.uid_next,
                    exists: mbox.exists,
                });
            }
        }
        Ok(self.mailbox.as_ref().unwrap())
    }

    /// UID, flags and internal date for every message in the selected
    /// mailbox. An empty mailbox skips the round trip: `1:*` on nothing is an
    /// error on some servers.
    pub fn fetch_meta_all(&mut self) -> SyncResult<Option<ZeroCopy<Vec<Fetch>>>> {
        match &self.mailbox {
            Some(sel) if sel.exists == 0 => Ok(None),
            Some(_) => Ok(Some(
                self.session.uid_fetch("1:*", "(UID FLAGS INTERNALDATE)")?,
            )),
            None => Err(SyncError::repo(ErrorKind::Other(
                "no mailbox selected".to_string(),
            ))),
        }
    }

    pub fn fetch_body(&mut self, uid: u32) -> SyncResult<ZeroCopy<Vec<Fetch>>> {
        Ok(self
            .session
            .uid_fetch(format!("{}", uid), "(UID BODY.PEEK[])")?)
    }

    pub fn append(&mut self, body: &[u8], flags: &[Flag]) -> SyncResult<()> {
        let mailbox = match &self.mailbox {
            Some(sel) => sel.name.clone(),
            None => {
                return Err(SyncError::repo(ErrorKind::Other(
                    "no mailbox selected".to_string(),
                )))
            }
        };
        Ok(self
            .session
            .append(&mailbox, body)
            .flags(flags.iter().cloned())
            .finish()?)
    }

    pub fn uid_search(&mut self, query: &str) -> SyncResult<HashSet<Uid>> {
        Ok(self.session.uid_search(query)?)
    }

    /// Remember where the UID sequence stood after we learned an appended
    /// message's UID, so consecutive appends stay unambiguous.
    pub fn note_uid_next(&mut self, uid_next: u32) {
        if let Some(sel) = &mut self.mailbox {
            match sel.uid_next {
                Some(n) if n >= uid_next => (),
                _ => sel.uid_next = Some(uid_next),
            }
        }
    }

    pub fn add_flags_for_uids(&mut self, uids: &[Uid], flags: &[Flag]) -> SyncResult<()> {
        self.session
            .uid_store(uid_set(uids), format!("+FLAGS ({})", flag_list(flags)))
            .map(|_| ())
            .map_err(SyncError::from)
    }

    pub fn remove_flags_for_uids(&mut self, uids: &[Uid], flags: &[Flag]) -> SyncResult<()> {
        self.session
            .uid_store(uid_set(uids), format!("-FLAGS ({})", flag_list(flags)))
            .map(|_| ())
            .map_err(SyncError::from)
    }

    pub fn set_flags_for_uid(&mut self, uid: Uid, flags: &[Flag]) -> SyncResult<()> {
        self.session
            .uid_store(format!("{}", uid), format!("FLAGS ({})", flag_list(flags)))
            .map(|_| ())
            .map_err(SyncError::from)
    }

    pub fn delete_uids(&mut self, uids: &[Uid]) -> SyncResult<()> {
        let set = uid_set(uids);
        self.session
            .uid_store(&set, "+FLAGS (\\Deleted)".to_string())?;
        self.session.uid_expunge(&set)?;
        Ok(())
    }

    pub fn noop(&mut self) -> SyncResult<()> {
        Ok(self.session.noop()?)
    }

    pub fn logout(&mut self) {
        self.session.logout().ok();
    }
}

fn uid_set(uids: &[Uid]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

fn flag_list(flags: &[Flag]) -> String {
    flags
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<String>>()
        .join(" ")
}
