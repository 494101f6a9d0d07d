use imap::types::Flag;
use std::fmt;

/// A single Maildir flag letter. The discriminants are the ASCII codes, and
/// the slots in `FlagSet` are kept in ASCII order, so rendering a set always
/// yields the canonical sorted, deduplicated form.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum FlagValue {
    NoFlag = 0,
    Draft = 0x44,
    Flagged = 0x46,
    Replied = 0x52,
    Seen = 0x53,
    Trashed = 0x54,
}

/// The set of Maildir flags on one message: D, F, R, S, T.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct FlagSet {
    maildir: [FlagValue; 5],
}

impl FlagSet {
    pub fn new() -> FlagSet {
        FlagSet {
            maildir: [FlagValue::NoFlag; 5],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.maildir.iter().all(|f| *f == FlagValue::NoFlag)
    }

    pub fn contains(&self, other: FlagValue) -> bool {
        self.maildir.iter().any(|f| *f == other)
    }

    /// Changes needed to go from `self` to `other`: `add` holds flags present
    /// in `other` but not `self`, `sub` the reverse.
    pub fn diff(&self, other: FlagSet) -> FlagDiff {
        let mut diff = FlagDiff::new();
        for i in 0..self.maildir.len() {
            match (self.maildir[i], other.maildir[i]) {
                (FlagValue::NoFlag, FlagValue::NoFlag) => (),
                (FlagValue::NoFlag, x) => diff.add.maildir[i] = x,
                (x, FlagValue::NoFlag) => diff.sub.maildir[i] = x,
                _ => (),
            }
        }
        diff
    }

    pub fn union(&self, other: FlagSet) -> FlagSet {
        let mut merged = *self;
        for i in 0..merged.maildir.len() {
            if merged.maildir[i] == FlagValue::NoFlag {
                merged.maildir[i] = other.maildir[i];
            }
        }
        merged
    }

    pub fn subtract(&self, other: FlagSet) -> FlagSet {
        let mut left = *self;
        for i in 0..left.maildir.len() {
            if other.maildir[i] != FlagValue::NoFlag {
                left.maildir[i] = FlagValue::NoFlag;
            }
        }
        left
    }

    /// Flag letters in ASCII order.
    pub fn chars(&self) -> Vec<char> {
        self.to_string().chars().collect()
    }

    pub fn as_imap_flags(&self) -> Option<Vec<Flag<'static>>> {
        let mut res = Vec::with_capacity(self.maildir.len());
        for flag in &self.maildir {
            match *flag {
                FlagValue::NoFlag => (),
                FlagValue::Draft => res.push(Flag::Draft),
                FlagValue::Flagged => res.push(Flag::Flagged),
                FlagValue::Replied => res.push(Flag::Answered),
                FlagValue::Seen => res.push(Flag::Seen),
                FlagValue::Trashed => res.push(Flag::Deleted),
            }
        }
        if !res.is_empty() {
            Some(res)
        } else {
            None
        }
    }
}

impl From<&str> for FlagSet {
    fn from(s: &str) -> FlagSet {
        let mut flags = FlagSet::new();
        for b in s.bytes() {
            match b {
                b'D' => flags.maildir[0] = FlagValue::Draft,
                b'F' => flags.maildir[1] = FlagValue::Flagged,
                b'R' => flags.maildir[2] = FlagValue::Replied,
                b'S' => flags.maildir[3] = FlagValue::Seen,
                b'T' => flags.maildir[4] = FlagValue::Trashed,
                _ => (),
            }
        }
        flags
    }
}

impl From<char> for FlagSet {
    fn from(c: char) -> FlagSet {
        let mut buf = [0u8; 4];
        FlagSet::from(&*c.encode_utf8(&mut buf))
    }
}

impl From<&[Flag<'_>]> for FlagSet {
    fn from(imap_flags: &[Flag]) -> FlagSet {
        let mut flags = FlagSet::new();
        for f in imap_flags {
            match f {
                Flag::Draft => flags.maildir[0] = FlagValue::Draft,
                Flag::Flagged => flags.maildir[1] = FlagValue::Flagged,
                Flag::Answered => flags.maildir[2] = FlagValue::Replied,
                Flag::Seen => flags.maildir[3] = FlagValue::Seen,
                Flag::Deleted => flags.maildir[4] = FlagValue::Trashed,
                _ => (),
            }
        }
        flags
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for flag in &self.maildir {
            match *flag {
                FlagValue::Draft => f.write_str("D")?,
                FlagValue::Flagged => f.write_str("F")?,
                FlagValue::Replied => f.write_str("R")?,
                FlagValue::Seen => f.write_str("S")?,
                FlagValue::Trashed => f.write_str("T")?,
                FlagValue::NoFlag => (),
            }
        }
        Ok(())
    }
}

pub struct FlagDiff {
    pub add: FlagSet,
    pub sub: FlagSet,
}

impl FlagDiff {
    fn new() -> FlagDiff {
        FlagDiff {
            add: FlagSet::new(),
            sub: FlagSet::new(),
        }
    }
}
