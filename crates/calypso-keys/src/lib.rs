//! Calypso Keys - Session key references and KVC authorization
//!
//! This crate holds the terminal-side key configuration used when opening a
//! secure session: which key (KIF/KVC) the SAM should use for each access
//! level, and which key versions the terminal accepts from a card.
//!
//! The defaults are embedded from `session-keys.txt`; a terminal can load its
//! own table with [`KeyTable::parse`].

use thiserror::Error;

/// Errors raised while parsing a key table
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyTableError {
    #[error("line {line}: expected LEVEL<TAB>KIF<TAB>KVC or KVC<TAB>value")]
    MissingField { line: usize },

    #[error("line {line}: unknown access level {level:?}")]
    UnknownLevel { line: usize, level: String },

    #[error("line {line}: invalid hex byte {value:?}")]
    InvalidByte { line: usize, value: String },
}

/// Session access level, selecting the key family used by the SAM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    Personalization,
    Load,
    Debit,
}

impl AccessLevel {
    /// Key record number sent in P1 of the Open Secure Session command
    pub fn key_index(self) -> u8 {
        match self {
            AccessLevel::Personalization => 0x01,
            AccessLevel::Load => 0x02,
            AccessLevel::Debit => 0x03,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "PERSO" => Some(AccessLevel::Personalization),
            "LOAD" => Some(AccessLevel::Load),
            "DEBIT" => Some(AccessLevel::Debit),
            _ => None,
        }
    }
}

/// Key reference (Key Identifier + Key Version) as understood by the SAM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyReference {
    pub kif: u8,
    pub kvc: u8,
}

/// Which KVCs returned by the card at session opening are acceptable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KvcPolicy {
    /// Any key version is accepted
    #[default]
    AllowAll,
    /// Only the listed key versions are accepted
    AllowList(Vec<u8>),
}

impl KvcPolicy {
    pub fn is_authorized(&self, kvc: u8) -> bool {
        match self {
            KvcPolicy::AllowAll => true,
            KvcPolicy::AllowList(allowed) => allowed.contains(&kvc),
        }
    }
}

/// Default key references per access level plus the authorized KVC list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyTable {
    perso: Option<KeyReference>,
    load: Option<KeyReference>,
    debit: Option<KeyReference>,
    authorized_kvcs: Vec<u8>,
}

fn parse_byte(value: &str, line: usize) -> Result<u8, KeyTableError> {
    u8::from_str_radix(value.trim(), 16).map_err(|_| KeyTableError::InvalidByte {
        line,
        value: value.to_string(),
    })
}

impl KeyTable {
    /// The table embedded in this crate
    pub fn embedded() -> Self {
        let data = include_str!("../session-keys.txt");
        // Checked by test_embedded_table_has_all_levels
        Self::parse(data).unwrap_or_default()
    }

    /// Parse a tab-separated key table
    ///
    /// Format, one entry per line, `#` starts a comment:
    /// - `PERSO|LOAD|DEBIT <TAB> KIF <TAB> KVC` (hex bytes)
    /// - `KVC <TAB> value` adds an authorized key version
    pub fn parse(data: &str) -> Result<Self, KeyTableError> {
        let mut table = KeyTable::default();

        for (index, line) in data.lines().enumerate() {
            let line_no = index + 1;
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split('\t').collect();
            if parts[0] == "KVC" {
                let value = parts.get(1).ok_or(KeyTableError::MissingField { line: line_no })?;
                table.authorized_kvcs.push(parse_byte(value, line_no)?);
                continue;
            }

            if parts.len() < 3 {
                return Err(KeyTableError::MissingField { line: line_no });
            }

            let level = AccessLevel::from_label(parts[0]).ok_or_else(|| {
                KeyTableError::UnknownLevel {
                    line: line_no,
                    level: parts[0].to_string(),
                }
            })?;
            let key = KeyReference {
                kif: parse_byte(parts[1], line_no)?,
                kvc: parse_byte(parts[2], line_no)?,
            };
            table.set_key(level, key);
        }

        Ok(table)
    }

    /// Set the default key for an access level
    pub fn set_key(&mut self, level: AccessLevel, key: KeyReference) {
        match level {
            AccessLevel::Personalization => self.perso = Some(key),
            AccessLevel::Load => self.load = Some(key),
            AccessLevel::Debit => self.debit = Some(key),
        }
    }

    /// Get the default key reference for an access level
    pub fn key(&self, level: AccessLevel) -> Option<KeyReference> {
        match level {
            AccessLevel::Personalization => self.perso,
            AccessLevel::Load => self.load,
            AccessLevel::Debit => self.debit,
        }
    }

    /// KVC policy derived from the `KVC` lines (none listed means any KVC)
    pub fn kvc_policy(&self) -> KvcPolicy {
        if self.authorized_kvcs.is_empty() {
            KvcPolicy::AllowAll
        } else {
            KvcPolicy::AllowList(self.authorized_kvcs.clone())
        }
    }
}

/// Get the embedded default key reference for an access level
pub fn get_session_key(level: AccessLevel) -> Option<KeyReference> {
    KeyTable::embedded().key(level)
}
