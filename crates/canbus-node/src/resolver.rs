//! Name resolution -- host names to bus addresses, object names to ids.
//!
//! Host file:   `c,m,n hostname`   (hex address)
//! Object file: `hexid NAME`
//! `#` starts a comment; blank lines are ignored. Missing files resolve to
//! empty tables.

use std::collections::BTreeMap;
use std::path::Path;

use canbus_protocol::{objects, NodeAddress};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("unknown host: {0}")]
    UnknownHost(String),
    #[error("unknown object: {0}")]
    UnknownObject(String),
}

fn read_optional(path: &Path) -> Result<String, ResolveError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "name file missing, using empty table");
            Ok(String::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Non-comment lines as (1-based line number, first field, second field).
fn records(text: &str) -> impl Iterator<Item = (usize, &str, Option<&str>)> {
    text.lines().enumerate().filter_map(|(i, line)| {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            return None;
        }
        let mut fields = line.split_whitespace();
        let first = fields.next()?;
        Some((i + 1, first, fields.next()))
    })
}

// ============================================================================
// Hosts
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct HostTable {
    entries: Vec<(NodeAddress, String)>,
}

impl HostTable {
    pub fn parse(text: &str) -> Result<Self, ResolveError> {
        let mut entries = Vec::new();
        for (line, addr, name) in records(text) {
            let address = addr.parse::<NodeAddress>().map_err(|e| ResolveError::Parse {
                line,
                reason: e.to_string(),
            })?;
            let name = name.ok_or_else(|| ResolveError::Parse {
                line,
                reason: "missing host name".into(),
            })?;
            entries.push((address, name.to_string()));
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, ResolveError> {
        Self::parse(&read_optional(path)?)
    }

    pub fn lookup(&self, name: &str) -> Option<NodeAddress> {
        self.entries
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(a, _)| *a)
    }

    pub fn name_of(&self, address: &NodeAddress) -> Option<&str> {
        self.entries
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, n)| n.as_str())
    }

    /// A literal `c,m,n` or a host name.
    pub fn resolve(&self, arg: &str) -> Result<NodeAddress, ResolveError> {
        if let Ok(address) = arg.parse::<NodeAddress>() {
            return Ok(address);
        }
        self.lookup(arg)
            .ok_or_else(|| ResolveError::UnknownHost(arg.to_string()))
    }

    /// Host name if known, else the address itself.
    pub fn display(&self, address: &NodeAddress) -> String {
        self.name_of(address)
            .map_or_else(|| address.to_string(), str::to_string)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeAddress, &str)> {
        self.entries.iter().map(|(a, n)| (a, n.as_str()))
    }
}

// ============================================================================
// Objects
// ============================================================================

/// File entries take precedence over the built-in names.
#[derive(Debug, Clone, Default)]
pub struct ObjectTable {
    entries: BTreeMap<u16, String>,
}

impl ObjectTable {
    pub fn parse(text: &str) -> Result<Self, ResolveError> {
        let mut entries = BTreeMap::new();
        for (line, id, name) in records(text) {
            let id = parse_hex(id)
                .filter(|id| *id <= 0x3ff)
                .ok_or_else(|| ResolveError::Parse {
                    line,
                    reason: format!("bad object id {id:?}"),
                })?;
            let name = name.ok_or_else(|| ResolveError::Parse {
                line,
                reason: "missing object name".into(),
            })?;
            entries.insert(id, name.to_string());
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, ResolveError> {
        Self::parse(&read_optional(path)?)
    }

    pub fn lookup(&self, name: &str) -> Option<u16> {
        self.entries
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(id, _)| *id)
            .or_else(|| objects::builtin_id(name))
    }

    pub fn name_of(&self, id: u16) -> Option<&str> {
        self.entries
            .get(&id)
            .map(String::as_str)
            .or_else(|| objects::builtin_name(id))
    }

    /// An object name, or a hex id.
    pub fn resolve(&self, arg: &str) -> Result<u16, ResolveError> {
        self.lookup(arg)
            .or_else(|| parse_hex(arg).filter(|id| *id <= 0x3ff))
            .ok_or_else(|| ResolveError::UnknownObject(arg.to_string()))
    }

    pub fn display(&self, id: u16) -> String {
        self.name_of(id)
            .map_or_else(|| format!("{id:#05x}"), str::to_string)
    }

    /// Every known id and name, file entries merged over built-ins.
    pub fn all(&self) -> BTreeMap<u16, String> {
        let mut all: BTreeMap<u16, String> = objects::BUILTIN
            .iter()
            .map(|(id, name)| (*id, name.to_string()))
            .collect();
        all.extend(self.entries.iter().map(|(id, n)| (*id, n.clone())));
        all
    }
}

fn parse_hex(s: &str) -> Option<u16> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(digits, 16).ok()
}
