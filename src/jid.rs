//! Jabber identifiers (`localpart@domainpart/resourcepart`).
//!
//! Only the structural rules of RFC 7622 are enforced (part presence and
//! length); no stringprep/PRECIS normalization is applied beyond lowercasing
//! the domain.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Maximum size of each JID part in octets (RFC 7622 §3).
const MAX_PART_SIZE: usize = 1023;

/// Reason a string was rejected as a JID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid JID: {0}")]
pub struct BadJid(pub &'static str);

/// A parsed Jabber ID, either bare (`user@example.com`) or full
/// (`user@example.com/phone`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct Jid {
    full: String,
    /// Byte offset of the '@' separator, if there is a localpart.
    at: Option<usize>,
    /// Byte offset of the '/' separator, if there is a resourcepart.
    slash: Option<usize>,
}

impl Jid {
    pub fn new(jid: &str) -> Result<Self, BadJid> {
        let jid = jid.trim();
        // The resource may itself contain '@' and '/', so split on the first '/' only
        let (bare, resource) = match jid.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (jid, None),
        };
        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, bare),
        };

        if let Some(local) = local {
            if local.is_empty() {
                return Err(BadJid("localpart is empty"));
            }
            if local.len() > MAX_PART_SIZE {
                return Err(BadJid("localpart is longer than 1023 octets"));
            }
        }
        let domain = domain.trim_end_matches('.');
        if domain.is_empty() {
            return Err(BadJid("domainpart is empty"));
        }
        if domain.len() > MAX_PART_SIZE {
            return Err(BadJid("domainpart is longer than 1023 octets"));
        }
        if domain.contains('@') {
            return Err(BadJid("domainpart contains '@'"));
        }
        if let Some(resource) = resource {
            if resource.is_empty() {
                return Err(BadJid("resourcepart is empty"));
            }
            if resource.len() > MAX_PART_SIZE {
                return Err(BadJid("resourcepart is longer than 1023 octets"));
            }
        }

        let mut full = String::with_capacity(jid.len());
        let at = local.map(|local| {
            full.push_str(local);
            full.push('@');
            local.len()
        });
        full.push_str(&domain.to_lowercase());
        let slash = resource.map(|resource| {
            let pos = full.len();
            full.push('/');
            full.push_str(resource);
            pos
        });
        Ok(Jid { full, at, slash })
    }

    pub fn full(&self) -> &str {
        &self.full
    }

    /// The JID without its resourcepart.
    pub fn bare(&self) -> &str {
        match self.slash {
            Some(pos) => &self.full[..pos],
            None => &self.full,
        }
    }

    pub fn localpart(&self) -> Option<&str> {
        self.at.map(|pos| &self.full[..pos])
    }

    pub fn domainpart(&self) -> &str {
        let start = self.at.map(|pos| pos + 1).unwrap_or(0);
        let end = self.slash.unwrap_or(self.full.len());
        &self.full[start..end]
    }

    pub fn resourcepart(&self) -> Option<&str> {
        self.slash.map(|pos| &self.full[pos + 1..])
    }

    pub fn is_bare(&self) -> bool {
        self.slash.is_none()
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            full: self.bare().to_string(),
            at: self.at,
            slash: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Result<Jid, BadJid> {
        Jid::new(&format!("{}/{}", self.bare(), resource))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for Jid {
    type Err = BadJid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::new(s)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_jid_parts() {
        let jid = Jid::new("juliet@Example.COM/balcony").unwrap();
        assert_eq!(jid.localpart(), Some("juliet"));
        assert_eq!(jid.domainpart(), "example.com");
        assert_eq!(jid.resourcepart(), Some("balcony"));
        assert_eq!(jid.bare(), "juliet@example.com");
        assert_eq!(jid.full(), "juliet@example.com/balcony");
        assert!(!jid.is_bare());
    }

    #[test]
    fn test_domain_only_jid() {
        let jid = Jid::new("example.com").unwrap();
        assert_eq!(jid.localpart(), None);
        assert_eq!(jid.domainpart(), "example.com");
        assert!(jid.is_bare());
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let jid = Jid::new("a@b.c/d@e/f").unwrap();
        assert_eq!(jid.domainpart(), "b.c");
        assert_eq!(jid.resourcepart(), Some("d@e/f"));
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert_eq!(Jid::new("@example.com"), Err(BadJid("localpart is empty")));
        assert_eq!(Jid::new("user@"), Err(BadJid("domainpart is empty")));
        assert_eq!(
            Jid::new("user@example.com/"),
            Err(BadJid("resourcepart is empty"))
        );
    }

    #[test]
    fn test_with_resource_and_to_bare() {
        let jid = Jid::new("user@example.com").unwrap();
        let full = jid.with_resource("laptop").unwrap();
        assert_eq!(full.full(), "user@example.com/laptop");
        assert_eq!(full.to_bare(), jid);
    }
}
