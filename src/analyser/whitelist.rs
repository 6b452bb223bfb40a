//! Admission policy for remotes that have not been seen before.
use std::collections::HashSet;
use std::{fs, io, path::Path};

pub trait Whitelist {
    fn allow(&self, address: &str, port: u16) -> bool;
}

/// Admits every remote.
#[derive(Debug, Default)]
pub struct AllowAll;

impl Whitelist for AllowAll {
    fn allow(&self, _address: &str, _port: u16) -> bool {
        true
    }
}

/// Admits a fixed set of addresses, on any port.
#[derive(Debug, Default, Clone)]
pub struct StaticWhitelist {
    allowed: HashSet<String>,
}

impl StaticWhitelist {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: addresses.into_iter().map(Into::into).collect(),
        }
    }

    /// Loads one address per line. Blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(Self::new(
            contents
                .lines()
                .map(|line| line.split('#').next().unwrap_or("").trim())
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        ))
    }

    pub fn extend<I, S>(&mut self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed.extend(addresses.into_iter().map(Into::into));
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl Whitelist for StaticWhitelist {
    fn allow(&self, address: &str, _port: u16) -> bool {
        self.allowed.contains(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_list_matches_address_only() {
        let whitelist = StaticWhitelist::new(["10.0.0.1"]);
        assert!(whitelist.allow("10.0.0.1", 80));
        assert!(whitelist.allow("10.0.0.1", 443));
        assert!(!whitelist.allow("10.0.0.2", 80));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("trtop-whitelist-{}", std::process::id()));
        fs::write(&path, "# upstreams\n10.0.0.1\n\n10.0.0.2  # cache\n").unwrap();

        let whitelist = StaticWhitelist::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.allow("10.0.0.2", 80));
        assert!(!whitelist.allow("# upstreams", 80));
    }
}
