//! Remote identity resolution.
//!
//! The analyser groups sessions by whatever name a [Resolver] returns, so two
//! addresses resolving to the same hostname share one set of metrics.
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ResolveError {
    #[error("'{0}' is not an IP address")]
    InvalidAddress(String),
}

pub trait Resolver {
    /// Returns the identity sessions to `address:port` are grouped under.
    fn resolve(&mut self, address: &str, port: u16) -> Result<String, ResolveError>;

    /// Resolves and hands `(address, hostname)` to `callback`.
    ///
    /// The default completes before returning; implementations with a real
    /// background lookup may defer the callback.
    fn resolve_async(
        &mut self,
        address: &str,
        port: u16,
        callback: &mut dyn FnMut(&str, &str),
    ) -> Result<(), ResolveError> {
        let hostname = self.resolve(address, port)?;
        callback(address, &hostname);
        Ok(())
    }
}

/// Uses the address itself as the hostname.
#[derive(Debug, Default)]
pub struct AddressResolver;

impl Resolver for AddressResolver {
    fn resolve(&mut self, address: &str, _port: u16) -> Result<String, ResolveError> {
        Ok(address.to_string())
    }
}

/// Reverse DNS through the system resolver, remembered per address.
///
/// Addresses without a PTR record keep their numeric form.
#[derive(Debug, Default)]
pub struct ReverseDnsResolver {
    cache: HashMap<String, String>,
}

impl ReverseDnsResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Resolver for ReverseDnsResolver {
    fn resolve(&mut self, address: &str, _port: u16) -> Result<String, ResolveError> {
        if let Some(hostname) = self.cache.get(address) {
            return Ok(hostname.clone());
        }

        let ip: IpAddr = address
            .parse()
            .map_err(|_| ResolveError::InvalidAddress(address.to_string()))?;

        let hostname = match dns_lookup::lookup_addr(&ip) {
            Ok(hostname) => hostname,
            Err(e) => {
                log::debug!("Reverse lookup of {address} failed: {e}");
                address.to_string()
            }
        };

        log::info!("Resolved {address} to {hostname}");
        self.cache.insert(address.to_string(), hostname.clone());
        Ok(hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_resolver_is_identity() {
        let mut resolver = AddressResolver;
        assert_eq!(resolver.resolve("10.0.0.1", 80), Ok("10.0.0.1".to_string()));
    }

    #[test]
    fn async_resolution_calls_back() {
        let mut resolver = AddressResolver;
        let mut seen = Vec::new();
        resolver
            .resolve_async("10.0.0.1", 80, &mut |address, hostname| {
                seen.push((address.to_string(), hostname.to_string()))
            })
            .unwrap();
        assert_eq!(seen, vec![("10.0.0.1".to_string(), "10.0.0.1".to_string())]);
    }

    #[test]
    fn reverse_dns_rejects_non_ip_input() {
        let mut resolver = ReverseDnsResolver::new();
        assert_eq!(
            resolver.resolve("not-an-ip", 80),
            Err(ResolveError::InvalidAddress("not-an-ip".into()))
        );
    }

    #[test]
    fn reverse_dns_answers_from_cache() {
        let mut resolver = ReverseDnsResolver::new();
        resolver.cache.insert("192.0.2.1".into(), "example.test".into());
        assert_eq!(resolver.resolve("192.0.2.1", 443), Ok("example.test".to_string()));
    }
}
