use std::net::{IpAddr, SocketAddr};

use crate::error::CoreError;
use crate::role::Role;

/// A single bound endpoint: where the server listens, and the IP it should
/// claim to be reachable at in outbound attributes (these differ behind a
/// 1:1 NAT in front of the server itself).
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub role: Role,
    pub bind_addr: SocketAddr,
    pub advertised_ip: IpAddr,
    pub valid: bool,
}

impl Endpoint {
    /// The address this endpoint is reachable at, combining the advertised
    /// IP with the bind port.
    pub fn advertised_addr(&self) -> SocketAddr {
        SocketAddr::new(self.advertised_ip, self.bind_addr.port())
    }
}

/// Fixed `Role -> Endpoint` mapping, built once at `Supervisor::initialize`
/// and shared read-only by every dispatch loop for the rest of the process
/// lifetime.
#[derive(Debug, Clone)]
pub struct TransportAddressSet {
    entries: [Endpoint; 4],
}

impl TransportAddressSet {
    pub fn new(entries: [Endpoint; 4]) -> Result<Self, CoreError> {
        let tsa = Self { entries };
        tsa.validate()?;
        Ok(tsa)
    }

    fn validate(&self) -> Result<(), CoreError> {
        let pp = self.lookup(Role::Pp);
        let pa = self.lookup(Role::Pa);
        let ap = self.lookup(Role::Ap);
        let aa = self.lookup(Role::Aa);

        for ep in [pp, pa, ap, aa] {
            if ep.valid && ep.advertised_ip.is_ipv4() != ep.bind_addr.is_ipv4() {
                return Err(CoreError::ConfigInvalid(format!(
                    "endpoint {:?} has mismatched address families",
                    ep.role
                )));
            }
        }

        if pp.valid && ap.valid && pp.bind_addr.port() != ap.bind_addr.port() {
            return Err(CoreError::ConfigInvalid("PP and AP ports must match".into()));
        }
        if pa.valid && aa.valid && pa.bind_addr.port() != aa.bind_addr.port() {
            return Err(CoreError::ConfigInvalid("PA and AA ports must match".into()));
        }
        if pp.valid && pa.valid && pp.bind_addr.ip() != pa.bind_addr.ip() {
            return Err(CoreError::ConfigInvalid("PP and PA IPs must match".into()));
        }
        if ap.valid && aa.valid && ap.bind_addr.ip() != aa.bind_addr.ip() {
            return Err(CoreError::ConfigInvalid("AP and AA IPs must match".into()));
        }

        Ok(())
    }

    pub fn lookup(&self, role: Role) -> &Endpoint {
        &self.entries[role.index()]
    }

    pub fn valid_roles(&self) -> impl Iterator<Item = Role> + '_ {
        Role::ALL.into_iter().filter(move |r| self.lookup(*r).valid)
    }

    /// `true` when exactly PP is valid (basic / "no full support" mode).
    pub fn is_basic_mode(&self) -> bool {
        self.valid_roles().count() == 1 && self.lookup(Role::Pp).valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(role: Role, ip: &str, port: u16, valid: bool) -> Endpoint {
        Endpoint {
            role,
            bind_addr: format!("{ip}:{port}").parse().unwrap(),
            advertised_ip: ip.parse().unwrap(),
            valid,
        }
    }

    #[test]
    fn rejects_mismatched_ports() {
        let entries = [
            endpoint(Role::Pp, "198.51.100.1", 3478, true),
            endpoint(Role::Pa, "198.51.100.1", 3479, true),
            endpoint(Role::Ap, "198.51.100.2", 3480, true),
            endpoint(Role::Aa, "198.51.100.2", 3479, true),
        ];

        assert!(TransportAddressSet::new(entries).is_err());
    }

    #[test]
    fn accepts_well_formed_full_mode_set() {
        let entries = [
            endpoint(Role::Pp, "198.51.100.1", 3478, true),
            endpoint(Role::Pa, "198.51.100.1", 3479, true),
            endpoint(Role::Ap, "198.51.100.2", 3478, true),
            endpoint(Role::Aa, "198.51.100.2", 3479, true),
        ];

        let tsa = TransportAddressSet::new(entries).unwrap();
        assert!(!tsa.is_basic_mode());
        assert_eq!(tsa.valid_roles().count(), 4);
    }
}
