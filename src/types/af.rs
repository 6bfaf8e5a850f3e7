use std::net::IpAddr;

use inetnum::addr::Prefix;
use serde_derive::{Deserialize, Serialize};

//------------ Family --------------------------------------------------------

/// The address family a routing table, a lookup module and a datapath array
/// belong to.
///
/// Every table number exists once per family, so a (family, fibnum) pair is
/// what identifies a single routing table throughout this crate.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub enum Family {
    /// IPv4, AFI 1.
    Inet,
    /// IPv6, AFI 2.
    Inet6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Inet, Family::Inet6];

    pub const fn name(self) -> &'static str {
        match self {
            Family::Inet => "inet",
            Family::Inet6 => "inet6",
        }
    }

    pub fn of_addr(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::Inet,
            IpAddr::V6(_) => Family::Inet6,
        }
    }

    pub fn of_prefix(prefix: &Prefix) -> Self {
        Self::of_addr(&prefix.addr())
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
