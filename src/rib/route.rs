use inetnum::addr::Prefix;

use crate::types::NhopHandle;

//------------ RouteEntry ----------------------------------------------------

/// One entry of a routing table, as seen during a full table walk.
#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub prefix: Prefix,
    pub nexthop: NhopHandle,
}

impl RouteEntry {
    pub fn new(prefix: Prefix, nexthop: NhopHandle) -> Self {
        Self { prefix, nexthop }
    }
}

//------------ RibCmd --------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RibCmd {
    Add,
    Delete,
    Change,
}

//------------ RibCmdInfo ----------------------------------------------------

/// A change record delivered through a routing table's change feed.
///
/// An addition only carries `nh_new`, a deletion only `nh_old`, and a change
/// carries both.
#[derive(Clone, Debug)]
pub struct RibCmdInfo {
    pub cmd: RibCmd,
    pub prefix: Prefix,
    pub nh_old: Option<NhopHandle>,
    pub nh_new: Option<NhopHandle>,
}

impl RibCmdInfo {
    pub fn add(prefix: Prefix, nh: NhopHandle) -> Self {
        Self {
            cmd: RibCmd::Add,
            prefix,
            nh_old: None,
            nh_new: Some(nh),
        }
    }

    pub fn delete(prefix: Prefix, nh: NhopHandle) -> Self {
        Self {
            cmd: RibCmd::Delete,
            prefix,
            nh_old: Some(nh),
            nh_new: None,
        }
    }

    pub fn change(prefix: Prefix, old: NhopHandle, new: NhopHandle) -> Self {
        Self {
            cmd: RibCmd::Change,
            prefix,
            nh_old: Some(old),
            nh_new: Some(new),
        }
    }
}
