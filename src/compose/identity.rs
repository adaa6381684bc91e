//! Host-side identities of container users under a user namespace remap.
//!
//! The daemon shifts in-container ids by `start`. ACLs on the host must name the shifted
//! ids, while the compose file keeps the in-container ones.

use anyhow::Result;

use super::types::{UserIds, UsernsRemap};
use crate::error::ProvisionError;

fn remap(kind: &'static str, id: u32, remap: UsernsRemap) -> Result<u32> {
    let out_of_range = || ProvisionError::NamespaceRange {
        kind,
        id,
        start: remap.start,
        length: remap.length,
    };
    let host_id = remap.start.checked_add(id).ok_or_else(out_of_range)?;
    if remap.length != 0 && id >= remap.length {
        return Err(out_of_range().into());
    }
    Ok(host_id)
}

pub fn host_uid(uid: u32, userns: UsernsRemap) -> Result<u32> {
    remap("User", uid, userns)
}

pub fn host_gid(gid: u32, userns: UsernsRemap) -> Result<u32> {
    remap("Group", gid, userns)
}

pub fn host_ids(ids: UserIds, userns: UsernsRemap) -> Result<UserIds> {
    Ok(UserIds {
        uid: host_uid(ids.uid, userns)?,
        gid: host_gid(ids.gid, userns)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMAP: UsernsRemap = UsernsRemap {
        start: 100000,
        length: 65536,
    };

    #[test]
    fn test_ids_are_shifted() {
        let ids = host_ids(UserIds { uid: 1000, gid: 1001 }, REMAP).unwrap();
        assert_eq!(ids, UserIds { uid: 101000, gid: 101001 });
        assert_eq!(host_uid(0, REMAP).unwrap(), 100000);
    }

    #[test]
    fn test_last_id_in_range() {
        assert_eq!(host_uid(65535, REMAP).unwrap(), 165535);
    }

    #[test]
    fn test_id_past_range_rejected() {
        let err = host_gid(65536, REMAP).unwrap_err();
        match err.downcast_ref::<ProvisionError>() {
            Some(ProvisionError::NamespaceRange { kind, id, .. }) => {
                assert_eq!(*kind, "Group");
                assert_eq!(*id, 65536);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_zero_length_disables_check() {
        let disabled = UsernsRemap { start: 0, length: 0 };
        assert_eq!(host_uid(4_000_000, disabled).unwrap(), 4_000_000);
        let overflow = UsernsRemap { start: u32::MAX, length: 0 };
        assert!(host_uid(1, overflow).is_err());
    }
}
