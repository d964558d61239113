use crate::device::error::DeviceError;
use log::info;
use nix::unistd::{setgid, setgroups, setuid, Gid, Group, Uid, User};

/// A user and group to run as, given as `user[:group]` with names or numeric ids.
///
/// Without a group, the user's primary group is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
}

impl Identity {
    pub fn parse(text: &str) -> Result<Self, DeviceError> {
        let (user, group) = match text.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (text, None),
        };

        let (uid, primary) = lookup_user(user)?;
        let gid = match group {
            Some(group) => lookup_group(group)?,
            None => primary.ok_or_else(|| DeviceError::UnknownIdentity(text.to_owned()))?,
        };

        Ok(Self { uid, gid })
    }
}

fn lookup_user(user: &str) -> Result<(Uid, Option<Gid>), DeviceError> {
    let unknown = || DeviceError::UnknownIdentity(user.to_owned());

    if let Ok(raw) = user.parse::<u32>() {
        let uid = Uid::from_raw(raw);
        let primary = User::from_uid(uid).ok().flatten().map(|entry| entry.gid);
        return Ok((uid, primary));
    }

    let entry = User::from_name(user)
        .map_err(|_| unknown())?
        .ok_or_else(unknown)?;
    Ok((entry.uid, Some(entry.gid)))
}

fn lookup_group(group: &str) -> Result<Gid, DeviceError> {
    if let Ok(raw) = group.parse::<u32>() {
        return Ok(Gid::from_raw(raw));
    }

    let unknown = || DeviceError::UnknownIdentity(group.to_owned());
    Group::from_name(group)
        .map_err(|_| unknown())?
        .map(|entry| entry.gid)
        .ok_or_else(unknown)
}

/// Switches the process to `identity`. Supplementary groups are dropped first, then the
/// group, then the user, since each step needs the privileges the next one gives up.
pub fn drop_privileges(identity: Identity) -> Result<(), DeviceError> {
    setgroups(&[identity.gid]).map_err(DeviceError::PrivilegeDropFailed)?;
    setgid(identity.gid).map_err(DeviceError::PrivilegeDropFailed)?;
    setuid(identity.uid).map_err(DeviceError::PrivilegeDropFailed)?;

    info!("running as {}:{}", identity.uid, identity.gid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_user_and_group() {
        let identity = Identity::parse("1234:5678").unwrap();
        assert_eq!(identity.uid, Uid::from_raw(1234));
        assert_eq!(identity.gid, Gid::from_raw(5678));
    }

    #[test]
    fn root_by_name_uses_its_primary_group() {
        let identity = Identity::parse("root").unwrap();
        assert_eq!(identity.uid, Uid::from_raw(0));
        assert_eq!(identity.gid, Gid::from_raw(0));
    }

    #[test]
    fn unknown_names_are_reported() {
        assert!(matches!(
            Identity::parse("no-such-user-here"),
            Err(DeviceError::UnknownIdentity(name)) if name == "no-such-user-here"
        ));
        assert!(matches!(
            Identity::parse("root:no-such-group-here"),
            Err(DeviceError::UnknownIdentity(_))
        ));
    }
}
