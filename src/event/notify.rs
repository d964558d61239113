use crate::device::error::RequestError;
use crate::device::pin::Level;
use crate::pin_map::Pin;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Longest notification socket path a registration can carry.
pub const TARGET_CAPACITY: usize = 108;

/// Where the dispatcher sends notifications for a registration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NotifyTarget {
    /// Transitions are counted but never delivered.
    #[default]
    None,
    /// A Unix datagram socket bound by the client.
    Socket(PathBuf),
}

/// A pin transition as delivered to a client.
///
/// On the wire this is the signed pin value (`+pin` when the pin went high, `-pin` when it
/// went low) followed by the level itself, which keeps pin 0 unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub pin: Pin,
    pub level: Level,
}

impl Notification {
    pub const LEN: usize = 5;

    pub fn value(&self) -> i32 {
        let number = self.pin.number() as i32;
        match self.level {
            Level::High => number,
            Level::Low => -number,
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        LittleEndian::write_i32(&mut buf[..4], self.value());
        buf[4] = self.level as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let value = LittleEndian::read_i32(&buf[..4]);
        let pin = Pin::new(value.unsigned_abs())?;
        let level = Level::try_from(buf[4]).ok()?;
        Some(Self { pin, level })
    }
}

/// The connected sending end of one registration's notifications.
///
/// The socket is connected once, when the registration is made, so later changes to the
/// filesystem cannot redirect deliveries.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    socket: Option<Arc<UnixDatagram>>,
}

impl Endpoint {
    /// Connects to `target` on behalf of a peer running as `uid`.
    ///
    /// The target must be a socket owned by that user, unless the peer is root.
    pub fn open(target: &NotifyTarget, uid: u32) -> Result<Self, RequestError> {
        let path = match target {
            NotifyTarget::None => return Ok(Self::default()),
            NotifyTarget::Socket(path) => path,
        };

        check_owner(path, uid)?;
        let socket = UnixDatagram::unbound().map_err(|_| RequestError::ResourceUnavailable)?;
        socket.connect(path).map_err(|err| {
            debug!("cannot reach notification socket {}: {}", path.display(), err);
            RequestError::InvalidArgument
        })?;
        // The path may have been replaced while connecting.
        check_owner(path, uid)?;
        // The interrupt thread must never block on a slow client.
        socket
            .set_nonblocking(true)
            .map_err(|_| RequestError::ResourceUnavailable)?;

        Ok(Self {
            socket: Some(Arc::new(socket)),
        })
    }

    pub(crate) fn deliver(&self, notification: Notification) -> io::Result<()> {
        match &self.socket {
            None => Ok(()),
            Some(socket) => socket.send(&notification.encode()).map(|_| ()),
        }
    }
}

fn check_owner(path: &Path, uid: u32) -> Result<(), RequestError> {
    let metadata = fs::metadata(path).map_err(|_| RequestError::InvalidArgument)?;
    if !metadata.file_type().is_socket() {
        return Err(RequestError::InvalidArgument);
    }
    if uid != 0 && metadata.uid() != uid {
        debug!(
            "notification socket {} belongs to uid {}, not {}",
            path.display(),
            metadata.uid(),
            uid
        );
        return Err(RequestError::PermissionDenied);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_sign_carries_the_level() {
        let pin = Pin::new(17).unwrap();
        let high = Notification {
            pin,
            level: Level::High,
        };
        let low = Notification {
            pin,
            level: Level::Low,
        };
        assert_eq!(high.value(), 17);
        assert_eq!(low.value(), -17);
        assert_eq!(Notification::decode(&low.encode()), Some(low));
    }

    #[test]
    fn pin_zero_keeps_its_level() {
        let high = Notification {
            pin: Pin::new(0).unwrap(),
            level: Level::High,
        };
        assert_eq!(Notification::decode(&high.encode()), Some(high));
    }

    #[test]
    fn garbage_is_not_a_notification() {
        assert_eq!(Notification::decode(&[1, 0, 0]), None);
        let mut buf = [0u8; Notification::LEN];
        LittleEndian::write_i32(&mut buf[..4], 99);
        assert_eq!(Notification::decode(&buf), None);
    }

    #[test]
    fn endpoints_reach_their_own_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();
        let target = NotifyTarget::Socket(path.clone());
        let notification = Notification {
            pin: Pin::new(1).unwrap(),
            level: Level::High,
        };

        let uid = fs::metadata(&path).unwrap().uid();
        let endpoint = Endpoint::open(&target, uid).unwrap();
        endpoint.deliver(notification).unwrap();
        let mut buf = [0u8; 16];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(Notification::decode(&buf[..len]), Some(notification));

        // A socket replaced after registration is not followed.
        drop(receiver);
        fs::remove_file(&path).unwrap();
        let _other = UnixDatagram::bind(&path).unwrap();
        assert!(endpoint.deliver(notification).is_err());

        assert!(Endpoint::default().deliver(notification).is_ok());
    }

    #[test]
    fn endpoints_refuse_foreign_or_odd_targets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let _receiver = UnixDatagram::bind(&path).unwrap();
        let owner = fs::metadata(&path).unwrap().uid();
        let stranger = if owner == 1 { 2 } else { 1 };

        assert_eq!(
            Endpoint::open(&NotifyTarget::Socket(path.clone()), stranger).unwrap_err(),
            RequestError::PermissionDenied
        );
        assert!(Endpoint::open(&NotifyTarget::Socket(path), 0).is_ok());

        let plain = dir.path().join("plain");
        fs::write(&plain, b"").unwrap();
        assert_eq!(
            Endpoint::open(&NotifyTarget::Socket(plain), owner).unwrap_err(),
            RequestError::InvalidArgument
        );
        assert_eq!(
            Endpoint::open(&NotifyTarget::Socket(dir.path().join("gone.sock")), owner)
                .unwrap_err(),
            RequestError::InvalidArgument
        );
    }
}
