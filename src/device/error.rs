use derive_try_from_primitive::TryFromPrimitive;
use std::io;
use thiserror::Error;

/// Enum representing possible failures when bringing the server up.
///
/// All of these are fatal: the server cannot enter its request loop without registers,
/// an interrupt line and a namespace.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to open memory device")]
    DeviceAccessFailed(#[source] nix::Error),
    #[error("failed to map device memory")]
    MemoryMapFailed(#[source] io::Error),
    #[error("failed to attach to the GPIO interrupt line")]
    InterruptAttachFailed(#[source] io::Error),
    #[error("failed to spawn the interrupt service thread")]
    ThreadSpawnFailed(#[source] io::Error),
    #[error("failed to register the namespace")]
    NamespaceFailed(#[source] io::Error),
    #[error("failed to switch to a reduced privilege identity")]
    PrivilegeDropFailed(#[source] nix::Error),
    #[error("unknown user or group: {0}")]
    UnknownIdentity(String),
}

/// Enum representing failures of a single client request.
///
/// These never abort the server. Each variant travels over the wire as its `u8` code,
/// so the client library can rebuild the exact error the server produced.
#[repr(u8)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum RequestError {
    #[error("pin index out of range")]
    OutOfRange = 1,
    #[error("operation not supported in the current pin or node state")]
    NotSupported = 2,
    #[error("resource already owned by another client")]
    Busy = 3,
    #[error("malformed message")]
    MalformedMessage = 4,
    #[error("timed out waiting for hardware")]
    Timeout = 5,
    #[error("hardware resource unavailable")]
    ResourceUnavailable = 6,
    #[error("invalid argument")]
    InvalidArgument = 7,
    #[error("no such node")]
    NotFound = 8,
    #[error("permission denied")]
    PermissionDenied = 9,
}

impl RequestError {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::try_from(code).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::RequestError;

    #[test]
    fn codes_survive_the_wire() {
        for err in [
            RequestError::OutOfRange,
            RequestError::NotSupported,
            RequestError::Busy,
            RequestError::MalformedMessage,
            RequestError::Timeout,
            RequestError::ResourceUnavailable,
            RequestError::InvalidArgument,
            RequestError::NotFound,
            RequestError::PermissionDenied,
        ] {
            assert_eq!(RequestError::from_code(err.code()), Some(err));
        }
    }

    #[test]
    fn zero_is_not_an_error() {
        assert_eq!(RequestError::from_code(0), None);
    }
}
