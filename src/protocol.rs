//! Wire format spoken between the server and its clients.
//!
//! Every request and reply travels as a frame: a little-endian `u32` length followed by the
//! body. Request bodies start with an opcode byte, reply bodies with a status byte (`0` for
//! success, otherwise a `RequestError` code).
//!
//! Structured messages sent to the control node carry their own header (manager id and
//! subtype) followed by fixed-size `u32` fields.
use crate::device::error::RequestError;
use crate::event::{NotifyTarget, TARGET_CAPACITY};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use derive_try_from_primitive::TryFromPrimitive;
use std::ffi::OsStr;
use std::io::{self, Cursor, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Largest frame body accepted in either direction.
pub const MAX_FRAME: usize = 8 * 1024;

/// Tag identifying messages meant for this server.
pub const MANAGER_ID: u16 = 0x4750;

const HEADER_LEN: usize = 4;
const BASE_LEN: usize = HEADER_LEN + 8;
const ADD_EVENT_LEN: usize = HEADER_LEN + 14 + TARGET_CAPACITY;
const PWM_SETUP_LEN: usize = HEADER_LEN + 16;
const SPI_LEN: usize = HEADER_LEN + 16;

/// Reads one frame. Returns `None` if the peer closed the stream between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32::<LittleEndian>() {
        Ok(len) => len as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut body = vec![0; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    if body.len() > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", body.len()),
        ));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.write_u32::<LittleEndian>(body.len() as u32)?;
    frame.extend_from_slice(body);
    writer.write_all(&frame)?;
    writer.flush()
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
enum Opcode {
    Open = 1,
    Read = 2,
    Write = 3,
    Message = 4,
}

/// Access requested when opening a node.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Access {
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Access {
    pub fn reads(self) -> bool {
        self as u8 & Access::Read as u8 != 0
    }

    pub fn writes(self) -> bool {
        self as u8 & Access::Write as u8 != 0
    }
}

/// A request on an open handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open { access: Access, path: String },
    /// Read from a node. On the root this enumerates, `stat` asking for node metadata.
    Read { nbytes: u32, stat: bool },
    Write(Vec<u8>),
    Message(Vec<u8>),
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Request::Open { access, path } => {
                body.push(Opcode::Open as u8);
                body.push(*access as u8);
                body.extend_from_slice(path.as_bytes());
            }
            Request::Read { nbytes, stat } => {
                body.push(Opcode::Read as u8);
                body.extend_from_slice(&nbytes.to_le_bytes());
                body.push(u8::from(*stat));
            }
            Request::Write(data) => {
                body.push(Opcode::Write as u8);
                body.extend_from_slice(data);
            }
            Request::Message(data) => {
                body.push(Opcode::Message as u8);
                body.extend_from_slice(data);
            }
        }
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self, RequestError> {
        let (&opcode, rest) = body.split_first().ok_or(RequestError::MalformedMessage)?;
        let opcode = Opcode::try_from(opcode).map_err(|_| RequestError::MalformedMessage)?;

        Ok(match opcode {
            Opcode::Open => {
                let (&access, path) = rest.split_first().ok_or(RequestError::MalformedMessage)?;
                let access = Access::try_from(access).map_err(|_| RequestError::InvalidArgument)?;
                let path = std::str::from_utf8(path)
                    .map_err(|_| RequestError::MalformedMessage)?
                    .to_owned();
                Request::Open { access, path }
            }
            Opcode::Read => {
                if rest.len() < 5 {
                    return Err(RequestError::MalformedMessage);
                }
                Request::Read {
                    nbytes: LittleEndian::read_u32(&rest[..4]),
                    stat: rest[4] & 1 != 0,
                }
            }
            Opcode::Write => Request::Write(rest.to_vec()),
            Opcode::Message => Request::Message(rest.to_vec()),
        })
    }
}

pub fn encode_reply(reply: &Result<Vec<u8>, RequestError>) -> Vec<u8> {
    match reply {
        Ok(payload) => {
            let mut body = Vec::with_capacity(1 + payload.len());
            body.push(0);
            body.extend_from_slice(payload);
            body
        }
        Err(err) => vec![err.code()],
    }
}

/// Splits a reply body into its outcome. `None` means the status byte is not one this
/// library knows.
pub fn decode_reply(body: &[u8]) -> Option<Result<Vec<u8>, RequestError>> {
    let (&status, payload) = body.split_first()?;
    if status == 0 {
        return Some(Ok(payload.to_vec()));
    }
    RequestError::from_code(status).map(Err)
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Subtype {
    SetFunction = 1,
    GetFunction = 2,
    Read = 3,
    Write = 4,
    AddEvent = 5,
    PwmSetup = 6,
    PwmDuty = 7,
    PullUpDown = 8,
    SpiInit = 9,
    SpiWriteRead = 10,
}

impl Subtype {
    /// Smallest message body this subtype can be decoded from.
    pub fn min_len(self) -> usize {
        match self {
            Subtype::AddEvent => ADD_EVENT_LEN,
            Subtype::PwmSetup => PWM_SETUP_LEN,
            Subtype::SpiInit | Subtype::SpiWriteRead => SPI_LEN,
            _ => BASE_LEN,
        }
    }
}

/// A structured control-node message.
///
/// Fields hold raw wire values. Interpreting them (pin ranges, function codes and so on)
/// is left to the server, which reports each kind of violation with its own error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SetFunction { pin: u32, function: u32 },
    GetFunction { pin: u32 },
    Read { pin: u32 },
    Write { pin: u32, value: u32 },
    AddEvent {
        pin: u32,
        trigger: u32,
        threshold: u32,
        target: NotifyTarget,
    },
    PwmSetup {
        pin: u32,
        frequency: u32,
        range: u32,
        mode: u32,
    },
    PwmDuty { pin: u32, duty: u32 },
    PullUpDown { pin: u32, pull: u32 },
    SpiInit { pin: u32, clock_divider: u32 },
    SpiWriteRead {
        pin: u32,
        chip_select: u32,
        read_len: u32,
        data: Vec<u8>,
    },
}

impl Message {
    pub fn subtype(&self) -> Subtype {
        match self {
            Message::SetFunction { .. } => Subtype::SetFunction,
            Message::GetFunction { .. } => Subtype::GetFunction,
            Message::Read { .. } => Subtype::Read,
            Message::Write { .. } => Subtype::Write,
            Message::AddEvent { .. } => Subtype::AddEvent,
            Message::PwmSetup { .. } => Subtype::PwmSetup,
            Message::PwmDuty { .. } => Subtype::PwmDuty,
            Message::PullUpDown { .. } => Subtype::PullUpDown,
            Message::SpiInit { .. } => Subtype::SpiInit,
            Message::SpiWriteRead { .. } => Subtype::SpiWriteRead,
        }
    }

    pub fn pin(&self) -> u32 {
        match *self {
            Message::SetFunction { pin, .. }
            | Message::GetFunction { pin }
            | Message::Read { pin }
            | Message::Write { pin, .. }
            | Message::AddEvent { pin, .. }
            | Message::PwmSetup { pin, .. }
            | Message::PwmDuty { pin, .. }
            | Message::PullUpDown { pin, .. }
            | Message::SpiInit { pin, .. }
            | Message::SpiWriteRead { pin, .. } => pin,
        }
    }

    /// Encodes the message. Fails with `InvalidArgument` if a notification target does not
    /// fit its fixed-size field.
    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        let mut buf = Vec::with_capacity(self.subtype().min_len());
        buf.extend_from_slice(&MANAGER_ID.to_le_bytes());
        buf.extend_from_slice(&(self.subtype() as u16).to_le_bytes());

        let put = |buf: &mut Vec<u8>, value: u32| buf.extend_from_slice(&value.to_le_bytes());
        match self {
            Message::SetFunction { pin, function } => {
                put(&mut buf, *pin);
                put(&mut buf, *function);
            }
            Message::GetFunction { pin } | Message::Read { pin } => {
                put(&mut buf, *pin);
                put(&mut buf, 0);
            }
            Message::Write { pin, value } => {
                put(&mut buf, *pin);
                put(&mut buf, *value);
            }
            Message::PwmDuty { pin, duty } => {
                put(&mut buf, *pin);
                put(&mut buf, *duty);
            }
            Message::PullUpDown { pin, pull } => {
                put(&mut buf, *pin);
                put(&mut buf, *pull);
            }
            Message::AddEvent {
                pin,
                trigger,
                threshold,
                target,
            } => {
                put(&mut buf, *pin);
                put(&mut buf, *trigger);
                put(&mut buf, *threshold);
                let path = match target {
                    NotifyTarget::None => &[][..],
                    NotifyTarget::Socket(path) => path.as_os_str().as_bytes(),
                };
                if path.len() > TARGET_CAPACITY {
                    return Err(RequestError::InvalidArgument);
                }
                buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
                buf.extend_from_slice(path);
                buf.resize(ADD_EVENT_LEN, 0);
            }
            Message::PwmSetup {
                pin,
                frequency,
                range,
                mode,
            } => {
                put(&mut buf, *pin);
                put(&mut buf, *frequency);
                put(&mut buf, *range);
                put(&mut buf, *mode);
            }
            Message::SpiInit { pin, clock_divider } => {
                put(&mut buf, *pin);
                put(&mut buf, 0);
                put(&mut buf, *clock_divider);
                put(&mut buf, 0);
            }
            Message::SpiWriteRead {
                pin,
                chip_select,
                read_len,
                data,
            } => {
                put(&mut buf, *pin);
                put(&mut buf, *chip_select);
                put(&mut buf, 0);
                put(&mut buf, *read_len);
                buf.extend_from_slice(data);
            }
        }
        Ok(buf)
    }

    /// Decodes a message, checking the manager id and the subtype's minimum length.
    pub fn decode(buf: &[u8]) -> Result<Self, RequestError> {
        use RequestError::*;

        if buf.len() < HEADER_LEN {
            return Err(MalformedMessage);
        }
        if LittleEndian::read_u16(&buf[0..2]) != MANAGER_ID {
            return Err(MalformedMessage);
        }
        let subtype =
            Subtype::try_from(LittleEndian::read_u16(&buf[2..4])).map_err(|_| InvalidArgument)?;
        if buf.len() < subtype.min_len() {
            return Err(MalformedMessage);
        }

        let mut fields = Cursor::new(&buf[HEADER_LEN..]);
        let mut next = || {
            fields
                .read_u32::<LittleEndian>()
                .map_err(|_| MalformedMessage)
        };
        let pin = next()?;

        Ok(match subtype {
            Subtype::SetFunction => Message::SetFunction {
                pin,
                function: next()?,
            },
            Subtype::GetFunction => Message::GetFunction { pin },
            Subtype::Read => Message::Read { pin },
            Subtype::Write => Message::Write { pin, value: next()? },
            Subtype::PwmDuty => Message::PwmDuty { pin, duty: next()? },
            Subtype::PullUpDown => Message::PullUpDown { pin, pull: next()? },
            Subtype::PwmSetup => Message::PwmSetup {
                pin,
                frequency: next()?,
                range: next()?,
                mode: next()?,
            },
            Subtype::AddEvent => {
                let trigger = next()?;
                let threshold = next()?;
                let field = &buf[HEADER_LEN + 12..];
                let len = usize::from(LittleEndian::read_u16(&field[..2]));
                if len > TARGET_CAPACITY {
                    return Err(MalformedMessage);
                }
                let path = &field[2..2 + len];
                let target = if path.is_empty() {
                    NotifyTarget::None
                } else {
                    NotifyTarget::Socket(PathBuf::from(OsStr::from_bytes(path)))
                };
                Message::AddEvent {
                    pin,
                    trigger,
                    threshold,
                    target,
                }
            }
            Subtype::SpiInit => {
                next()?;
                Message::SpiInit {
                    pin,
                    clock_divider: next()?,
                }
            }
            Subtype::SpiWriteRead => {
                let chip_select = next()?;
                next()?;
                let read_len = next()?;
                Message::SpiWriteRead {
                    pin,
                    chip_select,
                    read_len,
                    data: buf[SPI_LEN..].to_vec(),
                }
            }
        })
    }
}

/// Reply payload carrying a single value.
pub fn encode_value(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_value(payload: &[u8]) -> Option<u32> {
    (payload.len() >= 4).then(|| LittleEndian::read_u32(&payload[..4]))
}

/// Metadata attached to a directory record when the reader asks for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// One directory record produced by enumerating the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Position of the node in the namespace.
    pub offset: u32,
    pub name: String,
    pub stat: Option<Stat>,
}

impl DirEntry {
    const FIXED_LEN: usize = 8;
    const STAT_LEN: usize = 16;

    pub fn encoded_len(&self) -> usize {
        Self::FIXED_LEN + self.name.len() + self.stat.map_or(0, |_| Self::STAT_LEN)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&(self.encoded_len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        if let Some(stat) = self.stat {
            for field in [stat.ino, stat.mode, stat.uid, stat.gid] {
                buf.extend_from_slice(&field.to_le_bytes());
            }
        }
    }

    /// Decodes every record in a directory read reply.
    pub fn decode_all(mut buf: &[u8]) -> Option<Vec<DirEntry>> {
        let mut entries = Vec::new();
        while !buf.is_empty() {
            if buf.len() < Self::FIXED_LEN {
                return None;
            }
            let offset = LittleEndian::read_u32(&buf[0..4]);
            let reclen = usize::from(LittleEndian::read_u16(&buf[4..6]));
            let namelen = usize::from(LittleEndian::read_u16(&buf[6..8]));
            if reclen > buf.len() || Self::FIXED_LEN + namelen > reclen {
                return None;
            }

            let name = std::str::from_utf8(&buf[Self::FIXED_LEN..Self::FIXED_LEN + namelen])
                .ok()?
                .to_owned();
            let stat = match reclen - Self::FIXED_LEN - namelen {
                0 => None,
                Self::STAT_LEN => {
                    let at = |i: usize| {
                        LittleEndian::read_u32(&buf[Self::FIXED_LEN + namelen + 4 * i..])
                    };
                    Some(Stat {
                        ino: at(0),
                        mode: at(1),
                        uid: at(2),
                        gid: at(3),
                    })
                }
                _ => return None,
            };

            entries.push(DirEntry { offset, name, stat });
            buf = &buf[reclen..];
        }
        Some(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_their_length() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        assert_eq!(&wire[..4], &[5, 0, 0, 0]);

        let mut reader = Cursor::new(wire);
        assert_eq!(read_frame(&mut reader).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut wire = Vec::new();
        wire.write_u32::<LittleEndian>(MAX_FRAME as u32 + 1).unwrap();
        assert!(read_frame(&mut Cursor::new(wire)).is_err());
        assert!(write_frame(&mut Vec::new(), &vec![0; MAX_FRAME + 1]).is_err());
    }

    #[test]
    fn requests_decode_from_their_encoding() {
        for request in [
            Request::Open {
                access: Access::ReadWrite,
                path: "17".into(),
            },
            Request::Read {
                nbytes: 512,
                stat: true,
            },
            Request::Write(b"out\n".to_vec()),
        ] {
            assert_eq!(Request::decode(&request.encode()), Ok(request));
        }
        assert_eq!(Request::decode(&[]), Err(RequestError::MalformedMessage));
        assert_eq!(Request::decode(&[9]), Err(RequestError::MalformedMessage));
    }

    #[test]
    fn replies_keep_the_error_code() {
        let busy = encode_reply(&Err(RequestError::Busy));
        assert_eq!(busy, vec![3]);
        assert_eq!(decode_reply(&busy), Some(Err(RequestError::Busy)));
        assert_eq!(
            decode_reply(&encode_reply(&Ok(vec![1, 2]))),
            Some(Ok(vec![1, 2]))
        );
        assert_eq!(decode_reply(&[200]), None);
    }

    #[test]
    fn base_message_layout() {
        let encoded = Message::Write { pin: 4, value: 1 }.encode().unwrap();
        assert_eq!(encoded, [0x50, 0x47, 4, 0, 4, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn add_event_carries_its_target() {
        let message = Message::AddEvent {
            pin: 5,
            trigger: 3,
            threshold: 2,
            target: NotifyTarget::Socket(PathBuf::from("/tmp/client.sock")),
        };
        let encoded = message.encode().unwrap();
        assert_eq!(encoded.len(), ADD_EVENT_LEN);
        assert_eq!(Message::decode(&encoded), Ok(message));
    }

    #[test]
    fn long_targets_do_not_encode() {
        let message = Message::AddEvent {
            pin: 5,
            trigger: 3,
            threshold: 1,
            target: NotifyTarget::Socket(PathBuf::from("/".repeat(TARGET_CAPACITY + 1))),
        };
        assert_eq!(message.encode(), Err(RequestError::InvalidArgument));
    }

    #[test]
    fn spi_payload_follows_the_fixed_fields() {
        let message = Message::SpiWriteRead {
            pin: 0,
            chip_select: 1,
            read_len: 2,
            data: vec![0xaa, 0x55],
        };
        let encoded = message.encode().unwrap();
        assert_eq!(encoded.len(), SPI_LEN + 2);
        assert_eq!(Message::decode(&encoded), Ok(message));
    }

    #[test]
    fn short_messages_are_malformed() {
        let encoded = Message::PwmSetup {
            pin: 12,
            frequency: 1000,
            range: 100,
            mode: 1,
        }
        .encode()
        .unwrap();
        assert_eq!(
            Message::decode(&encoded[..BASE_LEN]),
            Err(RequestError::MalformedMessage)
        );
        assert_eq!(Message::decode(&[0x50]), Err(RequestError::MalformedMessage));
    }

    #[test]
    fn foreign_manager_and_unknown_subtype() {
        let mut encoded = Message::Read { pin: 3 }.encode().unwrap();
        encoded[2] = 99;
        assert_eq!(Message::decode(&encoded), Err(RequestError::InvalidArgument));
        encoded[0] = 0;
        assert_eq!(Message::decode(&encoded), Err(RequestError::MalformedMessage));
    }

    #[test]
    fn directory_records_decode_in_sequence() {
        let entries = vec![
            DirEntry {
                offset: 0,
                name: "0".into(),
                stat: None,
            },
            DirEntry {
                offset: 54,
                name: "msg".into(),
                stat: Some(Stat {
                    ino: 55,
                    mode: 0o100660,
                    uid: 0,
                    gid: 0,
                }),
            },
        ];
        let mut buf = Vec::new();
        for entry in &entries {
            entry.encode_into(&mut buf);
        }
        assert_eq!(buf.len(), entries.iter().map(DirEntry::encoded_len).sum());
        assert_eq!(DirEntry::decode_all(&buf), Some(entries));
        assert_eq!(DirEntry::decode_all(&buf[..5]), None);
    }
}
