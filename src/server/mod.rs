//! The device server.
//!
//! `DeviceServer` holds all hardware state and serves requests strictly one at a time; the
//! transport feeds it requests from every connection through a single loop. Event
//! detection runs beside it on the interrupt service thread.
use crate::device::error::{DeviceError, RequestError};
use crate::device::pin::{Function, Gpio, Level, Pull, Trigger};
use crate::device::Device;
use crate::event::{
    Endpoint, Events, InterruptLine, InterruptService, Registration, UioInterrupt,
};
use crate::pin_map::Pin;
use crate::protocol::{self, Access, Message, Request};
use crate::pwm::Pwm;
use crate::spi::Spi;
use crate::ClientId;
use log::{debug, info, warn};
use nix::unistd::{getegid, geteuid};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod namespace;
mod privilege;
mod transport;

pub use namespace::{Credentials, Namespace, NodeKind, CONTROL_NODE};
pub use privilege::{drop_privileges, Identity};
pub use transport::Listener;

/// Longest textual command accepted on a pin node.
const MAX_COMMAND: usize = 15;

/// Where the interrupt service thread waits for GPIO interrupts.
pub enum InterruptSource {
    /// A UIO device node bound to the GPIO interrupt.
    Uio(PathBuf),
    /// An already attached line, such as a software one on a simulated board.
    Line(Box<dyn InterruptLine>),
}

pub struct ServerConfig {
    pub device: Device,
    pub interrupt: InterruptSource,
    /// `SCHED_FIFO` priority for the interrupt service thread.
    pub priority: Option<i32>,
    /// Permission bits of the root directory node.
    pub root_mode: u32,
    /// Bound on every hardware status wait.
    pub hardware_timeout: Duration,
}

#[derive(Debug)]
struct Handle {
    cred: Credentials,
    node: Option<NodeKind>,
    access: Access,
    offset: usize,
}

pub struct DeviceServer {
    device: Device,
    gpio: Arc<Gpio>,
    events: Arc<Events>,
    _service: InterruptService,
    spi: Spi,
    pwm: Pwm,
    namespace: Namespace,
    handles: HashMap<ClientId, Handle>,
}

impl DeviceServer {
    /// Maps the registers, starts event detection and builds the namespace.
    ///
    /// Nodes are owned by the current effective identity until `set_owner` is called.
    pub fn start(config: ServerConfig) -> Result<Self, DeviceError> {
        let ServerConfig {
            device,
            interrupt,
            priority,
            root_mode,
            hardware_timeout,
        } = config;

        let gpio = Arc::new(Gpio::new(device.map(Device::GPIO_OFFSET)?, device.soc()));
        let events = Arc::new(Events::new(Arc::clone(&gpio)));

        let line: Box<dyn InterruptLine> = match interrupt {
            InterruptSource::Uio(path) => Box::new(
                UioInterrupt::attach(&path).map_err(DeviceError::InterruptAttachFailed)?,
            ),
            InterruptSource::Line(line) => line,
        };
        let service = events.start_service(line, priority)?;

        let pwm = Pwm::new(&device, hardware_timeout)?;
        let namespace = Namespace::new(root_mode, geteuid().as_raw(), getegid().as_raw());

        info!(
            "GPIO server ready on {:?}{}",
            device.soc(),
            if device.is_simulated() {
                " (simulated)"
            } else {
                ""
            }
        );

        Ok(Self {
            device,
            gpio,
            events,
            _service: service,
            spi: Spi::new(hardware_timeout),
            pwm,
            namespace,
            handles: HashMap::new(),
        })
    }

    pub fn gpio(&self) -> &Gpio {
        &self.gpio
    }

    /// A handle to the GPIO block which outlives borrows of the server.
    pub fn shared_gpio(&self) -> Arc<Gpio> {
        Arc::clone(&self.gpio)
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Hands every node to the identity the server ended up running as.
    pub fn set_owner(&mut self, uid: u32, gid: u32) {
        self.namespace.set_owner(uid, gid);
        debug!("nodes now owned by {}:{}", uid, gid);
    }

    /// Registers a new connection. It has no node until it sends `Open`.
    pub fn connect(&mut self, client: ClientId, cred: Credentials) {
        debug!("client {} connected as {}:{}", client, cred.uid, cred.gid);
        self.handles.insert(
            client,
            Handle {
                cred,
                node: None,
                access: Access::Read,
                offset: 0,
            },
        );
    }

    /// Decodes one request body and serves it.
    pub fn handle(&mut self, client: ClientId, body: &[u8]) -> Result<Vec<u8>, RequestError> {
        match Request::decode(body)? {
            Request::Open { access, path } => {
                self.open(client, access, &path).map(|_| Vec::new())
            }
            Request::Read { nbytes, stat } => self.read(client, nbytes, stat),
            Request::Write(data) => self
                .write(client, &data)
                .map(|written| protocol::encode_value(written as u32)),
            Request::Message(data) => self.message(client, &data),
        }
    }

    pub fn open(
        &mut self,
        client: ClientId,
        access: Access,
        path: &str,
    ) -> Result<(), RequestError> {
        let node = self.namespace.resolve(path)?;
        let handle = self.handles.get_mut(&client).ok_or(RequestError::NotFound)?;
        self.namespace.check_access(node, handle.cred, access)?;

        handle.node = Some(node);
        handle.access = access;
        handle.offset = 0;
        debug!("client {} opened {:?}", client, node);
        Ok(())
    }

    /// Reads from the open node: directory records on the root, a level on a pin node.
    pub fn read(
        &mut self,
        client: ClientId,
        nbytes: u32,
        stat: bool,
    ) -> Result<Vec<u8>, RequestError> {
        let handle = self.handles.get_mut(&client).ok_or(RequestError::NotFound)?;
        if !handle.access.reads() {
            return Err(RequestError::PermissionDenied);
        }

        match handle.node {
            Some(NodeKind::Root) => {
                let budget = nbytes as usize;
                let mut reply = Vec::new();
                let mut consumed = 0;
                for entry in self.namespace.entries(handle.offset, stat) {
                    if reply.len() + entry.encoded_len() > budget {
                        break;
                    }
                    entry.encode_into(&mut reply);
                    consumed += 1;
                }
                handle.offset += consumed;
                Ok(reply)
            }
            Some(NodeKind::Pin(pin)) => {
                if self.gpio.get_function(pin).drives() {
                    return Err(RequestError::NotSupported);
                }
                if nbytes == 0 || handle.offset != 0 {
                    return Ok(Vec::new());
                }
                handle.offset += 1;
                let level = match self.gpio.read(pin) {
                    Level::High => b'1',
                    Level::Low => b'0',
                };
                Ok(vec![level])
            }
            Some(NodeKind::Control) | None => Err(RequestError::NotSupported),
        }
    }

    /// Applies a textual command to the open pin node. Returns the number of bytes consumed.
    pub fn write(&mut self, client: ClientId, data: &[u8]) -> Result<usize, RequestError> {
        let handle = self.handles.get(&client).ok_or(RequestError::NotFound)?;
        if !handle.access.writes() {
            return Err(RequestError::PermissionDenied);
        }
        let pin = match handle.node {
            Some(NodeKind::Pin(pin)) => pin,
            _ => return Err(RequestError::NotSupported),
        };

        let command = data.strip_suffix(b"\n").unwrap_or(data);
        if command.len() > MAX_COMMAND {
            return Err(RequestError::InvalidArgument);
        }
        let command = std::str::from_utf8(command).map_err(|_| RequestError::InvalidArgument)?;
        info!("GPIO {}: {}", pin, command);

        match command {
            "out" => self.gpio.set_function(pin, Function::Output),
            "in" => self.gpio.set_function(pin, Function::Input),
            "on" | "off" => {
                if !self.gpio.get_function(pin).drives() {
                    return Err(RequestError::NotSupported);
                }
                let level = if command == "on" {
                    Level::High
                } else {
                    Level::Low
                };
                self.gpio.write(pin, level);
            }
            "pwm" => self.pwm.debug(pin),
            _ => warn!("GPIO {}: unknown command {:?}", pin, command),
        }

        Ok(data.len())
    }

    /// Serves a structured message sent to the control node.
    pub fn message(&mut self, client: ClientId, raw: &[u8]) -> Result<Vec<u8>, RequestError> {
        let message = Message::decode(raw)?;
        let pin = Pin::new(message.pin()).ok_or(RequestError::OutOfRange)?;
        let handle = self.handles.get(&client).ok_or(RequestError::NotFound)?;
        if handle.node != Some(NodeKind::Control) {
            return Err(RequestError::NotSupported);
        }
        let peer = handle.cred;

        debug!("client {}: {:?}", client, message);

        match message {
            Message::SetFunction { function, .. } => {
                let function = Function::from_code(function).ok_or(RequestError::OutOfRange)?;
                let previous = self.gpio.get_function(pin);
                self.gpio.set_function(pin, function);
                Ok(protocol::encode_value(previous.code()))
            }
            Message::GetFunction { .. } => {
                Ok(protocol::encode_value(self.gpio.get_function(pin).code()))
            }
            Message::Read { .. } => {
                if self.gpio.get_function(pin).drives() {
                    return Err(RequestError::NotSupported);
                }
                Ok(protocol::encode_value(self.gpio.read(pin).bit()))
            }
            Message::Write { value, .. } => {
                if self.gpio.get_function(pin) != Function::Output {
                    return Err(RequestError::NotSupported);
                }
                self.gpio.write(pin, Level::from_bit(value));
                Ok(Vec::new())
            }
            Message::AddEvent {
                trigger,
                threshold,
                target,
                ..
            } => {
                let registration = Registration {
                    pin,
                    trigger: Trigger::from_bits(trigger),
                    threshold,
                    target: Endpoint::open(&target, peer.uid)?,
                };
                self.events.register(client, registration)?;
                Ok(Vec::new())
            }
            Message::PwmSetup {
                frequency,
                range,
                mode,
                ..
            } => {
                self.pwm
                    .setup(&self.gpio, client, pin, frequency, range, mode)?;
                Ok(Vec::new())
            }
            Message::PwmDuty { duty, .. } => {
                self.pwm.set_duty_cycle(client, pin, duty)?;
                Ok(Vec::new())
            }
            Message::PullUpDown { pull, .. } => {
                let pull = Pull::from_code(pull).ok_or(RequestError::InvalidArgument)?;
                self.gpio.set_pull(pin, pull);
                Ok(Vec::new())
            }
            Message::SpiInit { clock_divider, .. } => {
                self.spi.init(&self.device, &self.gpio, clock_divider)?;
                Ok(Vec::new())
            }
            Message::SpiWriteRead {
                chip_select,
                read_len,
                data,
                ..
            } => self.spi.transact(chip_select, &data, read_len as usize),
        }
    }

    /// Releases everything the connection owned.
    pub fn close(&mut self, client: ClientId) {
        self.handles.remove(&client);
        self.events.deregister_all(client);
        self.pwm.release(&self.gpio, client);
        debug!("client {} closed", client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::pin::tests::set_level;
    use crate::event::{soft_interrupt, NotifyTarget};
    use crate::protocol::DirEntry;

    const PEER: Credentials = Credentials { uid: 0, gid: 0 };

    fn pin(n: u32) -> Pin {
        Pin::new(n).unwrap()
    }

    fn server() -> DeviceServer {
        let (line, _trigger) = soft_interrupt();
        DeviceServer::start(ServerConfig {
            device: Device::simulated(Device::DEFAULT_BASE_ADDR),
            interrupt: InterruptSource::Line(Box::new(line)),
            priority: None,
            root_mode: 0o755,
            hardware_timeout: Duration::from_millis(2),
        })
        .unwrap()
    }

    fn opened(server: &mut DeviceServer, client: ClientId, path: &str) {
        server.connect(client, PEER);
        server.open(client, Access::ReadWrite, path).unwrap();
    }

    fn send(
        server: &mut DeviceServer,
        client: ClientId,
        message: Message,
    ) -> Result<Vec<u8>, RequestError> {
        server.message(client, &message.encode().unwrap())
    }

    #[test]
    fn structured_read_and_write_follow_the_function() {
        let mut server = server();
        opened(&mut server, 1, CONTROL_NODE);

        for n in [0, 17, 53] {
            send(&mut server, 1, Message::SetFunction { pin: n, function: 1 }).unwrap();
            send(&mut server, 1, Message::Write { pin: n, value: 1 }).unwrap();
            assert_eq!(
                send(&mut server, 1, Message::Read { pin: n }),
                Err(RequestError::NotSupported)
            );
            assert_eq!(
                send(&mut server, 1, Message::GetFunction { pin: n }),
                Ok(protocol::encode_value(1))
            );

            let previous = send(&mut server, 1, Message::SetFunction { pin: n, function: 0 });
            assert_eq!(previous, Ok(protocol::encode_value(1)));
            assert_eq!(
                send(&mut server, 1, Message::Write { pin: n, value: 1 }),
                Err(RequestError::NotSupported)
            );
        }
    }

    #[test]
    fn validation_order_is_length_then_pin_then_node() {
        let mut server = server();
        opened(&mut server, 1, "4");

        let encoded = Message::PwmSetup {
            pin: 99,
            frequency: 1,
            range: 1,
            mode: 0,
        }
        .encode()
        .unwrap();
        assert_eq!(
            server.message(1, &encoded[..12]),
            Err(RequestError::MalformedMessage)
        );
        assert_eq!(server.message(1, &encoded), Err(RequestError::OutOfRange));
        assert_eq!(
            send(&mut server, 1, Message::GetFunction { pin: 4 }),
            Err(RequestError::NotSupported)
        );
    }

    #[test]
    fn malformed_messages_leave_pins_untouched() {
        let mut server = server();
        opened(&mut server, 1, CONTROL_NODE);
        let encoded = Message::SetFunction { pin: 5, function: 1 }.encode().unwrap();
        assert_eq!(
            server.message(1, &encoded[..8]),
            Err(RequestError::MalformedMessage)
        );
        assert_eq!(server.gpio().get_function(pin(5)), Function::Input);
    }

    #[test]
    fn bad_function_and_pull_codes() {
        let mut server = server();
        opened(&mut server, 1, CONTROL_NODE);
        assert_eq!(
            send(&mut server, 1, Message::SetFunction { pin: 5, function: 8 }),
            Err(RequestError::OutOfRange)
        );
        assert_eq!(
            send(&mut server, 1, Message::PullUpDown { pin: 5, pull: 3 }),
            Err(RequestError::InvalidArgument)
        );
        send(&mut server, 1, Message::PullUpDown { pin: 5, pull: 2 }).unwrap();
    }

    #[test]
    fn event_ownership_is_released_on_close() {
        let mut server = server();
        opened(&mut server, 1, CONTROL_NODE);
        opened(&mut server, 2, CONTROL_NODE);
        let add = Message::AddEvent {
            pin: 6,
            trigger: Trigger::BOTH_EDGES.bits(),
            threshold: 0,
            target: NotifyTarget::None,
        };

        send(&mut server, 1, add.clone()).unwrap();
        assert_eq!(send(&mut server, 2, add.clone()), Err(RequestError::Busy));
        server.close(1);
        send(&mut server, 2, add).unwrap();
        assert_eq!(server.events().owner(pin(6)), Some(2));
    }

    #[test]
    fn notification_targets_must_belong_to_the_peer() {
        use std::os::unix::fs::MetadataExt;
        use std::os::unix::net::UnixDatagram;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let _socket = UnixDatagram::bind(&path).unwrap();
        let owner = std::fs::metadata(&path).unwrap().uid();
        let stranger = Credentials {
            uid: if owner == 1000 { 1001 } else { 1000 },
            gid: 1000,
        };

        let mut server = server();
        server.connect(1, stranger);
        server.open(1, Access::ReadWrite, CONTROL_NODE).unwrap();
        let add = |target| Message::AddEvent {
            pin: 8,
            trigger: Trigger::RISING.bits(),
            threshold: 1,
            target,
        };

        assert_eq!(
            send(&mut server, 1, add(NotifyTarget::Socket(path.clone()))),
            Err(RequestError::PermissionDenied)
        );
        assert_eq!(
            send(&mut server, 1, add(NotifyTarget::Socket("/nonexistent/x.sock".into()))),
            Err(RequestError::InvalidArgument)
        );
        assert_eq!(server.events().owner(pin(8)), None);

        opened(&mut server, 2, CONTROL_NODE);
        send(&mut server, 2, add(NotifyTarget::Socket(path))).unwrap();
        assert_eq!(server.events().owner(pin(8)), Some(2));
    }

    #[test]
    fn spi_requires_init_and_validates_chip_select() {
        let mut server = server();
        opened(&mut server, 1, CONTROL_NODE);
        let transfer = |chip_select| Message::SpiWriteRead {
            pin: 0,
            chip_select,
            read_len: 1,
            data: vec![0x9f],
        };

        assert_eq!(
            send(&mut server, 1, transfer(0)),
            Err(RequestError::NotSupported)
        );
        send(&mut server, 1, Message::SpiInit { pin: 0, clock_divider: 64 }).unwrap();
        assert_eq!(
            send(&mut server, 1, transfer(7)),
            Err(RequestError::InvalidArgument)
        );
        // Nothing drains the simulated FIFO.
        assert_eq!(send(&mut server, 1, transfer(0)), Err(RequestError::Timeout));
        assert_eq!(server.gpio().get_function(pin(10)), Function::Alt0);
    }

    #[test]
    fn pwm_is_released_on_close() {
        let mut server = server();
        opened(&mut server, 1, CONTROL_NODE);
        opened(&mut server, 2, CONTROL_NODE);
        let setup = Message::PwmSetup {
            pin: 18,
            frequency: 1000,
            range: 100,
            mode: 1,
        };

        send(&mut server, 1, setup.clone()).unwrap();
        assert_eq!(server.gpio().get_function(pin(18)), Function::Alt5);
        assert_eq!(send(&mut server, 2, setup.clone()), Err(RequestError::Busy));
        server.close(1);
        assert_eq!(server.gpio().get_function(pin(18)), Function::Input);
        send(&mut server, 2, setup).unwrap();
        send(&mut server, 2, Message::PwmDuty { pin: 18, duty: 50 }).unwrap();
    }

    #[test]
    fn text_commands_drive_pins() {
        let mut server = server();
        opened(&mut server, 1, "22");

        assert_eq!(server.write(1, b"on\n"), Err(RequestError::NotSupported));
        assert_eq!(server.write(1, b"out\n"), Ok(4));
        server.write(1, b"on").unwrap();
        assert_eq!(server.read(1, 1, false), Err(RequestError::NotSupported));

        server.write(1, b"in").unwrap();
        assert_eq!(server.gpio().get_function(pin(22)), Function::Input);
        assert_eq!(server.write(1, b"blink"), Ok(5));
        assert_eq!(
            server.write(1, b"a-very-long-command"),
            Err(RequestError::InvalidArgument)
        );
    }

    #[test]
    fn pin_reads_are_one_shot() {
        let mut server = server();
        opened(&mut server, 1, "3");
        set_level(server.gpio(), pin(3), Level::High);

        assert_eq!(server.read(1, 0, false), Ok(Vec::new()));
        assert_eq!(server.read(1, 16, false), Ok(b"1".to_vec()));
        assert_eq!(server.read(1, 16, false), Ok(Vec::new()));

        server.open(1, Access::Read, "3").unwrap();
        set_level(server.gpio(), pin(3), Level::Low);
        assert_eq!(server.read(1, 16, false), Ok(b"0".to_vec()));
    }

    #[test]
    fn control_node_and_root_reject_text() {
        let mut server = server();
        opened(&mut server, 1, CONTROL_NODE);
        assert_eq!(server.write(1, b"on"), Err(RequestError::NotSupported));
        assert_eq!(server.read(1, 16, false), Err(RequestError::NotSupported));

        server.open(1, Access::Read, "").unwrap();
        assert_eq!(server.write(1, b"on"), Err(RequestError::PermissionDenied));
    }

    #[test]
    fn enumeration_resumes_across_small_buffers() {
        let mut server = server();
        for budget in [27, 40, 64, 4096] {
            opened(&mut server, 1, "");
            let mut names = Vec::new();
            loop {
                let reply = server.read(1, budget, true).unwrap();
                if reply.is_empty() {
                    break;
                }
                let entries = DirEntry::decode_all(&reply).unwrap();
                names.extend(entries.into_iter().map(|entry| entry.name));
            }
            let expected: Vec<String> = server
                .namespace()
                .entries(0, false)
                .map(|e| e.name)
                .collect();
            assert_eq!(names, expected, "budget {}", budget);
            server.close(1);
        }
    }

    #[test]
    fn requests_decode_through_handle() {
        let mut server = server();
        server.connect(1, PEER);
        let open = Request::Open {
            access: Access::ReadWrite,
            path: "nope".into(),
        };
        assert_eq!(server.handle(1, &open.encode()), Err(RequestError::NotFound));
        assert_eq!(
            server.handle(1, &Request::Write(b"on".to_vec()).encode()),
            Err(RequestError::PermissionDenied)
        );
    }
}
