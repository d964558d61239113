//! Client side of the GPIO server.
//!
//! A `Session` talks to the control node. Notifications for pins it watches arrive on a
//! private datagram socket drained by a background thread, which hands each one to the
//! callback set with `Session::on_notification`. The thread and its socket are created on
//! first use and torn down when the session is dropped.
//!
//! `Node` handles give access to the textual protocol of pin nodes and to directory
//! listing.
use crate::device::pin::{Function, Level, Pull, Trigger};
use crate::event::{Notification, NotifyTarget};
use crate::pin_map::Pin;
use crate::protocol::{self, Access, DirEntry, Message, Request};
use crate::pwm::PwmMode;
use crate::server::CONTROL_NODE;
use crate::spi::ChipSelect;
use crate::{GpioError, GpioResult, RequestError};
use embedded_hal::digital::v2 as eh;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::socket::{
    getsockopt, recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, UnixCredentials,
};
use std::env;
use std::fs;
use std::io::{self, IoSliceMut};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Where the server listens unless configured otherwise.
pub const DEFAULT_SOCKET: &str = "/run/rpi-gpio.sock";

/// How long the notification thread blocks before checking whether it should stop.
const NOTIFY_POLL: Duration = Duration::from_millis(200);

/// Budget of a single directory read.
const DIR_CHUNK: u32 = 512;

pub type Callback = Box<dyn FnMut(Notification) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_node(socket: &Path, path: &str, access: Access) -> GpioResult<UnixStream> {
    let mut stream = UnixStream::connect(socket).map_err(GpioError::ConnectionFailed)?;
    let open = Request::Open {
        access,
        path: path.to_owned(),
    };
    exchange(&mut stream, &open)?;
    Ok(stream)
}

fn exchange(stream: &mut UnixStream, request: &Request) -> GpioResult<Vec<u8>> {
    protocol::write_frame(stream, &request.encode())?;
    let body = protocol::read_frame(stream)?.ok_or(GpioError::Protocol)?;
    protocol::decode_reply(&body)
        .ok_or(GpioError::Protocol)?
        .map_err(GpioError::Request)
}

fn value(payload: &[u8]) -> GpioResult<u32> {
    protocol::decode_value(payload).ok_or(GpioError::Protocol)
}

/// A connection to the control node.
pub struct Session {
    stream: Mutex<UnixStream>,
    /// Only datagrams sent by this process are taken as notifications.
    server_pid: libc::pid_t,
    connected: AtomicBool,
    callback: Arc<Mutex<Option<Callback>>>,
    listener: Mutex<Option<NotificationListener>>,
}

impl Session {
    /// Connects to the server at its default location.
    pub fn connect() -> GpioResult<Self> {
        Self::connect_to(DEFAULT_SOCKET)
    }

    pub fn connect_to<P: AsRef<Path>>(socket: P) -> GpioResult<Self> {
        let stream = open_node(socket.as_ref(), CONTROL_NODE, Access::ReadWrite)?;
        let server = getsockopt(&stream, sockopt::PeerCredentials)
            .map_err(|err| GpioError::ConnectionFailed(err.into()))?;
        Ok(Self {
            stream: Mutex::new(stream),
            server_pid: server.pid(),
            connected: AtomicBool::new(true),
            callback: Arc::new(Mutex::new(None)),
            listener: Mutex::new(None),
        })
    }

    /// Whether the last exchange with the server went through.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Sets the function called, on the notification thread, for every pin transition.
    pub fn on_notification<F>(&self, callback: F)
    where
        F: FnMut(Notification) + Send + 'static,
    {
        *lock(&self.callback) = Some(Box::new(callback));
    }

    pub fn get_function(&self, pin: Pin) -> GpioResult<Function> {
        let code = value(&self.request(Message::GetFunction { pin: pin.number() })?)?;
        Function::from_code(code).ok_or(GpioError::Protocol)
    }

    /// Changes the function of `pin`, returning the previous one.
    ///
    /// Switching a pin to input also watches it for both edges, so its transitions reach
    /// the notification callback. If another client already watches the pin, the function
    /// is still changed.
    pub fn set_function(&self, pin: Pin, function: Function) -> GpioResult<Function> {
        let previous = value(&self.request(Message::SetFunction {
            pin: pin.number(),
            function: function.code(),
        })?)?;

        if function == Function::Input {
            match self.add_event(pin, Trigger::BOTH_EDGES, 1) {
                Err(GpioError::Request(RequestError::Busy)) => {
                    debug!("GPIO {} is watched by another client", pin)
                }
                other => other?,
            }
        }

        Function::from_code(previous).ok_or(GpioError::Protocol)
    }

    pub fn read(&self, pin: Pin) -> GpioResult<Level> {
        let bit = value(&self.request(Message::Read { pin: pin.number() })?)?;
        Ok(Level::from_bit(bit))
    }

    pub fn write(&self, pin: Pin, level: Level) -> GpioResult<()> {
        self.request(Message::Write {
            pin: pin.number(),
            value: level.bit(),
        })
        .map(|_| ())
    }

    /// Watches `pin` for `trigger`, notifying once every `threshold` transitions.
    pub fn add_event(&self, pin: Pin, trigger: Trigger, threshold: u32) -> GpioResult<()> {
        let target = NotifyTarget::Socket(self.notification_path()?);
        self.request(Message::AddEvent {
            pin: pin.number(),
            trigger: trigger.bits(),
            threshold,
            target,
        })
        .map(|_| ())
    }

    pub fn set_pull(&self, pin: Pin, pull: Pull) -> GpioResult<()> {
        self.request(Message::PullUpDown {
            pin: pin.number(),
            pull: pull as u32,
        })
        .map(|_| ())
    }

    pub fn pwm_setup(
        &self,
        pin: Pin,
        frequency: u32,
        range: u32,
        mode: PwmMode,
    ) -> GpioResult<()> {
        self.request(Message::PwmSetup {
            pin: pin.number(),
            frequency,
            range,
            mode: mode as u32,
        })
        .map(|_| ())
    }

    pub fn pwm_duty(&self, pin: Pin, duty: u32) -> GpioResult<()> {
        self.request(Message::PwmDuty {
            pin: pin.number(),
            duty,
        })
        .map(|_| ())
    }

    pub fn spi_init(&self, clock_divider: u32) -> GpioResult<()> {
        self.request(Message::SpiInit {
            pin: 0,
            clock_divider,
        })
        .map(|_| ())
    }

    /// Writes `output` and reads `read_len` bytes back in one transaction.
    pub fn spi_transfer(
        &self,
        chip_select: ChipSelect,
        output: &[u8],
        read_len: usize,
    ) -> GpioResult<Vec<u8>> {
        self.request(Message::SpiWriteRead {
            pin: 0,
            chip_select: chip_select as u32,
            read_len: read_len as u32,
            data: output.to_vec(),
        })
    }

    /// Configures `pin` as an input and returns an `embedded_hal` handle to it.
    pub fn input_pin(&self, pin: Pin) -> GpioResult<RemoteInputPin<'_>> {
        self.set_function(pin, Function::Input)?;
        Ok(RemoteInputPin { session: self, pin })
    }

    /// Configures `pin` as an output and returns an `embedded_hal` handle to it.
    pub fn output_pin(&self, pin: Pin) -> GpioResult<RemoteOutputPin<'_>> {
        self.set_function(pin, Function::Output)?;
        Ok(RemoteOutputPin { session: self, pin })
    }

    fn request(&self, message: Message) -> GpioResult<Vec<u8>> {
        let request = Request::Message(message.encode()?);
        let result = exchange(&mut lock(&self.stream), &request);
        if let Err(GpioError::Io(_) | GpioError::Protocol) = &result {
            self.connected.store(false, Ordering::Release);
        }
        result
    }

    /// Path of the notification socket, starting its thread on first use.
    fn notification_path(&self) -> GpioResult<PathBuf> {
        let mut listener = lock(&self.listener);
        if listener.is_none() {
            *listener = Some(NotificationListener::start(
                Arc::clone(&self.callback),
                self.server_pid,
            )?);
        }
        listener
            .as_ref()
            .map(|listener| listener.path.clone())
            .ok_or(GpioError::Protocol)
    }
}

/// Background receiver of notifications for one session.
struct NotificationListener {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NotificationListener {
    fn start(callback: Arc<Mutex<Option<Callback>>>, sender: libc::pid_t) -> io::Result<Self> {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let path = env::temp_dir().join(format!(
            "rpi-gpio-{}-{}.sock",
            process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));

        let _ = fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path)?;
        // The server may run as another user.
        fs::set_permissions(&path, fs::Permissions::from_mode(0o622))?;
        socket.set_read_timeout(Some(NOTIFY_POLL))?;
        // Anyone may write to the socket, so every datagram carries its sender.
        setsockopt(&socket, sockopt::PassCred, &true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("gpio-notify".into())
            .spawn(move || receive_loop(socket, sender, callback, &thread_stop))?;

        Ok(Self {
            path,
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = fs::remove_file(&self.path);
    }
}

/// Receives one datagram, returning its length and the pid of its sender.
fn receive(socket: &UnixDatagram, buf: &mut [u8]) -> nix::Result<(usize, Option<libc::pid_t>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut space = nix::cmsg_space!(UnixCredentials);
    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut space),
        MsgFlags::empty(),
    )?;
    let sender = msg.cmsgs().find_map(|cmsg| match cmsg {
        ControlMessageOwned::ScmCredentials(cred) => Some(cred.pid()),
        _ => None,
    });
    Ok((msg.bytes, sender))
}

fn receive_loop(
    socket: UnixDatagram,
    server_pid: libc::pid_t,
    callback: Arc<Mutex<Option<Callback>>>,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 16];
    while !stop.load(Ordering::Acquire) {
        let (len, sender) = match receive(&socket, &mut buf) {
            Ok(received) => received,
            Err(Errno::EAGAIN | Errno::EINTR) => continue,
            Err(err) => {
                warn!("notification socket failed: {}", err);
                break;
            }
        };

        if sender != Some(server_pid) {
            debug!("ignoring datagram from pid {:?}", sender);
            continue;
        }
        match Notification::decode(&buf[..len]) {
            Some(notification) => {
                if let Some(callback) = lock(&callback).as_mut() {
                    callback(notification);
                }
            }
            None => debug!("ignoring malformed notification of {} bytes", len),
        }
    }
}

/// A node opened for the textual protocol or for listing the directory.
#[derive(Debug)]
pub struct Node {
    stream: UnixStream,
}

impl Node {
    /// Opens `path` relative to the server's mount point. The empty path is the directory.
    pub fn open<P: AsRef<Path>>(socket: P, path: &str, access: Access) -> GpioResult<Self> {
        Ok(Self {
            stream: open_node(socket.as_ref(), path, access)?,
        })
    }

    /// Sends a textual command (`out`, `in`, `on`, `off`) to a pin node.
    pub fn command(&mut self, command: &str) -> GpioResult<()> {
        exchange(&mut self.stream, &Request::Write(command.as_bytes().to_vec())).map(|_| ())
    }

    /// Reads the level of an input pin node. Returns `None` once the level has been read.
    pub fn read_level(&mut self) -> GpioResult<Option<Level>> {
        let reply = self.read(1, false)?;
        match reply.first() {
            None => Ok(None),
            Some(b'0') => Ok(Some(Level::Low)),
            Some(b'1') => Ok(Some(Level::High)),
            Some(_) => Err(GpioError::Protocol),
        }
    }

    /// Lists the remaining directory entries.
    pub fn read_dir(&mut self, stat: bool) -> GpioResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        loop {
            let reply = self.read(DIR_CHUNK, stat)?;
            if reply.is_empty() {
                return Ok(entries);
            }
            entries.extend(DirEntry::decode_all(&reply).ok_or(GpioError::Protocol)?);
        }
    }

    pub fn read(&mut self, nbytes: u32, stat: bool) -> GpioResult<Vec<u8>> {
        exchange(&mut self.stream, &Request::Read { nbytes, stat })
    }
}

/// A pin of a remote board configured as an input.
#[derive(Clone, Copy)]
pub struct RemoteInputPin<'session> {
    session: &'session Session,
    pin: Pin,
}

/// A pin of a remote board configured as an output.
#[derive(Clone, Copy)]
pub struct RemoteOutputPin<'session> {
    session: &'session Session,
    pin: Pin,
}

impl<'session> RemoteInputPin<'session> {
    pub fn pin(&self) -> Pin {
        self.pin
    }

    pub fn into_output(self) -> GpioResult<RemoteOutputPin<'session>> {
        self.session.output_pin(self.pin)
    }

    pub fn get_value(&self) -> GpioResult<Level> {
        self.session.read(self.pin)
    }
}

impl<'session> RemoteOutputPin<'session> {
    pub fn pin(&self) -> Pin {
        self.pin
    }

    pub fn into_input(self) -> GpioResult<RemoteInputPin<'session>> {
        self.session.input_pin(self.pin)
    }

    pub fn set_value(&mut self, level: Level) -> GpioResult<()> {
        self.session.write(self.pin, level)
    }
}

impl<'session> eh::InputPin for RemoteInputPin<'session> {
    type Error = GpioError;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(self.get_value()? == Level::High)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        self.is_high().map(|v| !v)
    }
}

impl<'session> eh::OutputPin for RemoteOutputPin<'session> {
    type Error = GpioError;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_value(Level::Low)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set_value(Level::High)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn unreachable_server_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Session::connect_to(dir.path().join("missing.sock")),
            Err(GpioError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn listener_relays_and_cleans_up() {
        let callback: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();
        *lock(&callback) = Some(Box::new(move |notification| {
            let _ = tx.send(notification);
        }));

        let listener =
            NotificationListener::start(Arc::clone(&callback), process::id() as libc::pid_t)
                .unwrap();
        let path = listener.path.clone();
        let notification = Notification {
            pin: Pin::new(12).unwrap(),
            level: Level::Low,
        };
        UnixDatagram::unbound()
            .unwrap()
            .send_to(&notification.encode(), &path)
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(notification));
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn listener_ignores_other_senders() {
        let callback: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();
        *lock(&callback) = Some(Box::new(move |notification| {
            let _ = tx.send(notification);
        }));

        let elsewhere = process::id() as libc::pid_t + 1;
        let listener = NotificationListener::start(Arc::clone(&callback), elsewhere).unwrap();
        let notification = Notification {
            pin: Pin::new(3).unwrap(),
            level: Level::High,
        };
        UnixDatagram::unbound()
            .unwrap()
            .send_to(&notification.encode(), &listener.path)
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }
}
