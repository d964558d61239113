use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use nix::poll::{poll, PollFd, PollFlags};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// A hardware interrupt line the interrupt service thread can block on.
///
/// After `wait` reports an interrupt the line stays masked until `unmask` is called, so the
/// service thread can acknowledge the cause first.
pub trait InterruptLine: Send {
    /// Waits up to `timeout` for the interrupt. Returns `false` if it did not fire.
    fn wait(&mut self, timeout: Duration) -> io::Result<bool>;

    fn unmask(&mut self) -> io::Result<()>;
}

/// Interrupt line exposed through a Linux userspace I/O device (`/dev/uioN`).
///
/// Reading the device returns the interrupt count once the interrupt fires; writing `1`
/// re-enables it.
#[derive(Debug)]
pub struct UioInterrupt {
    file: File,
}

impl UioInterrupt {
    pub fn attach<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut line = Self { file };
        line.unmask()?;
        Ok(line)
    }
}

impl InterruptLine for UioInterrupt {
    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let mut fds = [PollFd::new(&self.file, PollFlags::POLLIN)];
        if poll(&mut fds, millis)? == 0 {
            return Ok(false);
        }

        self.file.read_u32::<NativeEndian>()?;
        Ok(true)
    }

    fn unmask(&mut self) -> io::Result<()> {
        self.file.write_u32::<NativeEndian>(1)
    }
}

/// Interrupt line fired from software, used when the board is simulated.
#[derive(Debug)]
pub struct SoftInterrupt {
    fired: Receiver<()>,
}

/// Handle which fires a `SoftInterrupt`.
#[derive(Debug, Clone)]
pub struct SoftTrigger {
    fire: Sender<()>,
}

pub fn soft_interrupt() -> (SoftInterrupt, SoftTrigger) {
    let (fire, fired) = mpsc::channel();
    (SoftInterrupt { fired }, SoftTrigger { fire })
}

impl SoftTrigger {
    /// Returns `false` once the line has been dropped.
    pub fn fire(&self) -> bool {
        self.fire.send(()).is_ok()
    }
}

impl InterruptLine for SoftInterrupt {
    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        match self.fired.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                Ok(false)
            }
        }
    }

    fn unmask(&mut self) -> io::Result<()> {
        Ok(())
    }
}
