//! Interrupt-driven pin event detection.
//!
//! `Events` owns a table with one entry per pin recording which client armed the pin, for
//! which conditions, and where notifications go. A dedicated interrupt service thread drains
//! the hardware's pending-event bits and dispatches them against the table.
//!
//! Locking discipline: the table mutex is held only while the table is read or mutated,
//! never while waiting on the interrupt line or programming detection registers.
use crate::device::error::{DeviceError, RequestError};
use crate::device::pin::{Gpio, Trigger};
use crate::pin_map::{Pin, MAX_PINS};
use crate::ClientId;
use log::{debug, error, info, trace, warn};
use std::io;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

mod interrupt;
mod notify;

pub use interrupt::{soft_interrupt, InterruptLine, SoftInterrupt, SoftTrigger, UioInterrupt};
pub use notify::{Endpoint, Notification, NotifyTarget, TARGET_CAPACITY};

/// How long the service thread blocks on the line before re-checking for shutdown.
const WAIT_SLICE: Duration = Duration::from_millis(100);

const NO_OWNER: u64 = 0;

/// A request to arm a pin for notification.
#[derive(Debug, Clone)]
pub struct Registration {
    pub pin: Pin,
    pub trigger: Trigger,
    /// Transitions needed per notification. Zero is treated as one.
    pub threshold: u32,
    pub target: Endpoint,
}

#[derive(Debug, Default, Clone)]
struct EventEntry {
    owner: Option<ClientId>,
    trigger: Trigger,
    count: u32,
    threshold: u32,
    match_count: u32,
    target: Endpoint,
}

#[derive(Debug)]
pub struct Events {
    gpio: Arc<Gpio>,
    table: Mutex<Vec<EventEntry>>,
    /// Mirror of each entry's owner, readable without the table lock.
    owners: Vec<AtomicU64>,
}

impl Events {
    /// Creates an empty table and disables detection on every pin.
    pub fn new(gpio: Arc<Gpio>) -> Self {
        gpio.reset_detection();
        Self {
            gpio,
            table: Mutex::new(vec![EventEntry::default(); MAX_PINS as usize]),
            owners: (0..MAX_PINS).map(|_| AtomicU64::new(NO_OWNER)).collect(),
        }
    }

    /// Arms `registration.pin` for `client`.
    ///
    /// Fails with `Busy` if another client owns the pin. A client re-registering its own pin
    /// replaces the previous registration and resets its counters.
    pub fn register(
        &self,
        client: ClientId,
        registration: Registration,
    ) -> Result<(), RequestError> {
        let Registration {
            pin,
            trigger,
            threshold,
            target,
        } = registration;

        // Optimistic check, repeated under the lock.
        let owner = self.owners[pin.index()].load(Ordering::Acquire);
        if owner != NO_OWNER && owner != client {
            return Err(RequestError::Busy);
        }

        {
            let mut table = self.table();
            let entry = &mut table[pin.index()];
            if entry.owner.map_or(false, |owner| owner != client) {
                return Err(RequestError::Busy);
            }

            *entry = EventEntry {
                owner: Some(client),
                trigger,
                count: 0,
                threshold: threshold.max(1),
                match_count: 0,
                target,
            };
            self.owners[pin.index()].store(client, Ordering::Release);
        }

        // The entry is committed before arming, so the first transition is not lost.
        self.gpio.arm(pin, trigger);

        info!(
            "client {} added event {:#x} for GPIO {}",
            client,
            trigger.bits(),
            pin
        );
        Ok(())
    }

    /// Disarms and forgets every pin owned by `client`.
    pub fn deregister_all(&self, client: ClientId) {
        let owned: Vec<Pin> = Pin::all()
            .filter(|pin| self.owners[pin.index()].load(Ordering::Acquire) == client)
            .collect();
        if owned.is_empty() {
            return;
        }

        for &pin in &owned {
            self.gpio.disarm(pin);
        }

        let mut table = self.table();
        for pin in owned {
            if table[pin.index()].owner == Some(client) {
                table[pin.index()] = EventEntry::default();
                self.owners[pin.index()].store(NO_OWNER, Ordering::Release);
            }
        }

        info!("removed events for client {}", client);
    }

    pub fn owner(&self, pin: Pin) -> Option<ClientId> {
        self.table()[pin.index()].owner
    }

    /// Total transitions seen on `pin` since it was last registered.
    pub fn transition_count(&self, pin: Pin) -> u32 {
        self.table()[pin.index()].count
    }

    /// Dispatches one detected transition for every bit set in `pending`.
    pub fn dispatch_pending(&self, pending: u64) {
        if pending == 0 {
            return;
        }

        let mut table = self.table();
        for pin in Pin::all().filter(|pin| pending & (1 << pin.index()) != 0) {
            self.dispatch(&mut table[pin.index()], pin);
        }
    }

    fn dispatch(&self, entry: &mut EventEntry, pin: Pin) {
        if entry.trigger.is_empty() {
            return;
        }

        let notification = Notification {
            pin,
            level: self.gpio.read(pin),
        };

        entry.count = entry.count.wrapping_add(1);
        entry.match_count += 1;
        if entry.match_count < entry.threshold {
            return;
        }
        entry.match_count = 0;

        match entry.target.deliver(notification) {
            Ok(()) => trace!("delivered {} for GPIO {}", notification.value(), pin),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!("notification queue full, dropped event for GPIO {}", pin)
            }
            Err(err) => {
                // Disable future deliveries to this client.
                entry.trigger = Trigger::NONE;
                warn!(
                    "failed to deliver event for GPIO {} to client {:?}: {}",
                    pin, entry.owner, err
                );
            }
        }
    }

    /// Starts the interrupt service thread on `line`.
    ///
    /// The thread must preempt the request loop to drain transitions promptly, so it asks for
    /// `SCHED_FIFO` at `priority`. If the scheduler refuses, the thread keeps running at the
    /// default priority and a warning is logged.
    pub fn start_service(
        self: &Arc<Self>,
        line: Box<dyn InterruptLine>,
        priority: Option<i32>,
    ) -> Result<InterruptService, DeviceError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let events = Arc::clone(self);
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("gpio-ist".into())
            .spawn(move || {
                let _ = ready_tx.send(priority.map(raise_priority));
                events.service(line, &thread_stop);
            })
            .map_err(DeviceError::ThreadSpawnFailed)?;

        match ready_rx.recv() {
            Ok(Some(Err(err))) => warn!("interrupt thread runs at default priority: {}", err),
            Ok(Some(Ok(()))) => debug!("interrupt thread priority raised"),
            _ => {}
        }

        Ok(InterruptService {
            stop,
            thread: Some(thread),
        })
    }

    fn service(&self, mut line: Box<dyn InterruptLine>, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            match line.wait(WAIT_SLICE) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("waiting for GPIO interrupt failed: {}", err);
                    process::abort();
                }
            }

            // Acknowledge before unmasking, or the line fires again straight away.
            let pending = self.gpio.take_pending();
            trace!("events detected: {:#018x}", pending);
            self.dispatch_pending(pending);

            if let Err(err) = line.unmask() {
                error!("failed to unmask GPIO interrupt: {}", err);
                process::abort();
            }
        }
    }

    fn table(&self) -> MutexGuard<'_, Vec<EventEntry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn raise_priority(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pthread_self always names the calling thread and param outlives the call.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Handle of the running interrupt service thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct InterruptService {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for InterruptService {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::pin::tests::{raise_event, set_level, simulated_gpio};
    use crate::device::pin::Level;
    use crate::device::Device;
    use std::os::unix::net::UnixDatagram;
    use std::path::Path;

    fn pin(n: u32) -> Pin {
        Pin::new(n).unwrap()
    }

    fn events() -> Arc<Events> {
        let gpio = Arc::new(simulated_gpio(Device::DEFAULT_BASE_ADDR));
        Arc::new(Events::new(gpio))
    }

    fn listener(dir: &Path, name: &str) -> (UnixDatagram, NotifyTarget) {
        let path = dir.join(name);
        let socket = UnixDatagram::bind(&path).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (socket, NotifyTarget::Socket(path))
    }

    fn registration(n: u32, threshold: u32, target: NotifyTarget) -> Registration {
        Registration {
            pin: pin(n),
            trigger: Trigger::BOTH_EDGES,
            threshold,
            target: Endpoint::open(&target, 0).unwrap(),
        }
    }

    fn received(socket: &UnixDatagram) -> Notification {
        let mut buf = [0u8; 16];
        let len = socket.recv(&mut buf).unwrap();
        Notification::decode(&buf[..len]).unwrap()
    }

    fn pending_count(socket: &UnixDatagram) -> usize {
        socket.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 16];
        let mut count = 0;
        while socket.recv(&mut buf).is_ok() {
            count += 1;
        }
        count
    }

    #[test]
    fn second_client_is_busy_until_owner_leaves() {
        let events = events();
        events
            .register(1, registration(6, 1, NotifyTarget::None))
            .unwrap();
        assert_eq!(
            events.register(2, registration(6, 1, NotifyTarget::None)),
            Err(RequestError::Busy)
        );

        events.deregister_all(1);
        assert_eq!(events.owner(pin(6)), None);
        events
            .register(2, registration(6, 1, NotifyTarget::None))
            .unwrap();
        assert_eq!(events.owner(pin(6)), Some(2));
    }

    #[test]
    fn owner_may_re_register() {
        let events = events();
        events
            .register(1, registration(6, 1, NotifyTarget::None))
            .unwrap();
        events.dispatch_pending(1 << 6);
        events
            .register(1, registration(6, 4, NotifyTarget::None))
            .unwrap();
        assert_eq!(events.transition_count(pin(6)), 0);
    }

    #[test]
    fn threshold_batches_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, target) = listener(dir.path(), "notify.sock");
        let events = events();
        events.register(1, registration(9, 3, target)).unwrap();

        for _ in 0..7 {
            events.dispatch_pending(1 << 9);
        }

        assert_eq!(pending_count(&socket), 2);
        assert_eq!(events.transition_count(pin(9)), 7);
    }

    #[test]
    fn zero_threshold_notifies_every_transition() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, target) = listener(dir.path(), "notify.sock");
        let events = events();
        events.register(1, registration(9, 0, target)).unwrap();

        for _ in 0..4 {
            events.dispatch_pending(1 << 9);
        }
        assert_eq!(pending_count(&socket), 4);
    }

    #[test]
    fn failed_delivery_disables_the_pin() {
        let dir = tempfile::tempdir().unwrap();
        let events = events();
        let (socket, target) = listener(dir.path(), "gone.sock");
        events.register(1, registration(2, 1, target)).unwrap();
        drop(socket);

        events.dispatch_pending(1 << 2);
        events.dispatch_pending(1 << 2);

        assert_eq!(events.transition_count(pin(2)), 1);
        // The pin stays claimed until its owner goes away.
        assert_eq!(
            events.register(2, registration(2, 1, NotifyTarget::None)),
            Err(RequestError::Busy)
        );
    }

    #[test]
    fn unregistered_pins_are_ignored() {
        let events = events();
        events.dispatch_pending(u64::MAX);
        assert!(Pin::all().all(|p| events.transition_count(p) == 0));
    }

    #[test]
    fn service_thread_delivers_levels() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, target) = listener(dir.path(), "notify.sock");
        let gpio = Arc::new(simulated_gpio(Device::DEFAULT_BASE_ADDR));
        let events = Arc::new(Events::new(Arc::clone(&gpio)));
        let (line, trigger) = soft_interrupt();
        let _service = events.start_service(Box::new(line), None).unwrap();

        events.register(1, registration(22, 1, target)).unwrap();

        set_level(&gpio, pin(22), Level::High);
        raise_event(&gpio, pin(22));
        assert!(trigger.fire());
        let rising = received(&socket);
        assert_eq!(rising.value(), 22);
        assert_eq!(rising.level, Level::High);

        set_level(&gpio, pin(22), Level::Low);
        raise_event(&gpio, pin(22));
        assert!(trigger.fire());
        assert_eq!(received(&socket).value(), -22);
        assert_eq!(gpio.take_pending(), 0);
    }

    #[test]
    fn transitions_reach_only_the_pin_owner() {
        let dir = tempfile::tempdir().unwrap();
        let (first, first_target) = listener(dir.path(), "first.sock");
        let (second, second_target) = listener(dir.path(), "second.sock");
        let gpio = Arc::new(simulated_gpio(Device::DEFAULT_BASE_ADDR));
        let events = Arc::new(Events::new(Arc::clone(&gpio)));
        let (line, trigger) = soft_interrupt();
        let _service = events.start_service(Box::new(line), None).unwrap();

        events.register(1, registration(4, 1, first_target)).unwrap();
        events.register(2, registration(5, 1, second_target)).unwrap();

        set_level(&gpio, pin(4), Level::High);
        raise_event(&gpio, pin(4));
        assert!(trigger.fire());
        assert_eq!(received(&first).value(), 4);

        set_level(&gpio, pin(5), Level::High);
        raise_event(&gpio, pin(5));
        assert!(trigger.fire());
        assert_eq!(received(&second).value(), 5);

        assert_eq!(pending_count(&first), 0);
        assert_eq!(pending_count(&second), 0);
        assert_eq!(events.transition_count(pin(4)), 1);
        assert_eq!(events.transition_count(pin(5)), 1);
    }
}
