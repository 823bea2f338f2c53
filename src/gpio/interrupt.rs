use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;

use log::{error, warn};

use crate::gpio::cdev::{self, DriverHandle};
use crate::gpio::dispatch::DispatchQueue;
use crate::gpio::mem::{self, GpioMem};
use crate::gpio::{pin, Error, EventCallback, Result, GPIO_OFFSET_GPEDS};

// Share the controller between all input pins holding an event
// registration. It's created by the first registration and torn down when
// the last registered pin goes out of scope.
lazy_static! {
    static ref IRQ_CONTROLLER: Mutex<Weak<Mutex<IrqController>>> = Mutex::new(Weak::new());
}

pub(crate) fn instance() -> Result<Arc<Mutex<IrqController>>> {
    let mut slot = IRQ_CONTROLLER.lock().unwrap();

    if let Some(controller) = slot.upgrade() {
        return Ok(controller);
    }

    let controller = Arc::new(Mutex::new(IrqController::new()?));
    *slot = Arc::downgrade(&controller);

    Ok(controller)
}

#[cfg(test)]
pub(crate) fn instance_released() -> bool {
    IRQ_CONTROLLER.lock().unwrap().upgrade().is_none()
}

// Under test the kernel module is replaced with a mock device; the mock's
// far end is parked here for the test to drive.
#[cfg(test)]
lazy_static! {
    pub(crate) static ref MOCK_DEVICE: Mutex<Option<cdev::mock::MockDevice>> = Mutex::new(None);
}

#[cfg(not(test))]
fn open_driver() -> Result<DriverHandle> {
    DriverHandle::open()
}

#[cfg(test)]
fn open_driver() -> Result<DriverHandle> {
    let (handle, mock) = cdev::mock::MockDevice::pair();
    *MOCK_DEVICE.lock().unwrap() = Some(mock);

    Ok(handle)
}

/// Forwards interrupts raised by the gpiodev kernel module to registered
/// callbacks.
///
/// A single poll thread blocks inside the driver's read and drains one pin
/// number per delivered interrupt; the matching callback is handed to the
/// dispatch queue's worker thread. The poll thread only runs while at least
/// one pin is registered.
pub(crate) struct IrqController {
    driver: Arc<DriverHandle>,
    callbacks: Arc<Mutex<HashMap<u32, EventCallback>>>,
    exit: Arc<AtomicBool>,
    queue: Option<Arc<DispatchQueue>>,
    poll_thread: Option<thread::JoinHandle<()>>,
}

impl IrqController {
    pub(crate) fn new() -> Result<IrqController> {
        Ok(IrqController::with_driver(open_driver()?))
    }

    fn with_driver(driver: DriverHandle) -> IrqController {
        IrqController {
            driver: Arc::new(driver),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            exit: Arc::new(AtomicBool::new(false)),
            queue: Some(Arc::new(DispatchQueue::new())),
            poll_thread: None,
        }
    }

    /// Registers `callback` for interrupts on `pin`, replacing any previous
    /// registration for the same pin.
    pub(crate) fn request_irq(&mut self, pin: u32, callback: EventCallback) -> Result<()> {
        // Attach in the kernel before anything else: the poll thread must
        // never be running while the driver holds no registration, and an
        // event can't be delivered before the map knows the pin.
        self.driver.write_command(cdev::CMD_ATTACH_IRQ, pin)?;

        let mut callbacks = self.callbacks.lock().unwrap();

        if callbacks.is_empty() {
            if let Some(queue) = &self.queue {
                self.exit.store(false, Ordering::SeqCst);

                let driver = self.driver.clone();
                let map = self.callbacks.clone();
                let exit = self.exit.clone();
                let queue = queue.clone();

                self.poll_thread =
                    Some(thread::spawn(move || poll_events(&driver, &map, &exit, &queue)));
            }
        }

        callbacks.insert(pin, callback);

        Ok(())
    }

    /// Releases the registration for `pin`. When the last registration is
    /// gone, the poll thread is woken and joined.
    pub(crate) fn irq_free(&mut self, pin: u32) -> Result<()> {
        self.driver.write_command(cdev::CMD_DETACH_IRQ, pin)?;

        {
            let mut callbacks = self.callbacks.lock().unwrap();
            callbacks.remove(&pin);

            if !callbacks.is_empty() {
                return Ok(());
            }
        }

        self.exit.store(true, Ordering::SeqCst);
        self.driver
            .write_command(cdev::CMD_WAKE_UP, cdev::WAKE_UP_PIN)?;

        if let Some(poll_thread) = self.poll_thread.take() {
            poll_thread
                .join()
                .map_err(|_| Error::Internal("poll thread panicked"))?;
        }

        Ok(())
    }
}

impl Drop for IrqController {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::SeqCst);

        if let Err(err) = self
            .driver
            .write_command(cdev::CMD_WAKE_UP, cdev::WAKE_UP_PIN)
        {
            warn!("wake-up during teardown failed: {}", err);
        }

        if let Some(poll_thread) = self.poll_thread.take() {
            let _ = poll_thread.join();
        }

        // Stop the worker before touching the map; queued callbacks are
        // clones of its entries.
        self.queue.take();

        let mut callbacks = self.callbacks.lock().unwrap();

        for &pin in callbacks.keys() {
            // The driver may already be gone at this point.
            if let Err(err) = self.driver.write_command(cdev::CMD_DETACH_IRQ, pin) {
                warn!("detaching IRQ for pin {} during teardown failed: {}", pin, err);
            }
        }

        callbacks.clear();
    }
}

impl fmt::Debug for IrqController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqController")
            .field("driver", &self.driver)
            .field("callbacks", &format_args!("{{ .. }}"))
            .field("exit", &self.exit)
            .finish()
    }
}

// Poll thread main loop. Almost all wall time is spent blocked inside the
// kernel read; callbacks never run here.
fn poll_events(
    driver: &DriverHandle,
    callbacks: &Mutex<HashMap<u32, EventCallback>>,
    exit: &AtomicBool,
    queue: &DispatchQueue,
) {
    let mut pin = 0u32;

    while !exit.load(Ordering::SeqCst) {
        match driver.read_event(&mut pin) {
            Ok(true) => {}
            // Short read after a wake-up or driver timeout; try again.
            Ok(false) => continue,
            Err(err) => {
                error!("reading GPIO events failed: {}", err);
                return;
            }
        }

        let map = callbacks.lock().unwrap();

        // The wake-up sentinel and pins detached since the interrupt fired
        // miss the map and are dropped here.
        if let Some(callback) = map.get(&pin) {
            let callback = callback.clone();
            drop(map);
            queue.push(callback);
        }
    }
}

/// Event delivery by periodically scanning the event detect status
/// registers, for kernels without the gpiodev module.
///
/// Registration and teardown follow the same contract as the driver-backed
/// controller: callbacks are keyed by pin, re-registering a pin replaces
/// its callback, and the scan thread only runs while the map is non-empty.
/// Detection itself still happens in hardware; [`InputPin::enable_event_detect`]
/// selects which events latch into `GPEDS`.
///
/// [`InputPin::enable_event_detect`]: struct.InputPin.html#method.enable_event_detect
pub struct PolledIrqController {
    mem: &'static GpioMem,
    callbacks: Arc<Mutex<HashMap<u32, EventCallback>>>,
    exit: Arc<AtomicBool>,
    poll_interval: Arc<Mutex<Duration>>,
    queue: Option<Arc<DispatchQueue>>,
    poll_thread: Option<thread::JoinHandle<()>>,
}

impl PolledIrqController {
    /// Default scan period.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(1);

    /// Constructs a new `PolledIrqController`.
    pub fn new() -> Result<PolledIrqController> {
        Ok(PolledIrqController {
            mem: mem::gpio_mem()?,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            exit: Arc::new(AtomicBool::new(false)),
            poll_interval: Arc::new(Mutex::new(Self::DEFAULT_POLL_INTERVAL)),
            queue: Some(Arc::new(DispatchQueue::new())),
            poll_thread: None,
        })
    }

    /// Sets the pause between scans of the event detect status registers.
    ///
    /// Shorter intervals reduce latency and burn more CPU. Takes effect
    /// from the next scan.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        *self.poll_interval.lock().unwrap() = interval;
    }

    /// Registers `callback` to run when an event latches for `pin`,
    /// replacing any previous registration for the same pin.
    pub fn request_irq<C>(&mut self, pin: u8, callback: C) -> Result<()>
    where
        C: FnMut() + Send + 'static,
    {
        if pin as usize >= pin::MAX {
            return Err(Error::PinOutOfRange(pin));
        }

        let mut callbacks = self.callbacks.lock().unwrap();

        if callbacks.is_empty() {
            if let Some(queue) = &self.queue {
                self.exit.store(false, Ordering::SeqCst);

                let mem = self.mem;
                let map = self.callbacks.clone();
                let exit = self.exit.clone();
                let queue = queue.clone();
                let poll_interval = self.poll_interval.clone();

                self.poll_thread = Some(thread::spawn(move || {
                    scan_events(mem, &map, &exit, &queue, &poll_interval)
                }));
            }
        }

        callbacks.insert(u32::from(pin), Arc::new(Mutex::new(callback)));

        Ok(())
    }

    /// Releases the registration for `pin`. When the last registration is
    /// gone, the scan thread is joined.
    pub fn irq_free(&mut self, pin: u8) {
        {
            let mut callbacks = self.callbacks.lock().unwrap();
            callbacks.remove(&u32::from(pin));

            if !callbacks.is_empty() {
                return;
            }
        }

        self.exit.store(true, Ordering::SeqCst);

        if let Some(poll_thread) = self.poll_thread.take() {
            let _ = poll_thread.join();
        }
    }
}

impl Drop for PolledIrqController {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::SeqCst);

        if let Some(poll_thread) = self.poll_thread.take() {
            let _ = poll_thread.join();
        }

        self.queue.take();
        self.callbacks.lock().unwrap().clear();
    }
}

impl fmt::Debug for PolledIrqController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolledIrqController")
            .field("mem", &self.mem)
            .field("callbacks", &format_args!("{{ .. }}"))
            .field("exit", &self.exit)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

// Scan thread main loop: check the GPEDS bit of every registered pin,
// acknowledge what fired and queue the matching callbacks.
fn scan_events(
    mem: &GpioMem,
    callbacks: &Mutex<HashMap<u32, EventCallback>>,
    exit: &AtomicBool,
    queue: &DispatchQueue,
    poll_interval: &Mutex<Duration>,
) {
    while !exit.load(Ordering::SeqCst) {
        {
            let map = callbacks.lock().unwrap();

            for (&pin, callback) in map.iter() {
                let reg = GPIO_OFFSET_GPEDS + (pin / 32) as usize;
                let mask = 1 << (pin % 32);

                if mem.read(reg) & mask != 0 {
                    // Writing 1 acknowledges this pin's latch and leaves
                    // the other pins' pending events alone.
                    mem.write(reg, mask);
                    queue.push(callback.clone());
                }
            }
        }

        let interval = *poll_interval.lock().unwrap();
        thread::sleep(interval);
    }
}
