//! Interface for the BCM2711 GPIO peripheral.
//!
//! To ensure fast performance, rpgpio controls the GPIO peripheral by
//! directly accessing the registers through a shared memory mapping of
//! `/dev/gpiomem`. Event interrupts are delivered by the companion gpiodev
//! kernel module through the `/dev/gpiodev` character device.
//!
//! ## Pins
//!
//! Pins are represented by owned, direction-typed handles. [`OutputPin::new`]
//! configures a pin as an output, [`InputPin::new`] as an input. A handle
//! owns the pin's configuration for as long as it lives: when it goes out of
//! scope, the pin's function select bits are cleared, outputs are driven low,
//! and inputs release any event detection and interrupt registration they
//! set up. Operations that only make sense for one direction only exist on
//! that direction's handle.
//!
//! The library assumes at most one live handle per pin number within the
//! process. Constructing a second handle for the same pin isn't detected,
//! and the resulting register writes will interleave unpredictably.
//!
//! ## Event callbacks
//!
//! [`InputPin::attach_event`] registers a parameterless callback that's
//! executed when the selected [`Event`] fires. The kernel module requests
//! the pin's GPIO IRQ line and forwards each interrupt as a pin number,
//! which a dedicated poll thread picks up and hands to a worker thread.
//! Callbacks for all pins run serially, in delivery order, on that worker
//! thread, so they're free to block or perform I/O without stalling event
//! collection.
//!
//! [`PolledIrqController`] offers the same registration contract without
//! the kernel module, by periodically scanning the event detect status
//! registers instead. This costs CPU time proportional to the poll rate and
//! is intended for kernels where the gpiodev module isn't loaded.
//!
//! ## Examples
//!
//! Blink an LED attached to BCM GPIO 26 whenever the button on GPIO 25
//! pulls the signal down:
//!
//! ```no_run
//! use std::thread;
//! use std::time::Duration;
//!
//! use rpgpio::gpio::{Event, InputPin, OutputPin, Pull};
//!
//! # fn main() -> rpgpio::gpio::Result<()> {
//! let mut led = OutputPin::new(26)?;
//! let mut button = InputPin::new(25)?;
//!
//! button.set_pull(Pull::Up);
//! button.attach_event(Event::FallingEdge, move || {
//!     led.set_high();
//!     thread::sleep(Duration::from_millis(100));
//!     led.set_low();
//! })?;
//!
//! thread::sleep(Duration::from_secs(60));
//! # Ok(())
//! # }
//! ```

use std::error;
use std::fmt;
use std::io;
use std::ops::Not;
use std::result;
use std::sync::{Arc, Mutex};

mod cdev;
mod dispatch;
#[cfg(feature = "hal")]
mod hal;
mod interrupt;
mod mem;
mod pin;

pub use self::interrupt::PolledIrqController;
pub use self::pin::{InputPin, OutputPin};

// Register offsets in 32-bit word units (byte offset / 4), per the BCM2711
// peripheral datasheet. Each group's remaining registers follow the first
// one at consecutive word offsets.
pub(crate) const GPIO_OFFSET_GPFSEL: usize = 0x00 / 4; // function select, 6 registers
pub(crate) const GPIO_OFFSET_GPSET: usize = 0x1C / 4; // output set, 2 registers
pub(crate) const GPIO_OFFSET_GPCLR: usize = 0x28 / 4; // output clear, 2 registers
pub(crate) const GPIO_OFFSET_GPLEV: usize = 0x34 / 4; // pin level, 2 registers
pub(crate) const GPIO_OFFSET_GPEDS: usize = 0x40 / 4; // event detect status, 2 registers
pub(crate) const GPIO_OFFSET_GPREN: usize = 0x4C / 4; // rising edge detect enable, 2 registers
pub(crate) const GPIO_OFFSET_GPFEN: usize = 0x58 / 4; // falling edge detect enable, 2 registers
pub(crate) const GPIO_OFFSET_GPHEN: usize = 0x64 / 4; // high detect enable, 2 registers
pub(crate) const GPIO_OFFSET_GPLEN: usize = 0x70 / 4; // low detect enable, 2 registers
pub(crate) const GPIO_OFFSET_GPAREN: usize = 0x7C / 4; // async rising edge detect enable, 2 registers
pub(crate) const GPIO_OFFSET_GPAFEN: usize = 0x88 / 4; // async falling edge detect enable, 2 registers
pub(crate) const GPIO_OFFSET_PUP_PDN_CNTRL: usize = 0xE4 / 4; // pull-up/pull-down control, 4 registers

// Registered event callbacks are shared between the controller's map, the
// poll thread and the dispatch queue, and may fire more than once.
pub(crate) type EventCallback = Arc<Mutex<dyn FnMut() + Send>>;

// The simulated register page and the controller singleton are shared by
// every test in the process. Pin numbers are unique per test; tests that
// touch the same register words or the singleton take this lock first.
#[cfg(test)]
lazy_static::lazy_static! {
    pub(crate) static ref TEST_REGISTER_GUARD: Mutex<()> = Mutex::new(());
}

/// Errors that can occur when accessing the GPIO peripheral.
#[derive(Debug)]
pub enum Error {
    /// `/dev/gpiomem` or `/dev/gpiodev` could not be opened or mapped.
    ///
    /// Make sure the user has read and write access to `/dev/gpiomem`
    /// (typically by being a member of the `gpio` group), and that the
    /// gpiodev kernel module is loaded when event callbacks are used.
    DeviceOpen(io::Error),
    /// Communicating with the gpiodev kernel module failed.
    ///
    /// The driver didn't accept a full command frame, or reading events
    /// from it failed with an unrecoverable error.
    KernelIo(io::Error),
    /// Pin number not addressed by the BCM2711 register map.
    PinOutOfRange(u8),
    /// Internal inconsistency detected at runtime.
    Internal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::DeviceOpen(ref err) => write!(f, "Unable to open device: {}", err),
            Error::KernelIo(ref err) => write!(f, "Kernel driver I/O error: {}", err),
            Error::PinOutOfRange(pin) => write!(f, "Pin {} is out of range", pin),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl error::Error for Error {}

/// Result type returned from methods that can have `rpgpio::gpio::Error`s.
pub type Result<T> = result::Result<T, Error>;

/// Pin logic levels.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Level {
    Low = 0,
    High = 1,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Low => write!(f, "Low"),
            Level::High => write!(f, "High"),
        }
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl From<bool> for Level {
    fn from(state: bool) -> Level {
        if state {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Built-in pull-up/pull-down resistor states.
///
/// The discriminants are the 2-bit field values of the
/// `GPIO_PUP_PDN_CNTRL` registers.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Pull {
    None = 0b00,
    Up = 0b01,
    Down = 0b10,
}

impl Pull {
    pub(crate) fn from_bits(bits: u32) -> Pull {
        match bits & 0b11 {
            0b01 => Pull::Up,
            0b10 => Pull::Down,
            // 0b11 is reserved and never written by this library.
            _ => Pull::None,
        }
    }
}

impl fmt::Display for Pull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Pull::None => write!(f, "None"),
            Pull::Up => write!(f, "Up"),
            Pull::Down => write!(f, "Down"),
        }
    }
}

/// Pin events that can be detected by the GPIO peripheral.
///
/// The synchronous edge variants are sampled against the GPIO system clock;
/// the asynchronous ones aren't, and can detect pulses shorter than one
/// clock cycle.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Event {
    RisingEdge,
    FallingEdge,
    High,
    Low,
    AsyncRisingEdge,
    AsyncFallingEdge,
}

impl Event {
    // Word offset of the first enable register of this event's group.
    pub(crate) fn enable_offset(self) -> usize {
        match self {
            Event::RisingEdge => GPIO_OFFSET_GPREN,
            Event::FallingEdge => GPIO_OFFSET_GPFEN,
            Event::High => GPIO_OFFSET_GPHEN,
            Event::Low => GPIO_OFFSET_GPLEN,
            Event::AsyncRisingEdge => GPIO_OFFSET_GPAREN,
            Event::AsyncFallingEdge => GPIO_OFFSET_GPAFEN,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Event::RisingEdge => write!(f, "RisingEdge"),
            Event::FallingEdge => write!(f, "FallingEdge"),
            Event::High => write!(f, "High"),
            Event::Low => write!(f, "Low"),
            Event::AsyncRisingEdge => write!(f, "AsyncRisingEdge"),
            Event::AsyncFallingEdge => write!(f, "AsyncFallingEdge"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_conversions() {
        assert_eq!(!Level::Low, Level::High);
        assert_eq!(!Level::High, Level::Low);
        assert_eq!(Level::from(true), Level::High);
        assert_eq!(Level::from(false), Level::Low);
    }

    #[test]
    fn pull_field_codes() {
        assert_eq!(Pull::from_bits(0b00), Pull::None);
        assert_eq!(Pull::from_bits(0b01), Pull::Up);
        assert_eq!(Pull::from_bits(0b10), Pull::Down);
        // Reserved code reads back as no pull.
        assert_eq!(Pull::from_bits(0b11), Pull::None);
    }

    #[test]
    fn event_enable_registers() {
        assert_eq!(Event::RisingEdge.enable_offset(), 0x4C / 4);
        assert_eq!(Event::FallingEdge.enable_offset(), 0x58 / 4);
        assert_eq!(Event::High.enable_offset(), 0x64 / 4);
        assert_eq!(Event::Low.enable_offset(), 0x70 / 4);
        assert_eq!(Event::AsyncRisingEdge.enable_offset(), 0x7C / 4);
        assert_eq!(Event::AsyncFallingEdge.enable_offset(), 0x88 / 4);
    }
}
