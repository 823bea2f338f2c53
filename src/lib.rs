//! rpgpio provides user-space access to the GPIO peripheral of the BCM2711,
//! the SoC used on the Raspberry Pi 4.
//!
//! Pin state is controlled by directly accessing the GPIO registers through
//! a memory mapping of `/dev/gpiomem`. Interrupt-driven event callbacks are
//! delivered through `/dev/gpiodev`, the character device exposed by the
//! companion gpiodev kernel module, which requests and frees kernel GPIO
//! IRQ lines on the library's behalf.
//!
//! rpgpio requires Raspberry Pi OS or any similar, recent, Linux
//! distribution. Pins are addressed by their BCM GPIO pin numbers, rather
//! than their physical location on the GPIO header.

// Used by rustdoc to link other crates to rpgpio's docs
#![doc(html_root_url = "https://docs.rs/rpgpio/0.3.0")]

#[macro_use]
mod macros;

pub mod gpio;
