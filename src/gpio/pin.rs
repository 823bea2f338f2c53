use std::sync::{Arc, Mutex};

use log::warn;

use crate::gpio::interrupt::{self, IrqController};
use crate::gpio::mem::{self, GpioMem};
use crate::gpio::{
    Error, Event, Level, Pull, Result, GPIO_OFFSET_GPCLR, GPIO_OFFSET_GPFSEL, GPIO_OFFSET_GPLEV,
    GPIO_OFFSET_GPSET, GPIO_OFFSET_PUP_PDN_CNTRL,
};

// Number of GPIOs addressed by the BCM2711's register map. Only a subset is
// routed to the Pi 4's GPIO header.
pub(crate) const MAX: usize = 58;

// Function select field values for the two supported directions.
const FSEL_INPUT: u32 = 0b000;
const FSEL_OUTPUT: u32 = 0b001;

// Each function select register packs ten 3-bit fields.
fn fsel_reg(pin: u8) -> usize {
    GPIO_OFFSET_GPFSEL + (pin / 10) as usize
}

fn fsel_shift(pin: u8) -> u32 {
    3 * u32::from(pin % 10)
}

fn clear_fsel(mem: &GpioMem, pin: u8) {
    let reg = fsel_reg(pin);
    let value = mem.read(reg);

    mem.write(reg, value & !(0b111 << fsel_shift(pin)));
}

fn set_fsel(mem: &GpioMem, pin: u8, function: u32) {
    // Clear the field before setting it; pins can be re-initialised, and
    // OR-ing onto stale bits yields the wrong function code.
    let reg = fsel_reg(pin);
    let value = mem.read(reg) & !(0b111 << fsel_shift(pin));

    mem.write(reg, value | (function << fsel_shift(pin)));
}

/// GPIO pin configured as an output.
///
/// Constructing an `OutputPin` selects the output function for the pin;
/// dropping it drives the pin low and clears the function select bits.
#[derive(Debug)]
pub struct OutputPin {
    pin: u8,
    bit_mask: u32,
    set_reg: usize,
    clr_reg: usize,
    mem: &'static GpioMem,
}

impl OutputPin {
    /// Configures the pin with BCM GPIO number `pin` as an output.
    pub fn new(pin: u8) -> Result<OutputPin> {
        if pin as usize >= MAX {
            return Err(Error::PinOutOfRange(pin));
        }

        let mem = mem::gpio_mem()?;
        set_fsel(mem, pin, FSEL_OUTPUT);

        let reg_index = (pin / 32) as usize;

        Ok(OutputPin {
            pin,
            bit_mask: 1 << (pin % 32),
            set_reg: GPIO_OFFSET_GPSET + reg_index,
            clr_reg: GPIO_OFFSET_GPCLR + reg_index,
            mem,
        })
    }

    /// Returns the pin's BCM GPIO number.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Sets the pin's output state.
    pub fn write(&mut self, level: Level) {
        match level {
            Level::Low => self.set_low(),
            Level::High => self.set_high(),
        }
    }

    /// Drives the pin high.
    #[inline]
    pub fn set_high(&mut self) {
        let value = self.mem.read(self.set_reg);
        self.mem.write(self.set_reg, value | self.bit_mask);
    }

    /// Drives the pin low.
    #[inline]
    pub fn set_low(&mut self) {
        let value = self.mem.read(self.clr_reg);
        self.mem.write(self.clr_reg, value | self.bit_mask);
    }
}

impl Drop for OutputPin {
    fn drop(&mut self) {
        // Turn the output off before releasing the pin.
        let value = self.mem.read(self.clr_reg);
        self.mem.write(self.clr_reg, value | self.bit_mask);

        clear_fsel(self.mem, self.pin);
    }
}

/// GPIO pin configured as an input.
///
/// Constructing an `InputPin` selects the input function for the pin. On
/// drop, every event detect bit the handle enabled is cleared, a registered
/// interrupt callback is released, the pull resistor is set to pull-down
/// and the function select bits are cleared.
#[derive(Debug)]
pub struct InputPin {
    pin: u8,
    bit_mask: u32,
    lev_reg: usize,
    event_regs: Vec<usize>,
    irq: Option<Arc<Mutex<IrqController>>>,
    mem: &'static GpioMem,
}

impl InputPin {
    /// Configures the pin with BCM GPIO number `pin` as an input.
    pub fn new(pin: u8) -> Result<InputPin> {
        if pin as usize >= MAX {
            return Err(Error::PinOutOfRange(pin));
        }

        let mem = mem::gpio_mem()?;
        set_fsel(mem, pin, FSEL_INPUT);

        Ok(InputPin {
            pin,
            bit_mask: 1 << (pin % 32),
            lev_reg: GPIO_OFFSET_GPLEV + (pin / 32) as usize,
            event_regs: Vec::new(),
            irq: None,
            mem,
        })
    }

    /// Returns the pin's BCM GPIO number.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Reads the pin's logic level.
    pub fn read(&self) -> Level {
        if (self.mem.read(self.lev_reg) >> (self.pin % 32)) & 1 == 0 {
            Level::Low
        } else {
            Level::High
        }
    }

    pub fn is_low(&self) -> bool {
        self.read() == Level::Low
    }

    pub fn is_high(&self) -> bool {
        self.read() == Level::High
    }

    /// Selects the pin's built-in pull resistor.
    pub fn set_pull(&mut self, pull: Pull) {
        // Each pull control register packs sixteen 2-bit fields.
        let reg = GPIO_OFFSET_PUP_PDN_CNTRL + (self.pin / 16) as usize;
        let shift = 2 * u32::from(self.pin % 16);

        let value = self.mem.read(reg) & !(0b11 << shift);
        self.mem.write(reg, value | ((pull as u32) << shift));
    }

    /// Reads back the pin's pull resistor state.
    pub fn get_pull(&self) -> Pull {
        let reg = GPIO_OFFSET_PUP_PDN_CNTRL + (self.pin / 16) as usize;
        let shift = 2 * u32::from(self.pin % 16);

        Pull::from_bits(self.mem.read(reg) >> shift)
    }

    /// Turns on hardware detection of `event` for this pin.
    ///
    /// Detected events latch the pin's bit in the event detect status
    /// register, where a [`PolledIrqController`] scan picks them up. There
    /// is no need to call this before [`attach_event`]; it enables
    /// detection itself.
    ///
    /// The handle remembers which enable registers it touched and clears
    /// only those bits on drop, leaving enable bits owned by others alone.
    ///
    /// [`PolledIrqController`]: struct.PolledIrqController.html
    /// [`attach_event`]: #method.attach_event
    pub fn enable_event_detect(&mut self, event: Event) {
        let reg = event.enable_offset() + (self.pin / 32) as usize;

        let value = self.mem.read(reg) & !self.bit_mask;
        self.mem.write(reg, value | self.bit_mask);

        if !self.event_regs.contains(&reg) {
            self.event_regs.push(reg);
        }
    }

    /// Registers `callback` to run when `event` is detected on this pin.
    ///
    /// The kernel module requests the pin's GPIO IRQ line; when it fires,
    /// `callback` is executed on the library's worker thread. Callbacks for
    /// all pins share that thread and run serially, in delivery order, so
    /// they may block without stalling event collection. A pin holds at
    /// most one callback; attaching again replaces the previous one.
    ///
    /// On failure the pin stays usable, but without event delivery.
    pub fn attach_event<C>(&mut self, event: Event, callback: C) -> Result<()>
    where
        C: FnMut() + Send + 'static,
    {
        let controller = interrupt::instance()?;

        controller
            .lock()
            .unwrap()
            .request_irq(u32::from(self.pin), Arc::new(Mutex::new(callback)))?;

        self.enable_event_detect(event);
        self.irq = Some(controller);

        Ok(())
    }
}

impl Drop for InputPin {
    fn drop(&mut self) {
        // Clear only the event detect enables this handle set; foreign
        // writers of the same registers keep theirs.
        for &reg in &self.event_regs {
            let value = self.mem.read(reg);
            self.mem.write(reg, value & !self.bit_mask);
        }

        if let Some(controller) = self.irq.take() {
            if let Err(err) = controller.lock().unwrap().irq_free(u32::from(self.pin)) {
                warn!("releasing the IRQ for pin {} failed: {}", self.pin, err);
            }
        }

        self.set_pull(Pull::Down);
        clear_fsel(self.mem, self.pin);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::gpio::{GPIO_OFFSET_GPFEN, TEST_REGISTER_GUARD};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn fsel_field(mem: &GpioMem, pin: u8) -> u32 {
        (mem.read(fsel_reg(pin)) >> fsel_shift(pin)) & 0b111
    }

    fn pull_field(mem: &GpioMem, pin: u8) -> u32 {
        (mem.read(GPIO_OFFSET_PUP_PDN_CNTRL + (pin / 16) as usize) >> (2 * (pin % 16) as u32))
            & 0b11
    }

    #[test]
    fn output_lifecycle() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();
        let mem = mem::gpio_mem().unwrap();

        let mut output = OutputPin::new(26).unwrap();
        assert_eq!(fsel_field(mem, 26), FSEL_OUTPUT);

        output.set_high();
        assert_ne!(mem.read(GPIO_OFFSET_GPSET) & (1 << 26), 0);

        output.set_low();
        assert_ne!(mem.read(GPIO_OFFSET_GPCLR) & (1 << 26), 0);

        drop(output);
        assert_eq!(fsel_field(mem, 26), 0b000);
        assert_ne!(mem.read(GPIO_OFFSET_GPCLR) & (1 << 26), 0);
    }

    #[test]
    fn write_accepts_levels() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();
        let mem = mem::gpio_mem().unwrap();

        let mut output = OutputPin::new(19).unwrap();

        output.write(Level::from(true));
        assert_ne!(mem.read(GPIO_OFFSET_GPSET) & (1 << 19), 0);

        // Repeating a write leaves the registers in the same state.
        let set_before = mem.read(GPIO_OFFSET_GPSET);
        output.write(Level::High);
        output.write(Level::High);
        assert_eq!(mem.read(GPIO_OFFSET_GPSET), set_before);
    }

    #[test]
    fn every_pin_maps_to_the_right_fsel_field() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();
        let mem = mem::gpio_mem().unwrap();

        for pin in 0..MAX as u8 {
            let output = OutputPin::new(pin).unwrap();
            assert_eq!(fsel_field(mem, pin), FSEL_OUTPUT, "pin {}", pin);
            drop(output);
            assert_eq!(fsel_field(mem, pin), 0b000, "pin {}", pin);
            assert_ne!(
                mem.read(GPIO_OFFSET_GPCLR + (pin / 32) as usize) & (1 << (pin % 32)),
                0,
                "pin {}",
                pin
            );
        }
    }

    #[test]
    fn every_event_enable_is_cleared_on_drop() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();
        let mem = mem::gpio_mem().unwrap();

        let events = [
            Event::RisingEdge,
            Event::FallingEdge,
            Event::High,
            Event::Low,
            Event::AsyncRisingEdge,
            Event::AsyncFallingEdge,
        ];

        for pin in 0..MAX as u8 {
            let mut input = InputPin::new(pin).unwrap();

            for event in events {
                input.enable_event_detect(event);
                assert_ne!(
                    mem.read(event.enable_offset() + (pin / 32) as usize) & (1 << (pin % 32)),
                    0,
                    "pin {} event {}",
                    pin,
                    event
                );
            }

            drop(input);

            for event in events {
                assert_eq!(
                    mem.read(event.enable_offset() + (pin / 32) as usize) & (1 << (pin % 32)),
                    0,
                    "pin {} event {}",
                    pin,
                    event
                );
            }
        }
    }

    #[test]
    fn word_boundaries() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();
        let mem = mem::gpio_mem().unwrap();

        // Pins on either side of every word boundary in the register map.
        for pin in [0u8, 9, 10, 31, 32, 57] {
            let mut output = OutputPin::new(pin).unwrap();
            output.set_high();
            assert_ne!(
                mem.read(GPIO_OFFSET_GPSET + (pin / 32) as usize) & (1 << (pin % 32)),
                0,
                "pin {}",
                pin
            );
            drop(output);

            let mut input = InputPin::new(pin).unwrap();
            input.set_pull(Pull::Up);
            assert_eq!(pull_field(mem, pin), Pull::Up as u32, "pin {}", pin);

            assert_eq!(input.read(), Level::Low, "pin {}", pin);
            mem.raise(GPIO_OFFSET_GPLEV + (pin / 32) as usize, 1 << (pin % 32));
            assert_eq!(input.read(), Level::High, "pin {}", pin);
            mem.write(GPIO_OFFSET_GPLEV + (pin / 32) as usize, 0);
        }
    }

    #[test]
    fn pull_up_register_layout() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();
        let mem = mem::gpio_mem().unwrap();

        let mut input = InputPin::new(25).unwrap();
        input.set_pull(Pull::Up);

        // Pin 25 lives in the second pull register, field 9.
        assert_eq!(
            (mem.read(0xE8 / 4) >> (2 * 9)) & 0b11,
            Pull::Up as u32
        );
        assert_eq!(input.get_pull(), Pull::Up);
    }

    #[test]
    fn pull_roundtrip() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();

        let mut input = InputPin::new(33).unwrap();

        for pull in [Pull::None, Pull::Up, Pull::Down] {
            input.set_pull(pull);
            assert_eq!(input.get_pull(), pull);
        }
    }

    #[test]
    fn dropped_input_pulls_down() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();
        let mem = mem::gpio_mem().unwrap();

        let mut input = InputPin::new(34).unwrap();
        input.set_pull(Pull::Up);
        drop(input);

        assert_eq!(pull_field(mem, 34), Pull::Down as u32);
    }

    #[test]
    fn out_of_range_pins_are_rejected() {
        assert!(matches!(OutputPin::new(58), Err(Error::PinOutOfRange(58))));
        assert!(matches!(InputPin::new(255), Err(Error::PinOutOfRange(255))));
    }

    #[test]
    fn attach_event_fires_callback_off_thread() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();
        let mem = mem::gpio_mem().unwrap();

        let mut input = InputPin::new(23).unwrap();
        let (tx, fired) = mpsc::channel();

        input
            .attach_event(Event::FallingEdge, move || {
                tx.send(thread::current().id()).unwrap();
            })
            .unwrap();

        // Falling edge detection is enabled for the pin.
        assert_ne!(mem.read(GPIO_OFFSET_GPFEN) & (1 << 23), 0);

        interrupt::MOCK_DEVICE.lock().unwrap().as_mut().unwrap().inject(23);

        let worker_id = fired.recv_timeout(TIMEOUT).unwrap();
        assert_ne!(worker_id, thread::current().id());
        assert!(fired.recv_timeout(Duration::from_millis(100)).is_err());

        drop(input);
        assert_eq!(mem.read(GPIO_OFFSET_GPFEN) & (1 << 23), 0);
        assert!(interrupt::instance_released());
    }

    #[test]
    fn reattach_replaces_callback() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();

        let mut input = InputPin::new(13).unwrap();
        let (old_tx, old_fired) = mpsc::channel();
        let (new_tx, new_fired) = mpsc::channel();

        input
            .attach_event(Event::RisingEdge, move || old_tx.send(()).unwrap())
            .unwrap();
        input
            .attach_event(Event::RisingEdge, move || new_tx.send(()).unwrap())
            .unwrap();

        interrupt::MOCK_DEVICE.lock().unwrap().as_mut().unwrap().inject(13);

        new_fired.recv_timeout(TIMEOUT).unwrap();
        assert!(old_fired.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();

        let mut faulty = InputPin::new(14).unwrap();
        let mut healthy = InputPin::new(15).unwrap();

        faulty
            .attach_event(Event::High, || panic!("misbehaving callback"))
            .unwrap();

        let (tx, fired) = mpsc::channel();
        healthy
            .attach_event(Event::High, move || tx.send(()).unwrap())
            .unwrap();

        {
            let mut mock = interrupt::MOCK_DEVICE.lock().unwrap();
            let mock = mock.as_mut().unwrap();
            mock.inject(14);
            mock.inject(15);
        }

        fired.recv_timeout(TIMEOUT).unwrap();
    }

    #[test]
    fn last_detach_tears_the_controller_down() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();

        let mut first = InputPin::new(11).unwrap();
        let mut second = InputPin::new(12).unwrap();

        first.attach_event(Event::FallingEdge, || {}).unwrap();
        second.attach_event(Event::FallingEdge, || {}).unwrap();

        drop(first);
        assert!(!interrupt::instance_released());

        drop(second);
        assert!(interrupt::instance_released());

        // The driver handle was closed along with the controller.
        let mut mock = interrupt::MOCK_DEVICE.lock().unwrap().take().unwrap();
        mock.wait_closed();
    }
}
