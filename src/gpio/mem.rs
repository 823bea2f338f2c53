use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::gpio::{Error, Result};

// The BCM2711 GPIO register block fits in a single page.
const GPIO_MEM_SIZE: usize = 4096;
const GPIO_MEM_WORDS: usize = GPIO_MEM_SIZE / std::mem::size_of::<u32>();

/// Memory-mapped GPIO register page. All access is in 32-bit word units.
#[derive(Debug)]
pub(crate) struct GpioMem {
    mem_ptr: *mut u32,
}

impl GpioMem {
    #[cfg_attr(test, allow(dead_code))]
    fn map() -> Result<GpioMem> {
        // Opening /dev/gpiomem fails if the distribution doesn't provide
        // it, or the current user isn't a member of the gpio group.
        let gpiomem_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/gpiomem")
            .map_err(Error::DeviceOpen)?;

        // Memory-map /dev/gpiomem at offset 0
        let mem_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                GPIO_MEM_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                gpiomem_file.as_raw_fd(),
                0,
            )
        };

        if mem_ptr == libc::MAP_FAILED {
            return Err(Error::DeviceOpen(io::Error::last_os_error()));
        }

        Ok(GpioMem {
            mem_ptr: mem_ptr as *mut u32,
        })
    }

    // Heap-backed stand-in for the register page, so pin and controller
    // behavior can be checked without the peripheral.
    #[cfg(test)]
    fn simulated() -> GpioMem {
        let page: Box<[u32; GPIO_MEM_WORDS]> = Box::new([0; GPIO_MEM_WORDS]);

        GpioMem {
            mem_ptr: Box::into_raw(page) as *mut u32,
        }
    }

    pub(crate) fn read(&self, offset: usize) -> u32 {
        debug_assert!(offset < GPIO_MEM_WORDS);

        unsafe { ptr::read_volatile(self.mem_ptr.add(offset)) }
    }

    pub(crate) fn write(&self, offset: usize, value: u32) {
        debug_assert!(offset < GPIO_MEM_WORDS);

        // The hardware latches event detection into GPEDS and clears a bit
        // when 1 is written to it. The simulated page mirrors that, since
        // the polled controller relies on it.
        #[cfg(test)]
        {
            use crate::gpio::GPIO_OFFSET_GPEDS;

            if (GPIO_OFFSET_GPEDS..GPIO_OFFSET_GPEDS + 2).contains(&offset) {
                let cleared = self.read(offset) & !value;
                unsafe { ptr::write_volatile(self.mem_ptr.add(offset), cleared) };
                return;
            }
        }

        unsafe { ptr::write_volatile(self.mem_ptr.add(offset), value) }
    }

    // Latches event detect bits in the simulated page, as the peripheral
    // would when a configured event fires.
    #[cfg(test)]
    pub(crate) fn raise(&self, offset: usize, mask: u32) {
        debug_assert!(offset < GPIO_MEM_WORDS);

        let value = unsafe { ptr::read_volatile(self.mem_ptr.add(offset)) };
        unsafe { ptr::write_volatile(self.mem_ptr.add(offset), value | mask) };
    }
}

// Required because of the raw pointer to the memory-mapped page. Pin
// handles never change the mapping itself, only the registers behind it.
unsafe impl Send for GpioMem {}
unsafe impl Sync for GpioMem {}

lazy_static! {
    static ref GPIO_MEM: Mutex<Option<&'static GpioMem>> = Mutex::new(None);
}

/// Returns the process-wide register mapping, created on first use.
///
/// The mapping is never unmapped; the kernel reclaims it at process exit.
/// A failed attempt leaves the slot empty, so a later call tries again.
pub(crate) fn gpio_mem() -> Result<&'static GpioMem> {
    let mut slot = GPIO_MEM.lock().unwrap();

    if let Some(mem) = *slot {
        return Ok(mem);
    }

    #[cfg(not(test))]
    let mem = GpioMem::map()?;
    #[cfg(test)]
    let mem = GpioMem::simulated();

    let mem: &'static GpioMem = Box::leak(Box::new(mem));
    *slot = Some(mem);

    Ok(mem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::GPIO_OFFSET_GPEDS;

    #[test]
    fn shared_mapping() {
        let first = gpio_mem().unwrap();
        let second = gpio_mem().unwrap();

        assert!(ptr::eq(first, second));
    }

    #[test]
    fn word_access() {
        let mem = gpio_mem().unwrap();

        // Scratch word well past the register map.
        mem.write(1000, 0xDEAD_BEEF);
        assert_eq!(mem.read(1000), 0xDEAD_BEEF);
    }

    #[test]
    fn event_status_clears_on_write_1() {
        let mem = gpio_mem().unwrap();
        let reg = GPIO_OFFSET_GPEDS;

        mem.raise(reg, 1 << 30);
        mem.raise(reg, 1 << 29);
        assert_eq!(mem.read(reg) & (0b11 << 29), 0b11 << 29);

        mem.write(reg, 1 << 30);
        assert_eq!(mem.read(reg) & (1 << 30), 0);
        assert_ne!(mem.read(reg) & (1 << 29), 0);

        mem.write(reg, 1 << 29);
    }
}
