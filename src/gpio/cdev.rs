use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;

use crate::gpio::{Error, Result};

pub(crate) const DEVICE_PATH: &str = "/dev/gpiodev";

// Command types accepted by the gpiodev kernel module.
pub(crate) const CMD_DETACH_IRQ: u32 = 0;
pub(crate) const CMD_ATTACH_IRQ: u32 = 1;
pub(crate) const CMD_WAKE_UP: u32 = 2;

// Payload of a wake-up frame. Reserved; never a real BCM GPIO number.
pub(crate) const WAKE_UP_PIN: u32 = 0xFFFF;

// Command frame: { type: u32, pin: u32 }, native byte order.
const COMMAND_SIZE: usize = 8;
// Event frame: one u32 pin number.
const EVENT_SIZE: usize = std::mem::size_of::<u32>();

/// Open handle to the gpiodev character device.
///
/// Commands are written and events read through the same file descriptor;
/// the kernel serialises the two directions against each other, and the
/// poll thread is the only reader. The device is closed when the handle is
/// dropped.
#[derive(Debug)]
pub(crate) struct DriverHandle {
    device: File,
}

impl DriverHandle {
    #[cfg_attr(test, allow(dead_code))]
    pub(crate) fn open() -> Result<DriverHandle> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEVICE_PATH)
            .map_err(Error::DeviceOpen)?;

        Ok(DriverHandle { device })
    }

    #[cfg(test)]
    pub(crate) fn from_file(device: File) -> DriverHandle {
        DriverHandle { device }
    }

    /// Writes a single command frame. The kernel accepts the full 8 bytes
    /// or rejects the command.
    pub(crate) fn write_command(&self, cmd: u32, pin: u32) -> Result<()> {
        let mut frame = [0u8; COMMAND_SIZE];
        frame[..4].copy_from_slice(&cmd.to_ne_bytes());
        frame[4..].copy_from_slice(&pin.to_ne_bytes());

        let result = parse_retval!(unsafe {
            libc::write(
                self.device.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                COMMAND_SIZE,
            )
        });

        match result {
            Ok(written) if written == COMMAND_SIZE as libc::ssize_t => Ok(()),
            Ok(_) => Err(Error::KernelIo(io::Error::new(
                io::ErrorKind::WriteZero,
                "short command write",
            ))),
            Err(err) => Err(Error::KernelIo(err)),
        }
    }

    /// Blocks until the driver delivers an event frame.
    ///
    /// Returns `Ok(true)` when `pin` holds a complete pin number. A short,
    /// empty or interrupted read yields `Ok(false)`; the driver uses those
    /// to bound the wait, and the caller is expected to try again.
    pub(crate) fn read_event(&self, pin: &mut u32) -> Result<bool> {
        let mut frame = [0u8; EVENT_SIZE];

        let result = parse_retval!(unsafe {
            libc::read(
                self.device.as_raw_fd(),
                frame.as_mut_ptr() as *mut libc::c_void,
                EVENT_SIZE,
            )
        });

        match result {
            Ok(read) if read == EVENT_SIZE as libc::ssize_t => {
                *pin = u32::from_ne_bytes(frame);
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(err) => Err(Error::KernelIo(err)),
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use super::{DriverHandle, CMD_WAKE_UP, WAKE_UP_PIN};

    /// Test stand-in for the gpiodev kernel module.
    ///
    /// One end of a socketpair is handed to the library in place of
    /// `/dev/gpiodev`; the other is serviced here on a dedicated thread
    /// that records every command frame and answers a wake-up with its
    /// sentinel event frame, the way the driver unblocks a waiting read.
    /// The service thread exits when the library end is closed.
    pub(crate) struct MockDevice {
        stream: UnixStream,
        commands: Arc<Mutex<Vec<(u32, u32)>>>,
        service: Option<thread::JoinHandle<()>>,
    }

    impl MockDevice {
        pub(crate) fn pair() -> (DriverHandle, MockDevice) {
            let (library_end, mock_end) = UnixStream::pair().unwrap();
            let commands = Arc::new(Mutex::new(Vec::new()));

            let mut service_stream = mock_end.try_clone().unwrap();
            let service_commands = commands.clone();
            let service = thread::spawn(move || {
                let mut frame = [0u8; 8];

                while service_stream.read_exact(&mut frame).is_ok() {
                    let cmd = u32::from_ne_bytes(frame[..4].try_into().unwrap());
                    let pin = u32::from_ne_bytes(frame[4..].try_into().unwrap());
                    service_commands.lock().unwrap().push((cmd, pin));

                    if cmd == CMD_WAKE_UP {
                        let _ = service_stream.write_all(&WAKE_UP_PIN.to_ne_bytes());
                    }
                }
            });

            let handle = DriverHandle::from_file(OwnedFd::from(library_end).into());

            (
                handle,
                MockDevice {
                    stream: mock_end,
                    commands,
                    service: Some(service),
                },
            )
        }

        /// Delivers an event frame, as if the pin's IRQ had fired.
        pub(crate) fn inject(&mut self, pin: u32) {
            self.stream.write_all(&pin.to_ne_bytes()).unwrap();
        }

        pub(crate) fn commands(&self) -> Vec<(u32, u32)> {
            self.commands.lock().unwrap().clone()
        }

        /// Blocks until the library end of the device has been closed.
        pub(crate) fn wait_closed(&mut self) {
            if let Some(service) = self.service.take() {
                service.join().unwrap();
            }
        }
    }
}
