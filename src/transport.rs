//! The transport contract the acquisition core consumes.
//!
//! Byte-level transports (USB HID, USB-serial, Bluetooth virtual serial) are
//! out of this crate's core scope; only the contract they must satisfy is
//! defined here, matching `original_source/kromek_driver/include/
//! IDevice.h`'s data-ready/error callback pair and read/write entry points.
//! `hid`/`serial` below are optional reference implementations for
//! example/test convenience, gated behind their own Cargo features, and are
//! not part of the grounded core.

/// Implemented by whatever carries bytes to and from the physical device.
/// The acquisition core drives this trait; it never opens or enumerates a
/// transport itself.
pub trait Transport: Send {
    /// Registers the callback invoked with each chunk of bytes read from the
    /// device. Replaces any previously registered callback.
    fn set_data_ready_callback(&mut self, cb: Box<dyn FnMut(&[u8]) + Send>);

    /// Registers the callback invoked when the transport itself fails
    /// (distinct from a device-reported internal error).
    fn set_error_callback(&mut self, cb: Box<dyn FnMut(i32, String) + Send>);

    /// Starts delivering data-ready callbacks.
    fn begin_reading(&mut self);

    /// Stops delivering data-ready callbacks.
    fn stop_reading(&mut self);

    /// Sends a configuration-set report. Returns `false` on failure to even
    /// submit the write (not on a device-level rejection, which arrives
    /// later as data).
    fn set_configuration_setting(&mut self, data: &[u8]) -> bool;

    /// Sends a configuration-get request. Returns `false` on failure to
    /// submit the write.
    fn get_configuration_setting(&mut self, data: &[u8]) -> bool;
}

#[cfg(feature = "hid-transport")]
pub mod hid {
    //! Minimal `hidapi`-backed [`Transport`], provided as a working example
    //! of wiring a real device to the core. Not exercised by this crate's
    //! own tests, which use an in-memory fake instead.

    use super::Transport;
    use hidapi::HidDevice;
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    pub struct HidTransport {
        device: Arc<HidDevice>,
        data_ready: Arc<Mutex<Option<Box<dyn FnMut(&[u8]) + Send>>>>,
        on_error: Arc<Mutex<Option<Box<dyn FnMut(i32, String) + Send>>>>,
        reader: Option<JoinHandle<()>>,
        stop: Arc<std::sync::atomic::AtomicBool>,
    }

    impl HidTransport {
        pub fn new(device: HidDevice) -> Self {
            Self {
                device: Arc::new(device),
                data_ready: Arc::new(Mutex::new(None)),
                on_error: Arc::new(Mutex::new(None)),
                reader: None,
                stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            }
        }
    }

    impl Transport for HidTransport {
        fn set_data_ready_callback(&mut self, cb: Box<dyn FnMut(&[u8]) + Send>) {
            *self.data_ready.lock().unwrap() = Some(cb);
        }

        fn set_error_callback(&mut self, cb: Box<dyn FnMut(i32, String) + Send>) {
            *self.on_error.lock().unwrap() = Some(cb);
        }

        fn begin_reading(&mut self) {
            use std::sync::atomic::Ordering;
            self.stop.store(false, Ordering::SeqCst);
            let device = self.device.clone();
            let data_ready = self.data_ready.clone();
            let on_error = self.on_error.clone();
            let stop = self.stop.clone();
            self.reader = Some(std::thread::spawn(move || {
                let mut buf = [0u8; crate::packet::MAX_REPORT_SIZE];
                while !stop.load(Ordering::SeqCst) {
                    match device.read_timeout(&mut buf, 100) {
                        Ok(0) => continue,
                        Ok(n) => {
                            if let Some(cb) = data_ready.lock().unwrap().as_mut() {
                                cb(&buf[..n]);
                            }
                        }
                        Err(e) => {
                            if let Some(cb) = on_error.lock().unwrap().as_mut() {
                                cb(crate::error::code::READ_FAILED, e.to_string());
                            }
                        }
                    }
                }
            }));
        }

        fn stop_reading(&mut self) {
            self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
            if let Some(handle) = self.reader.take() {
                let _ = handle.join();
            }
        }

        fn set_configuration_setting(&mut self, data: &[u8]) -> bool {
            self.device.write(data).is_ok()
        }

        fn get_configuration_setting(&mut self, data: &[u8]) -> bool {
            self.device.write(data).is_ok()
        }
    }
}

#[cfg(feature = "serial-transport")]
pub mod serial {
    //! Minimal `serialport`-backed [`Transport`], for USB-serial devices
    //! that present themselves as a plain COM port / tty.

    use super::Transport;
    use serialport::SerialPort;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    pub struct SerialTransport {
        port: Arc<Mutex<Box<dyn SerialPort>>>,
        data_ready: Arc<Mutex<Option<Box<dyn FnMut(&[u8]) + Send>>>>,
        on_error: Arc<Mutex<Option<Box<dyn FnMut(i32, String) + Send>>>>,
        reader: Option<JoinHandle<()>>,
        stop: Arc<std::sync::atomic::AtomicBool>,
    }

    impl SerialTransport {
        pub fn new(port: Box<dyn SerialPort>) -> Self {
            Self {
                port: Arc::new(Mutex::new(port)),
                data_ready: Arc::new(Mutex::new(None)),
                on_error: Arc::new(Mutex::new(None)),
                reader: None,
                stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            }
        }
    }

    impl Transport for SerialTransport {
        fn set_data_ready_callback(&mut self, cb: Box<dyn FnMut(&[u8]) + Send>) {
            *self.data_ready.lock().unwrap() = Some(cb);
        }

        fn set_error_callback(&mut self, cb: Box<dyn FnMut(i32, String) + Send>) {
            *self.on_error.lock().unwrap() = Some(cb);
        }

        fn begin_reading(&mut self) {
            use std::sync::atomic::Ordering;
            self.stop.store(false, Ordering::SeqCst);
            let port = self.port.clone();
            let data_ready = self.data_ready.clone();
            let on_error = self.on_error.clone();
            let stop = self.stop.clone();
            self.reader = Some(std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                while !stop.load(Ordering::SeqCst) {
                    let result = port.lock().unwrap().read(&mut buf);
                    match result {
                        Ok(0) => continue,
                        Ok(n) => {
                            if let Some(cb) = data_ready.lock().unwrap().as_mut() {
                                cb(&buf[..n]);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => {
                            if let Some(cb) = on_error.lock().unwrap().as_mut() {
                                cb(crate::error::code::READ_FAILED, e.to_string());
                            }
                        }
                    }
                }
            }));
        }

        fn stop_reading(&mut self) {
            self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
            if let Some(handle) = self.reader.take() {
                let _ = handle.join();
            }
        }

        fn set_configuration_setting(&mut self, data: &[u8]) -> bool {
            self.port.lock().unwrap().write_all(data).is_ok()
        }

        fn get_configuration_setting(&mut self, data: &[u8]) -> bool {
            self.port.lock().unwrap().write_all(data).is_ok()
        }
    }
}
