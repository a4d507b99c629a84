//! LittleWire/Digispark debugWIRE gateway.
//!
//! The adapter is driven entirely through vendor control requests with a
//! fixed request number. The `wValue` of each request is a bit mask naming
//! the phases the firmware should run for this transaction; see [`state`].
pub mod tools;

use std::time::Duration;

use nusb::transfer::{Control, ControlType, Recipient, TransferError};

/// The USB VendorID of the Digispark bootloader/LittleWire firmware.
pub const VENDOR_ID: u16 = 0x1781;
/// The USB ProductID.
pub const PRODUCT_ID: u16 = 0x0c9f;

/// Vendor request number understood by the debugWIRE firmware.
const DW_REQUEST: u8 = 60;

const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// Transfers are retried this many times while the adapter is still busy
/// clocking out the previous debugWIRE activity.
const TRANSFER_RETRIES: u32 = 50;
/// Attempts at reading back the capture buffer during calibration.
const CALIBRATION_RETRIES: u32 = 5;
/// Break pulses sent before giving up on a target.
const BREAK_RETRIES: u32 = 25;

const RETRY_DELAY: Duration = Duration::from_millis(20);
/// Pause after a send, at least until the adapter starts driving the wire.
const SEND_SETTLE: Duration = Duration::from_millis(3);
/// Time for the adapter to drive a break and sample the sync response.
const BREAK_SETTLE: Duration = Duration::from_millis(120);

/// The adapter samples with its 16.5 MHz RC-calibrated core clock.
const ADAPTER_CLOCK_HZ: u32 = 16_500_000;

/// Command state bits. A transaction's `wValue` is an OR of these; the
/// firmware runs the named phases in this order. Combinations used here:
/// `BREAK | CAPTURE`, `SET_TIMING`, `SEND`, `SEND | READ`, `SEND | WAIT`
/// and `SEND | CAPTURE`.
pub mod state {
    /// Drive a break pulse before anything else.
    pub const BREAK: u8 = 0x01;
    /// Load the two bit-time parameter bytes from the payload.
    pub const SET_TIMING: u8 = 0x02;
    /// Send the payload bytes out on the wire.
    pub const SEND: u8 = 0x04;
    /// After sending, keep polling the wire for a start bit. A later
    /// break transaction aborts a pending wait.
    pub const WAIT: u8 = 0x08;
    /// Read decoded response bytes back.
    pub const READ: u8 = 0x10;
    /// Record raw pulse widths instead of decoded bytes.
    pub const CAPTURE: u8 = 0x20;
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("USB transfer failed: {0}")]
    Usb(#[from] TransferError),
    #[error("adapter still busy after {tries} attempts")]
    Busy { tries: u32 },
    #[error("short write to adapter: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("could not capture pulse timings from the target")]
    Calibration,
}

/// Control-transfer capability of the USB gateway.
///
/// Everything above this trait is deterministic protocol logic; tests
/// substitute a scripted implementation.
pub trait DwirePort {
    fn control_out(&mut self, state: u8, data: &[u8]) -> Result<usize, TransferError>;
    fn control_in(&mut self, buf: &mut [u8]) -> Result<usize, TransferError>;

    /// Pause between transfers. The mock overrides this with a no-op.
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Adapter reached over real USB.
pub struct UsbPort {
    device: nusb::Device,
}

impl UsbPort {
    pub fn new(device: nusb::Device) -> Self {
        Self { device }
    }
}

impl DwirePort for UsbPort {
    fn control_out(&mut self, state: u8, data: &[u8]) -> Result<usize, TransferError> {
        self.device.control_out_blocking(
            Control {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: DW_REQUEST,
                value: u16::from(state),
                index: 0,
            },
            data,
            USB_TIMEOUT,
        )
    }

    fn control_in(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.device.control_in_blocking(
            Control {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: DW_REQUEST,
                value: 0,
                index: 0,
            },
            buf,
            USB_TIMEOUT,
        )
    }
}

/// Run `op` up to `attempts` times with `delay` before each try, stopping
/// at the first attempt that moves data.
fn poll_adapter<P, F>(port: &mut P, attempts: u32, delay: Duration, mut op: F) -> Result<usize, TransferError>
where
    P: DwirePort,
    F: FnMut(&mut P) -> Result<usize, TransferError>,
{
    let mut last = Ok(0);
    for _ in 0..attempts {
        port.delay(delay);
        last = op(port);
        if matches!(last, Ok(n) if n > 0) {
            break;
        }
    }
    last
}

/// Handle to one adapter, wrapping the raw port with the retry and pacing
/// policy its firmware needs.
pub struct LittleWire<P: DwirePort> {
    port: P,
    /// Measured target cycles per bit. Valid after the first sync.
    cycles_per_pulse: u32,
}

impl<P: DwirePort> LittleWire<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            cycles_per_pulse: 0,
        }
    }

    pub fn cycles_per_pulse(&self) -> u32 {
        self.cycles_per_pulse
    }

    /// Sit idle for `duration` without touching the wire.
    pub fn pause(&mut self, duration: Duration) {
        self.port.delay(duration);
    }

    /// Send `data` in one transaction tagged `state`, waiting out the
    /// adapter's busy window if necessary.
    pub fn send_bytes(&mut self, state: u8, data: &[u8]) -> Result<(), AdapterError> {
        let mut status = self.port.control_out(state, data);
        if !matches!(status, Ok(n) if n > 0) {
            status = poll_adapter(&mut self.port, TRANSFER_RETRIES, RETRY_DELAY, |p| {
                p.control_out(state, data)
            });
        }
        let written = status?;
        if written < data.len() {
            return Err(AdapterError::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        self.port.delay(SEND_SETTLE);
        Ok(())
    }

    /// Read decoded response bytes, retrying while the adapter has
    /// nothing for us yet. Returns the count actually delivered, which
    /// may be less than `buf.len()`.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, AdapterError> {
        match poll_adapter(&mut self.port, TRANSFER_RETRIES, RETRY_DELAY, |p| p.control_in(buf)) {
            Ok(n) if n > 0 => Ok(n),
            Ok(_) => Err(AdapterError::Busy {
                tries: TRANSFER_RETRIES,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Read back captured pulse widths and program the adapter's bit
    /// timing from them.
    ///
    /// Returns `None` when the capture buffer holds too few samples to
    /// average; the caller then breaks again.
    fn set_baud(&mut self) -> Result<Option<u32>, AdapterError> {
        let mut raw = [0u8; 128];
        let status = poll_adapter(&mut self.port, CALIBRATION_RETRIES, RETRY_DELAY, |p| {
            p.control_in(&mut raw)
        });
        let n = status.unwrap_or(0);
        if n < 18 {
            return Ok(None);
        }

        // The first samples straddle the break edge; average the last nine.
        let count = n / 2;
        let sum: u32 = raw[..n]
            .chunks_exact(2)
            .map(|c| u32::from(u16::from_le_bytes([c[0], c[1]])))
            .skip(count - 9)
            .sum();
        // Each sample is a half-bit loop count; 6 cycles per iteration
        // plus 8 cycles of fixed overhead.
        let cpp = 6 * sum / 9 + 8;

        let bit_time = bit_time_for(cpp);
        tracing::debug!("cycles per pulse {}, bit time {}", cpp, bit_time);
        self.send_timing(bit_time)?;
        self.cycles_per_pulse = cpp;
        Ok(Some(cpp))
    }

    fn send_timing(&mut self, bit_time: u16) -> Result<(), AdapterError> {
        self.port
            .control_out(state::SET_TIMING, &bit_time.to_le_bytes())?;
        Ok(())
    }

    /// Drive a break pulse and measure the target's sync response.
    ///
    /// The target answers a break with 0x55, whose pulse widths give its
    /// clock-per-bit rate. Returns the link rate in bits per second.
    pub fn break_and_sync(&mut self) -> Result<u32, AdapterError> {
        for _ in 0..BREAK_RETRIES {
            if self.port.control_out(state::BREAK | state::CAPTURE, &[]).is_ok() {
                self.port.delay(BREAK_SETTLE);
                if let Some(cpp) = self.set_baud()? {
                    let baud = ADAPTER_CLOCK_HZ / cpp;
                    tracing::info!("connected at {} baud", baud);
                    return Ok(baud);
                }
            }
            tracing::debug!("break produced no usable pulse timings, retrying");
        }
        Err(AdapterError::Calibration)
    }

    /// Re-measure the bit time from the pulses captured by the last
    /// `SEND | CAPTURE` transaction.
    pub fn recalibrate(&mut self) -> Result<(), AdapterError> {
        match self.set_baud()? {
            Some(_) => Ok(()),
            None => Err(AdapterError::Calibration),
        }
    }

    /// Poll whether the target has halted. One IN transfer, no retries;
    /// the first byte of the answer is non-zero once the break arrived.
    pub fn reached_breakpoint(&mut self) -> bool {
        let mut buf = [0u8; 10];
        matches!(self.port.control_in(&mut buf), Ok(n) if n > 0 && buf[0] != 0)
    }

    #[cfg(test)]
    pub(crate) fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

/// Firmware loop iterations per transmitted bit for a given pulse rate.
pub(crate) fn bit_time_for(cycles_per_pulse: u32) -> u16 {
    ((cycles_per_pulse - 8) / 4) as u16
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::time::Duration;

    use nusb::transfer::TransferError;

    use super::DwirePort;

    /// Scripted adapter used by the protocol tests.
    #[derive(Default)]
    pub(crate) struct MockPort {
        /// Every OUT transfer, as `(state, payload)`.
        pub writes: Vec<(u8, Vec<u8>)>,
        /// Scripted results for IN transfers, consumed in order.
        pub reads: VecDeque<Result<Vec<u8>, TransferError>>,
        /// Served when the read script runs dry.
        pub default_read: Option<Vec<u8>>,
    }

    impl MockPort {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn expect_read(&mut self, data: &[u8]) {
            self.reads.push_back(Ok(data.to_vec()));
        }

        /// All bytes sent on the debugWIRE wire, in order. Transfers
        /// without the SEND bit (break, timing) carry no wire bytes.
        pub fn sent(&self) -> Vec<u8> {
            self.writes
                .iter()
                .filter(|(s, _)| s & super::state::SEND != 0)
                .flat_map(|(_, d)| d.iter().copied())
                .collect()
        }

        /// Little-endian capture buffer for the given pulse widths.
        pub fn pulse_samples(widths: &[u16]) -> Vec<u8> {
            widths.iter().flat_map(|w| w.to_le_bytes()).collect()
        }
    }

    impl DwirePort for MockPort {
        fn control_out(&mut self, state: u8, data: &[u8]) -> Result<usize, TransferError> {
            self.writes.push((state, data.to_vec()));
            Ok(data.len())
        }

        fn control_in(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
            let data = match self.reads.pop_front() {
                Some(Ok(d)) => d,
                Some(Err(e)) => return Err(e),
                None => self.default_read.clone().unwrap_or_default(),
            };
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        }

        fn delay(&mut self, _: Duration) {}
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockPort;
    use super::*;

    #[test]
    fn bit_time_round_trips_within_four_cycles() {
        let mut prev = 0;
        for cpp in 100..5000u32 {
            let bit_time = bit_time_for(cpp);
            assert!(bit_time >= prev, "bit time must be monotone");
            prev = bit_time;
            let recovered = 4 * u32::from(bit_time) + 8;
            assert!(recovered <= cpp && cpp - recovered <= 4, "cpp {cpp} recovered {recovered}");
        }
    }

    #[test]
    fn calibration_averages_the_last_nine_samples() {
        let mut port = MockPort::new();
        // Three junk samples from the break edge, then nine clean ones.
        let mut widths = vec![500u16, 480, 510];
        widths.extend([100u16; 9]);
        port.expect_read(&MockPort::pulse_samples(&widths));

        let mut adapter = LittleWire::new(port);
        let cpp = adapter.set_baud().unwrap().expect("calibration succeeds");
        assert_eq!(cpp, 6 * 900 / 9 + 8);
        assert_eq!(cpp, 608);

        // One timing transfer with bit_time = (608 - 8) / 4 = 150.
        let port = adapter.port_mut();
        assert_eq!(port.writes, vec![(state::SET_TIMING, vec![150, 0])]);
    }

    #[test]
    fn break_and_sync_reports_baud() {
        let mut port = MockPort::new();
        port.expect_read(&MockPort::pulse_samples(&[100; 9]));
        let mut adapter = LittleWire::new(port);
        assert_eq!(adapter.break_and_sync().unwrap(), 16_500_000 / 608);
        assert_eq!(adapter.cycles_per_pulse(), 608);
        assert_eq!(adapter.port_mut().writes[0], (state::BREAK | state::CAPTURE, vec![]));
    }

    #[test]
    fn short_capture_fails_after_25_breaks() {
        let mut port = MockPort::new();
        port.default_read = Some(vec![0; 4]);
        let mut adapter = LittleWire::new(port);
        assert!(matches!(adapter.break_and_sync(), Err(AdapterError::Calibration)));
        let breaks = adapter
            .port_mut()
            .writes
            .iter()
            .filter(|(s, _)| *s == (state::BREAK | state::CAPTURE))
            .count();
        assert_eq!(breaks, 25);
    }

    #[test]
    fn read_bytes_gives_up_when_nothing_arrives() {
        let port = MockPort::new();
        let mut adapter = LittleWire::new(port);
        let mut buf = [0u8; 4];
        assert!(matches!(
            adapter.read_bytes(&mut buf),
            Err(AdapterError::Busy { tries: 50 })
        ));
    }

    #[test]
    fn reached_breakpoint_checks_the_first_byte() {
        let mut port = MockPort::new();
        port.expect_read(&[0x55]);
        port.expect_read(&[0x00]);
        let mut adapter = LittleWire::new(port);
        assert!(adapter.reached_breakpoint());
        assert!(!adapter.reached_breakpoint());
    }
}
