//! A live debug session against one AVR target.

use std::time::Duration;

use tracing::debug;

use crate::devices::{self, Device};
use crate::dwire::{commands, instr, DwLink, DwireError, MAX_FRAME};
use crate::littlewire::{DwirePort, LittleWire};

/// EEPROM cells need a few milliseconds per programmed byte.
const EEPROM_WRITE_SETTLE: Duration = Duration::from_millis(5);

/// One attached target.
///
/// Registers r28..r31 are shadowed host-side: the bulk-transfer
/// micro-programs running on the target clobber Y and Z, so the true
/// values live here between stops and are written back before execution
/// resumes.
pub struct Target<P: DwirePort> {
    link: DwLink<P>,
    device: &'static Device,
    /// Byte-addressed program counter. The device itself counts words.
    pub pc: u16,
    /// Byte address of the single hardware breakpoint, if armed.
    pub bp: Option<u16>,
    /// Leave the device timers running while execution resumes.
    pub timer_enable: bool,
    /// Shadow of r28..r31, indexed from r28.
    regs: [u8; 4],
}

/// Convert the word PC the device reports into the byte address of the
/// instruction it stopped on. The report is one word past it.
fn byte_pc(pc_word: u16, flash_words: u32) -> u16 {
    (((u32::from(pc_word) + flash_words - 1) % flash_words) * 2) as u16
}

impl<P: DwirePort> Target<P> {
    /// Break into the device, identify it and pick up its current state.
    pub fn connect(port: P) -> Result<Self, DwireError> {
        let mut adapter = LittleWire::new(port);
        adapter.break_and_sync()?;
        let mut link = DwLink::new(adapter);

        link.send(&[commands::READ_SIG])?;
        let signature = link.read_word()?;
        let device = devices::by_signature(signature).ok_or(DwireError::UnknownSignature(signature))?;
        debug!("device recognised as {}", device.name);

        let mut target = Self {
            link,
            device,
            pc: 0,
            bp: None,
            timer_enable: false,
            regs: [0; 4],
        };
        target.reconnect()?;
        Ok(target)
    }

    pub fn device(&self) -> &'static Device {
        self.device
    }

    /// Push any coalesced command bytes out now.
    pub fn flush(&mut self) -> Result<(), DwireError> {
        self.link.flush()
    }

    /// Re-read the PC and the register shadow after the target stops.
    pub fn reconnect(&mut self) -> Result<(), DwireError> {
        self.link.send(&[commands::READ_PC])?;
        let pc_word = self.link.read_word()?;
        self.pc = byte_pc(pc_word, self.device.flash_words());
        debug!("stopped at pc {:#06x}", self.pc);

        let mut regs = [0u8; 4];
        self.get_regs(28, &mut regs)?;
        self.regs = regs;
        Ok(())
    }

    /// Reset the target and resynchronise; the sync recaptures the bit
    /// time across the reset pulse.
    pub fn reset(&mut self) -> Result<(), DwireError> {
        self.link.send(&[commands::RESET])?;
        self.link.sync()?;
        self.reconnect()
    }

    /// Take the device out of debugWIRE mode until its next power cycle,
    /// consuming the session. ISP programming becomes possible again.
    pub fn disable(mut self) -> Result<(), DwireError> {
        self.link.send(&[commands::DISABLE])?;
        self.link.flush()
    }

    /// Execute one instruction.
    pub fn trace(&mut self) -> Result<(), DwireError> {
        let regs = self.regs;
        self.set_regs(28, &regs)?;
        self.link.set_pc(self.pc / 2)?;
        self.link.send(&[commands::STEP_CONTEXT, commands::STEP])?;
        self.link.sync()?;
        self.reconnect()
    }

    /// Resume execution, honouring the armed breakpoint. Returns once
    /// the adapter is watching the wire; poll [`Self::reached_breakpoint`]
    /// and then call [`Self::reconnect`].
    pub fn go(&mut self) -> Result<(), DwireError> {
        let regs = self.regs;
        self.set_regs(28, &regs)?;
        self.link.set_pc(self.pc / 2)?;
        match self.bp {
            Some(bp) => {
                self.link.set_bp(bp / 2)?;
                self.link
                    .send(&[commands::run_to_breakpoint_context(self.timer_enable)])?;
            }
            None => self.link.send(&[commands::run_context(self.timer_enable)])?,
        }
        self.link.send(&[commands::GO])?;
        self.link.wait()
    }

    /// Whether the running target has stopped.
    pub fn reached_breakpoint(&mut self) -> bool {
        self.link.adapter_mut().reached_breakpoint()
    }

    /// Read `regs.len()` registers starting at `first`.
    pub fn get_regs(&mut self, first: u8, regs: &mut [u8]) -> Result<(), DwireError> {
        if regs.is_empty() {
            return Ok(());
        }
        if regs.len() == 1 {
            // A single register goes out through DWDR without touching
            // the PC.
            self.link.exec_out(self.device.dwdr, first)?;
        } else {
            self.link.set_pc(u16::from(first))?;
            self.link.set_bp(u16::from(first) + regs.len() as u16)?;
            self.link.send(&[
                commands::MEM_CONTEXT,
                commands::RW_MODE,
                commands::RW_READ_REGS,
                commands::RW_START,
            ])?;
        }
        self.link.receive(regs)?;
        Ok(())
    }

    /// Write one register through DWDR.
    pub fn set_reg(&mut self, reg: u8, val: u8) -> Result<(), DwireError> {
        self.link.exec_in(reg, self.device.dwdr)?;
        self.link.send(&[val])
    }

    /// Write consecutive registers starting at `first`.
    ///
    /// Values written into r28..r31 this way are transient: `go` and
    /// `trace` restore the shadow. Use [`Self::write_addr`] for writes
    /// that should survive a resume.
    pub fn set_regs(&mut self, first: u8, vals: &[u8]) -> Result<(), DwireError> {
        if vals.len() <= 3 {
            for (i, &val) in vals.iter().enumerate() {
                self.set_reg(first + i as u8, val)?;
            }
        } else {
            self.link.set_pc(u16::from(first))?;
            self.link.set_bp(u16::from(first) + vals.len() as u16)?;
            self.link.send(&[
                commands::MEM_CONTEXT,
                commands::RW_MODE,
                commands::RW_WRITE_REGS,
                commands::RW_START,
            ])?;
            self.link.send(vals)?;
        }
        Ok(())
    }

    /// Point Z at `addr`.
    fn set_z(&mut self, addr: u16) -> Result<(), DwireError> {
        self.set_regs(30, &addr.to_le_bytes())
    }

    /// Read data space.
    ///
    /// The read process occupies some of it: r28..r31 hold the transfer
    /// pointers and DWDR carries the bytes. Those locations are stitched
    /// in from the host shadow (or as zero for DWDR) and never read from
    /// the bus.
    pub fn read_addr(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), DwireError> {
        let dwdr_addr = usize::from(self.device.dwdr_addr());
        let start = usize::from(addr);
        let mut pos = 0;
        while pos < buf.len() {
            let a = start + pos;
            if (28..32).contains(&a) {
                buf[pos] = self.regs[a - 28];
                pos += 1;
            } else if a == dwdr_addr {
                buf[pos] = 0;
                pos += 1;
            } else {
                // Direct read up to the next special location, at most
                // one frame at a time.
                let mut end = start + buf.len();
                if a < 28 {
                    end = end.min(28);
                }
                if a < dwdr_addr {
                    end = end.min(dwdr_addr);
                }
                let len = (end - a).min(MAX_FRAME);
                self.read_addr_raw(a as u16, &mut buf[pos..pos + len])?;
                pos += len;
            }
        }
        Ok(())
    }

    /// One pass of the `ld r16, Z+` micro-program. The range must avoid
    /// r28..r31 and DWDR.
    fn read_addr_raw(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), DwireError> {
        self.set_z(addr)?;
        self.link.set_pc(0)?;
        // Two instructions per transferred byte.
        self.link.set_bp(2 * buf.len() as u16)?;
        self.link.send(&[
            commands::MEM_CONTEXT,
            commands::RW_MODE,
            commands::RW_READ_SRAM,
            commands::RW_START,
        ])?;
        self.link.receive(buf)?;
        Ok(())
    }

    /// Write data space.
    ///
    /// Bytes aimed at r28..r31 update the register shadow instead of the
    /// bus (r30/r31 are the write pointer itself) and DWDR is skipped;
    /// everything else goes through the `st Z+` micro-program. The bytes
    /// coalesce until the next flush or receive.
    pub fn write_addr(&mut self, addr: u16, data: &[u8]) -> Result<(), DwireError> {
        let dwdr_addr = self.device.dwdr_addr();
        self.set_z(addr)?;
        self.link.set_bp(3)?;
        self.link
            .send(&[commands::MEM_CONTEXT, commands::RW_MODE, commands::RW_WRITE_SRAM])?;
        for (i, &byte) in data.iter().enumerate() {
            let a = addr + i as u16;
            if a < 28 || (a > 31 && a != dwdr_addr) {
                self.link.set_pc(1)?;
                self.link.send(&[commands::RW_START, byte])?;
            } else {
                if (28..=31).contains(&a) {
                    self.regs[usize::from(a) - 28] = byte;
                }
                self.set_z(a + 1)?;
            }
        }
        Ok(())
    }

    /// Read program memory through the `lpm Z+` micro-program.
    pub fn read_flash(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), DwireError> {
        for (i, chunk) in buf.chunks_mut(MAX_FRAME).enumerate() {
            self.set_z(addr + (i * MAX_FRAME) as u16)?;
            self.link.set_pc(0)?;
            self.link.set_bp(2 * chunk.len() as u16)?;
            self.link.send(&[
                commands::MEM_CONTEXT,
                commands::RW_MODE,
                commands::RW_READ_FLASH,
                commands::RW_START,
            ])?;
            self.link.receive(chunk)?;
        }
        Ok(())
    }

    /// Read EEPROM a byte at a time by stepping the EERE strobe sequence
    /// on the target.
    pub fn read_eeprom(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), DwireError> {
        let d = self.device;
        // r28 holds the EERE strobe value, Z the EEPROM address.
        self.set_regs(28, &[0x01])?;
        self.set_z(addr)?;
        self.link.send(&[commands::IR_CONTEXT])?;
        for byte in buf.iter_mut() {
            self.link.exec_out(d.eearh(), 31)?;
            self.link.exec_out(d.eearl(), 30)?;
            self.link.exec_out(d.eecr, 28)?;
            self.link.exec_in(0, d.eedr())?;
            self.link.exec_out(d.dwdr, 0)?;
            *byte = self.link.read_byte()?;
            self.link.exec(instr::adiw_z(1))?;
        }
        Ok(())
    }

    /// Program EEPROM bytes via the EEMPE/EEPE strobes.
    pub fn write_eeprom(&mut self, addr: u16, data: &[u8]) -> Result<(), DwireError> {
        let d = self.device;
        let mut saved_x = [0u8; 2];
        self.get_regs(26, &mut saved_x)?;

        // r26/r27 hold the two strobe values, Z the EEPROM address.
        self.set_regs(26, &[0x04, 0x02])?;
        self.set_z(addr)?;
        self.link.send(&[commands::IR_CONTEXT])?;
        for &byte in data {
            self.link.exec_out(d.eearh(), 31)?;
            self.link.exec_out(d.eearl(), 30)?;
            self.link.exec_in(0, d.dwdr)?;
            self.link.send(&[byte])?;
            self.link.exec_out(d.eedr(), 0)?;
            self.link.exec_out(d.eecr, 26)?;
            self.link.exec_out(d.eecr, 27)?;
            self.link.exec(instr::adiw_z(1))?;
            self.link.flush()?;
            self.link.adapter_mut().pause(EEPROM_WRITE_SETTLE);
        }

        self.set_regs(26, &saved_x)?;
        self.link.flush()
    }
}
