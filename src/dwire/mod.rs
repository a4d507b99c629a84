//! The debugWIRE byte protocol over a LittleWire gateway.
pub mod commands;
pub mod instr;

use crate::littlewire::{state, AdapterError, DwirePort, LittleWire};

/// The adapter forwards at most this many payload bytes per transaction.
pub const MAX_FRAME: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum DwireError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("unrecognised device signature {0:#06x}")]
    UnknownSignature(u16),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

/// Coalescing link to the target.
///
/// Outgoing command bytes accumulate here so one USB transaction carries
/// as many of them as possible, and so a read is always staged in the
/// same transaction as the bytes that provoke the reply.
pub struct DwLink<P: DwirePort> {
    adapter: LittleWire<P>,
    out: Vec<u8>,
}

impl<P: DwirePort> DwLink<P> {
    pub fn new(adapter: LittleWire<P>) -> Self {
        Self {
            adapter,
            out: Vec::with_capacity(MAX_FRAME),
        }
    }

    pub fn adapter_mut(&mut self) -> &mut LittleWire<P> {
        &mut self.adapter
    }

    /// Queue bytes for the target. They go out with the next flush,
    /// receive or sync, or immediately once a full frame accumulates.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), DwireError> {
        let mut rest = bytes;
        while self.out.len() + rest.len() > MAX_FRAME {
            let take = MAX_FRAME - self.out.len();
            self.out.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            self.adapter.send_bytes(state::SEND, &self.out)?;
            self.out.clear();
        }
        self.out.extend_from_slice(rest);
        Ok(())
    }

    fn flush_as(&mut self, state: u8) -> Result<(), DwireError> {
        if !self.out.is_empty() {
            self.adapter.send_bytes(state, &self.out)?;
            self.out.clear();
        }
        Ok(())
    }

    /// Push any queued bytes out now.
    pub fn flush(&mut self) -> Result<(), DwireError> {
        self.flush_as(state::SEND | state::READ)
    }

    /// Flush queued bytes and read back up to `buf.len()` response bytes.
    /// Returns the count actually received; the target may answer short.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize, DwireError> {
        if buf.len() > MAX_FRAME {
            return Err(DwireError::Protocol("read longer than one frame"));
        }
        if self.out.is_empty() {
            return Err(DwireError::Protocol("read with no command staged"));
        }
        self.flush_as(state::SEND | state::READ)?;
        Ok(self.adapter.read_bytes(buf)?)
    }

    pub fn read_byte(&mut self) -> Result<u8, DwireError> {
        let mut buf = [0u8; 1];
        self.receive(&mut buf)?;
        Ok(buf[0])
    }

    /// 16-bit replies arrive high byte first.
    pub fn read_word(&mut self) -> Result<u16, DwireError> {
        let mut buf = [0u8; 2];
        self.receive(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Flush and recapture the 0x55 pulses that follow, re-measuring the
    /// bit time. The target clock may drift or change across a reset.
    pub fn sync(&mut self) -> Result<(), DwireError> {
        self.flush_as(state::SEND | state::CAPTURE)?;
        self.adapter.recalibrate()?;
        Ok(())
    }

    /// Flush and leave the adapter watching the wire for the break that
    /// signals the target has stopped.
    pub fn wait(&mut self) -> Result<(), DwireError> {
        self.flush_as(state::SEND | state::WAIT)
    }

    /// Load the program counter (a word address).
    pub fn set_pc(&mut self, pc: u16) -> Result<(), DwireError> {
        self.send(&commands::set_pc(pc))
    }

    /// Load the breakpoint comparator (a word address).
    pub fn set_bp(&mut self, bp: u16) -> Result<(), DwireError> {
        self.send(&commands::set_bp(bp))
    }

    /// Execute `opcode` on the target through the instruction register.
    pub fn exec(&mut self, opcode: u16) -> Result<(), DwireError> {
        self.send(&commands::exec(opcode))
    }

    /// Execute `in reg, ioreg` on the target.
    pub fn exec_in(&mut self, reg: u8, ioreg: u8) -> Result<(), DwireError> {
        self.exec(instr::in_op(reg, ioreg))
    }

    /// Execute `out ioreg, reg` on the target.
    pub fn exec_out(&mut self, ioreg: u8, reg: u8) -> Result<(), DwireError> {
        self.exec(instr::out_op(ioreg, reg))
    }
}
