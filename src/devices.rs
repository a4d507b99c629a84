//! Characteristics of the debugWIRE-capable AVR parts we know about.

/// Static description of one AVR part.
pub struct Device {
    /// 16-bit device signature as reported over the wire.
    pub signature: u16,
    pub name: &'static str,
    /// Flash size in bytes.
    pub flash_size: u32,
    /// Flash page size in bytes.
    pub page_size: u16,
    /// First SRAM address past the register file and I/O space.
    pub sram_base: u16,
    pub sram_size: u16,
    pub eeprom_size: u16,
    /// I/O-space address of the data wire data register.
    pub dwdr: u8,
    /// I/O-space address of EECR. EEDR, EEARL and EEARH sit directly
    /// above it on every part in this table.
    pub eecr: u8,
}

impl Device {
    /// Data-space address of DWDR.
    pub fn dwdr_addr(&self) -> u16 {
        u16::from(self.dwdr) + 0x20
    }

    pub fn eedr(&self) -> u8 {
        self.eecr + 1
    }

    pub fn eearl(&self) -> u8 {
        self.eecr + 2
    }

    pub fn eearh(&self) -> u8 {
        self.eecr + 3
    }

    pub fn flash_words(&self) -> u32 {
        self.flash_size / 2
    }
}

/// Every part this tool can drive. Append-only.
pub static DEVICES: &[Device] = &[
    Device { signature: 0x9007, name: "ATtiny13",   flash_size: 1024,  page_size: 32,  sram_base: 0x060, sram_size: 64,   eeprom_size: 64,   dwdr: 0x2E, eecr: 0x1C },
    Device { signature: 0x910A, name: "ATtiny2313", flash_size: 2048,  page_size: 32,  sram_base: 0x060, sram_size: 128,  eeprom_size: 128,  dwdr: 0x1F, eecr: 0x1C },
    Device { signature: 0x910B, name: "ATtiny24",   flash_size: 2048,  page_size: 32,  sram_base: 0x060, sram_size: 128,  eeprom_size: 128,  dwdr: 0x27, eecr: 0x1C },
    Device { signature: 0x9108, name: "ATtiny25",   flash_size: 2048,  page_size: 32,  sram_base: 0x060, sram_size: 128,  eeprom_size: 128,  dwdr: 0x22, eecr: 0x1C },
    Device { signature: 0x9205, name: "ATmega48",   flash_size: 4096,  page_size: 64,  sram_base: 0x100, sram_size: 512,  eeprom_size: 256,  dwdr: 0x31, eecr: 0x1F },
    Device { signature: 0x920A, name: "ATmega48PA", flash_size: 4096,  page_size: 64,  sram_base: 0x100, sram_size: 512,  eeprom_size: 256,  dwdr: 0x31, eecr: 0x1F },
    Device { signature: 0x9206, name: "ATtiny45",   flash_size: 4096,  page_size: 64,  sram_base: 0x060, sram_size: 256,  eeprom_size: 256,  dwdr: 0x22, eecr: 0x1C },
    Device { signature: 0x9207, name: "ATtiny44",   flash_size: 4096,  page_size: 64,  sram_base: 0x060, sram_size: 256,  eeprom_size: 256,  dwdr: 0x27, eecr: 0x1C },
    Device { signature: 0x930B, name: "ATtiny85",   flash_size: 8192,  page_size: 64,  sram_base: 0x060, sram_size: 512,  eeprom_size: 512,  dwdr: 0x22, eecr: 0x1C },
    Device { signature: 0x930C, name: "ATtiny84",   flash_size: 8192,  page_size: 64,  sram_base: 0x060, sram_size: 512,  eeprom_size: 512,  dwdr: 0x27, eecr: 0x1C },
    Device { signature: 0x930A, name: "ATmega88",   flash_size: 8192,  page_size: 64,  sram_base: 0x100, sram_size: 1024, eeprom_size: 512,  dwdr: 0x31, eecr: 0x1F },
    Device { signature: 0x930F, name: "ATmega88PA", flash_size: 8192,  page_size: 64,  sram_base: 0x100, sram_size: 1024, eeprom_size: 512,  dwdr: 0x31, eecr: 0x1F },
    Device { signature: 0x9406, name: "ATmega168",  flash_size: 16384, page_size: 128, sram_base: 0x100, sram_size: 1024, eeprom_size: 512,  dwdr: 0x31, eecr: 0x1F },
    Device { signature: 0x940B, name: "ATmega168PA", flash_size: 16384, page_size: 128, sram_base: 0x100, sram_size: 1024, eeprom_size: 512, dwdr: 0x31, eecr: 0x1F },
    Device { signature: 0x9514, name: "ATmega328",  flash_size: 32768, page_size: 128, sram_base: 0x100, sram_size: 2048, eeprom_size: 1024, dwdr: 0x31, eecr: 0x1F },
    Device { signature: 0x950F, name: "ATmega328P", flash_size: 32768, page_size: 128, sram_base: 0x100, sram_size: 2048, eeprom_size: 1024, dwdr: 0x31, eecr: 0x1F },
];

pub fn by_signature(signature: u16) -> Option<&'static Device> {
    DEVICES.iter().find(|d| d.signature == signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_are_unique() {
        for (i, a) in DEVICES.iter().enumerate() {
            for b in &DEVICES[i + 1..] {
                assert_ne!(a.signature, b.signature, "{} / {}", a.name, b.name);
            }
        }
    }

    #[test]
    fn dwdr_data_address_tracks_io_address() {
        for d in DEVICES {
            assert_eq!(d.dwdr_addr(), u16::from(d.dwdr) + 0x20, "{}", d.name);
        }
    }

    #[test]
    fn eeprom_block_is_contiguous() {
        for d in DEVICES {
            assert_eq!(d.eedr(), d.eecr + 1);
            assert_eq!(d.eearl(), d.eecr + 2);
            assert_eq!(d.eearh(), d.eecr + 3);
        }
    }

    #[test]
    fn lookup() {
        assert_eq!(by_signature(0x930B).unwrap().name, "ATtiny85");
        assert_eq!(by_signature(0x950F).unwrap().flash_size, 32768);
        assert!(by_signature(0xBEEF).is_none());
    }
}
