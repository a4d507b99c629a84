#![deny(unused_must_use)]

use anyhow::ensure;
use dwprobe::littlewire::tools::{list_littlewire_devices, open_device_from_selector, DebugProbeSelector};
use dwprobe::target::Target;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let selector = match std::env::args().nth(1) {
        Some(arg) => DebugProbeSelector::try_from(arg)?,
        None => {
            let devs = list_littlewire_devices();
            ensure!(!devs.is_empty(), "no LittleWire/Digispark adapter found");
            for dev in &devs {
                tracing::debug!("found {}", dev);
            }
            devs[0].selector()
        }
    };

    let port = open_device_from_selector(&selector)?;
    let mut target = Target::connect(port)?;
    let device = target.device();
    tracing::info!(
        "attached to {} ({} bytes flash in {}-byte pages, {} bytes SRAM, {} bytes EEPROM)",
        device.name,
        device.flash_size,
        device.page_size,
        device.sram_size,
        device.eeprom_size
    );

    let mut regs = [0u8; 32];
    target.get_regs(0, &mut regs)?;
    tracing::info!("r0..r31: {:02x?}", regs);

    let mut sram = [0u8; 16];
    target.read_addr(device.sram_base, &mut sram)?;
    tracing::info!("sram at {:#06x}: {:02x?}", device.sram_base, sram);

    let mut vectors = [0u8; 16];
    target.read_flash(0, &mut vectors)?;
    tracing::info!("flash at 0x0000: {:02x?}", vectors);

    tracing::info!("pc = {:#06x}", target.pc);
    target.trace()?;
    tracing::info!("stepped, pc = {:#06x}", target.pc);

    Ok(())
}
