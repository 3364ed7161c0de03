//! SX127x register map and field helpers.
//!
//! Several settings share one register byte, so every field update is a
//! read-modify-write that keeps the bits it does not own. The layout of
//! ModemConfig1/2 follows the SX1272.

use std::io;

/// Register addresses.
pub mod reg {
    pub const FIFO: u8 = 0x00;
    pub const OP_MODE: u8 = 0x01;
    pub const FR_MSB: u8 = 0x06;
    pub const FR_MID: u8 = 0x07;
    pub const FR_LSB: u8 = 0x08;
    pub const PA_CONFIG: u8 = 0x09;
    pub const LNA: u8 = 0x0C;
    pub const FIFO_ADDR_PTR: u8 = 0x0D;
    pub const FIFO_TX_BASE_ADDR: u8 = 0x0E;
    pub const FIFO_RX_BASE_ADDR: u8 = 0x0F;
    pub const FIFO_RX_CURR_ADDR: u8 = 0x10;
    pub const IRQ_FLAGS: u8 = 0x12;
    pub const RX_NB_BYTES: u8 = 0x13;
    pub const PKT_SNR_VALUE: u8 = 0x19;
    pub const PKT_RSSI_VALUE: u8 = 0x1A;
    pub const MODEM_CONFIG_1: u8 = 0x1D;
    pub const MODEM_CONFIG_2: u8 = 0x1E;
    pub const PAYLOAD_LENGTH: u8 = 0x22;
    pub const MAX_PAYLOAD_LENGTH: u8 = 0x23;
    pub const HOP_PERIOD: u8 = 0x24;
    pub const SYNC_WORD: u8 = 0x39;
    pub const DIO_MAPPING_1: u8 = 0x40;
    pub const VERSION: u8 = 0x42;
}

/// OP_MODE values with the LoRa bit set.
pub mod mode {
    pub const SLEEP: u8 = 0x80;
    pub const STDBY: u8 = 0x81;
    pub const TX: u8 = 0x83;
    pub const RX_CONTINUOUS: u8 = 0x85;
    pub const CAD: u8 = 0x87;
}

/// VERSION register of an SX1272.
pub const SX1272_VERSION: u8 = 0x22;

/// LNA register value for maximum gain with boost.
pub const LNA_MAX_GAIN: u8 = 0x23;

/// Subtracted from PKT_RSSI_VALUE to get dBm.
pub const RSSI_OFFSET: i16 = 139;

/// FRF steps per MHz (2^19 / 32 MHz).
const FRF_PER_MHZ: f64 = 16384.0;

/// Register-level access to the chip. SPI on hardware, an array in tests.
pub trait RegisterBus {
    fn read_register(&mut self, addr: u8) -> io::Result<u8>;

    fn write_register(&mut self, addr: u8, value: u8) -> io::Result<()>;

    /// Burst read from the FIFO at the current FIFO pointer.
    fn read_fifo(&mut self, len: usize) -> io::Result<Vec<u8>> {
        (0..len).map(|_| self.read_register(reg::FIFO)).collect()
    }

    fn write_fifo(&mut self, data: &[u8]) -> io::Result<()> {
        data.iter()
            .try_for_each(|byte| self.write_register(reg::FIFO, *byte))
    }
}

/// ModemConfig1 fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemConfig1 {
    /// 2 bits
    pub bandwidth: u8,
    /// 3 bits
    pub coding_rate: u8,
    pub implicit_header: bool,
    pub rx_crc: bool,
    pub low_data_rate_optimize: bool,
}

impl ModemConfig1 {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            bandwidth: byte >> 6,
            coding_rate: (byte >> 3) & 0x07,
            implicit_header: byte & 0x04 != 0,
            rx_crc: byte & 0x02 != 0,
            low_data_rate_optimize: byte & 0x01 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        ((self.bandwidth & 0x03) << 6)
            | ((self.coding_rate & 0x07) << 3)
            | (u8::from(self.implicit_header) << 2)
            | (u8::from(self.rx_crc) << 1)
            | u8::from(self.low_data_rate_optimize)
    }
}

/// ModemConfig2 fields. The low three bits (AGC and symbol timeout MSBs)
/// are not owned by this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemConfig2 {
    /// 4 bits
    pub spreading_factor: u8,
    pub tx_continuous: bool,
}

impl ModemConfig2 {
    const PRESERVED: u8 = 0x07;

    pub fn from_byte(byte: u8) -> Self {
        Self {
            spreading_factor: byte >> 4,
            tx_continuous: byte & 0x08 != 0,
        }
    }

    /// Merge into `current`, keeping its low bits.
    pub fn merge_into(self, current: u8) -> u8 {
        ((self.spreading_factor & 0x0F) << 4)
            | (u8::from(self.tx_continuous) << 3)
            | (current & Self::PRESERVED)
    }
}

/// DIO_MAPPING_1: two bits per DIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DioMapping {
    pub dio0: u8,
    pub dio1: u8,
    pub dio2: u8,
    pub dio3: u8,
}

impl DioMapping {
    /// DIO0 signals RxDone.
    pub const DIO0_RX_DONE: u8 = 0;
    /// DIO0 signals TxDone.
    pub const DIO0_TX_DONE: u8 = 1;
    /// DIO3 signals ValidHeader.
    pub const DIO3_VALID_HEADER: u8 = 1;
    /// DIO3 signals PayloadCrcError.
    pub const DIO3_CRC_ERROR: u8 = 3;

    pub fn from_byte(byte: u8) -> Self {
        Self {
            dio0: byte >> 6,
            dio1: (byte >> 4) & 0x03,
            dio2: (byte >> 2) & 0x03,
            dio3: byte & 0x03,
        }
    }

    pub fn to_byte(self) -> u8 {
        ((self.dio0 & 0x03) << 6)
            | ((self.dio1 & 0x03) << 4)
            | ((self.dio2 & 0x03) << 2)
            | (self.dio3 & 0x03)
    }
}

/// IRQ_FLAGS bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqFlags(pub u8);

impl IrqFlags {
    pub const RX_TIMEOUT: u8 = 0x80;
    pub const RX_DONE: u8 = 0x40;
    pub const PAYLOAD_CRC_ERROR: u8 = 0x20;
    pub const VALID_HEADER: u8 = 0x10;
    pub const TX_DONE: u8 = 0x08;
    pub const CAD_DONE: u8 = 0x04;
    pub const FHSS_CHANGE: u8 = 0x02;
    pub const CAD_DETECTED: u8 = 0x01;
    pub const ALL: u8 = 0xFF;

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

/// Read ModemConfig1, apply `update`, write it back.
pub fn update_modem_config_1<B: RegisterBus + ?Sized>(
    bus: &mut B,
    update: impl FnOnce(&mut ModemConfig1),
) -> io::Result<ModemConfig1> {
    let mut config = ModemConfig1::from_byte(bus.read_register(reg::MODEM_CONFIG_1)?);
    update(&mut config);
    bus.write_register(reg::MODEM_CONFIG_1, config.to_byte())?;
    Ok(config)
}

/// Read ModemConfig2, apply `update`, write it back keeping the low bits.
pub fn update_modem_config_2<B: RegisterBus + ?Sized>(
    bus: &mut B,
    update: impl FnOnce(&mut ModemConfig2),
) -> io::Result<ModemConfig2> {
    let current = bus.read_register(reg::MODEM_CONFIG_2)?;
    let mut config = ModemConfig2::from_byte(current);
    update(&mut config);
    bus.write_register(reg::MODEM_CONFIG_2, config.merge_into(current))?;
    Ok(config)
}

pub fn update_dio_mapping<B: RegisterBus + ?Sized>(
    bus: &mut B,
    update: impl FnOnce(&mut DioMapping),
) -> io::Result<DioMapping> {
    let mut mapping = DioMapping::from_byte(bus.read_register(reg::DIO_MAPPING_1)?);
    update(&mut mapping);
    bus.write_register(reg::DIO_MAPPING_1, mapping.to_byte())?;
    Ok(mapping)
}

pub fn irq_flags<B: RegisterBus + ?Sized>(bus: &mut B) -> io::Result<IrqFlags> {
    Ok(IrqFlags(bus.read_register(reg::IRQ_FLAGS)?))
}

/// Clear `flags`. IRQ_FLAGS is write-one-to-clear, so only the given bits
/// are written and other pending flags survive.
pub fn clear_irq_flags<B: RegisterBus + ?Sized>(bus: &mut B, flags: u8) -> io::Result<()> {
    bus.write_register(reg::IRQ_FLAGS, flags)
}

pub fn set_mode<B: RegisterBus + ?Sized>(bus: &mut B, mode: u8) -> io::Result<()> {
    bus.write_register(reg::OP_MODE, mode)
}

pub fn set_frequency<B: RegisterBus + ?Sized>(bus: &mut B, mhz: f64) -> io::Result<()> {
    let frf = (mhz * FRF_PER_MHZ) as u32;
    bus.write_register(reg::FR_MSB, (frf >> 16) as u8)?;
    bus.write_register(reg::FR_MID, (frf >> 8) as u8)?;
    bus.write_register(reg::FR_LSB, frf as u8)
}

pub fn frequency<B: RegisterBus + ?Sized>(bus: &mut B) -> io::Result<f64> {
    let msb = u32::from(bus.read_register(reg::FR_MSB)?);
    let mid = u32::from(bus.read_register(reg::FR_MID)?);
    let lsb = u32::from(bus.read_register(reg::FR_LSB)?);
    Ok(f64::from((msb << 16) | (mid << 8) | lsb) / FRF_PER_MHZ)
}

/// SNR of the last packet in dB (quarter dB steps).
pub fn packet_snr<B: RegisterBus + ?Sized>(bus: &mut B) -> io::Result<f32> {
    let raw = bus.read_register(reg::PKT_SNR_VALUE)? as i8;
    Ok(f32::from(raw) / 4.0)
}

/// RSSI of the last packet in dBm.
pub fn packet_rssi<B: RegisterBus + ?Sized>(bus: &mut B) -> io::Result<i16> {
    Ok(i16::from(bus.read_register(reg::PKT_RSSI_VALUE)?) - RSSI_OFFSET)
}
