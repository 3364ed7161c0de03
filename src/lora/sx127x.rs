//! SX127x transceiver driver.
//!
//! Drives the chip through a [`RegisterBus`]. The board glue calls
//! [`Sx127x::on_dio0`] from its DIO0 interrupt handler; the driver reads and
//! clears the IRQ flags and fires the sink of the pending operation.

use super::config::RadioConfig;
use super::registers::{self, mode, reg, DioMapping, IrqFlags, RegisterBus};
use crate::gateway::radio::{CompletionSink, LinkQuality, RadioError, RadioEvent, Transceiver};
use log::{debug, info, warn};

/// FIFO size.
pub const MAX_PACKET_LEN: usize = 255;

pub struct Sx127x<B: RegisterBus> {
    bus: B,
    config: RadioConfig,
    pending: Option<CompletionSink>,
    /// IRQ flags seen by the last DIO0 interrupt.
    last_irq: IrqFlags,
}

impl<B: RegisterBus> Sx127x<B> {
    /// Check the chip version and apply `config`. Leaves the radio in standby.
    pub fn new(mut bus: B, config: RadioConfig) -> Result<Self, RadioError> {
        let version = bus.read_register(reg::VERSION)?;
        if version != registers::SX1272_VERSION {
            return Err(RadioError::UnexpectedVersion(version));
        }

        let mut radio = Self {
            bus,
            config,
            pending: None,
            last_irq: IrqFlags::default(),
        };
        radio.configure()?;
        info!(
            "SX127x ready: {} MHz SF{} CR4/{}",
            radio.config.frequency_mhz,
            radio.config.spreading_factor,
            radio.config.coding_rate.denominator()
        );
        Ok(radio)
    }

    fn configure(&mut self) -> Result<(), RadioError> {
        let config = self.config.clone();
        let bus = &mut self.bus;

        // LoRa mode can only be selected from sleep.
        registers::set_mode(bus, mode::SLEEP)?;
        registers::set_frequency(bus, config.frequency_mhz)?;
        registers::update_modem_config_1(bus, |m| {
            m.bandwidth = config.bandwidth.code();
            m.coding_rate = config.coding_rate.code();
            m.implicit_header = false;
            m.rx_crc = config.rx_crc;
            m.low_data_rate_optimize = config.low_data_rate_optimize;
        })?;
        registers::update_modem_config_2(bus, |m| {
            m.spreading_factor = config.spreading_factor;
            m.tx_continuous = false;
        })?;
        bus.write_register(reg::SYNC_WORD, config.sync_word)?;
        bus.write_register(reg::MAX_PAYLOAD_LENGTH, config.max_payload)?;
        bus.write_register(reg::HOP_PERIOD, 0)?;
        bus.write_register(reg::PA_CONFIG, config.pa_config)?;
        bus.write_register(reg::LNA, registers::LNA_MAX_GAIN)?;
        bus.write_register(reg::FIFO_TX_BASE_ADDR, 0)?;
        bus.write_register(reg::FIFO_RX_BASE_ADDR, 0)?;
        registers::set_mode(bus, mode::STDBY)?;
        Ok(())
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// DIO0 interrupt. Returns the event that was reported, if any.
    pub fn on_dio0(&mut self) -> Result<Option<RadioEvent>, RadioError> {
        let flags = registers::irq_flags(&mut self.bus)?;
        registers::clear_irq_flags(&mut self.bus, IrqFlags::ALL)?;
        self.last_irq = flags;

        let Some(sink) = &self.pending else {
            debug!("DIO0 with no pending operation (flags 0x{:02X})", flags.0);
            return Ok(None);
        };

        let done = match sink.event() {
            RadioEvent::RxDone => flags.contains(IrqFlags::RX_DONE),
            RadioEvent::TxDone => flags.contains(IrqFlags::TX_DONE),
        };
        if !done {
            return Ok(None);
        }

        let event = sink.event();
        if !sink.fire() {
            warn!("Radio event {:?} lost: scheduler queue full", event);
        }
        if event == RadioEvent::TxDone {
            // The chip drops to standby after a single transmission.
            self.pending = None;
        }
        Ok(Some(event))
    }
}

impl<B: RegisterBus + Send> Transceiver for Sx127x<B> {
    fn set_receive_continuous(&mut self, on_done: CompletionSink) -> Result<(), RadioError> {
        registers::update_dio_mapping(&mut self.bus, |m| {
            m.dio0 = DioMapping::DIO0_RX_DONE;
            m.dio3 = DioMapping::DIO3_CRC_ERROR;
        })?;
        registers::clear_irq_flags(&mut self.bus, IrqFlags::ALL)?;
        registers::set_mode(&mut self.bus, mode::RX_CONTINUOUS)?;
        self.pending = Some(on_done);
        Ok(())
    }

    fn set_transmit(&mut self, payload: &[u8], on_done: CompletionSink) -> Result<(), RadioError> {
        if payload.is_empty() {
            return Err(RadioError::EmptyPacket);
        }
        let max = MAX_PACKET_LEN.min(usize::from(self.config.max_payload));
        if payload.len() > max {
            return Err(RadioError::PacketTooLarge {
                size: payload.len(),
                max,
            });
        }

        // FIFO is only accessible outside RX/TX.
        registers::set_mode(&mut self.bus, mode::STDBY)?;
        registers::update_dio_mapping(&mut self.bus, |m| {
            m.dio0 = DioMapping::DIO0_TX_DONE;
            m.dio3 = DioMapping::DIO3_CRC_ERROR;
        })?;
        self.bus.write_register(reg::PAYLOAD_LENGTH, payload.len() as u8)?;
        self.bus.write_register(reg::FIFO_TX_BASE_ADDR, 0)?;
        self.bus.write_register(reg::FIFO_ADDR_PTR, 0)?;
        self.bus.write_fifo(payload)?;
        registers::clear_irq_flags(&mut self.bus, IrqFlags::ALL)?;
        registers::set_mode(&mut self.bus, mode::TX)?;
        self.pending = Some(on_done);
        Ok(())
    }

    fn read_received_payload(&mut self) -> Result<Vec<u8>, RadioError> {
        let current = self.bus.read_register(reg::FIFO_RX_CURR_ADDR)?;
        let len = self.bus.read_register(reg::RX_NB_BYTES)?;
        self.bus.write_register(reg::FIFO_ADDR_PTR, current)?;
        Ok(self.bus.read_fifo(usize::from(len))?)
    }

    fn crc_ok(&mut self) -> Result<bool, RadioError> {
        Ok(!self.last_irq.contains(IrqFlags::PAYLOAD_CRC_ERROR))
    }

    fn link_quality(&mut self) -> Result<LinkQuality, RadioError> {
        Ok(LinkQuality {
            snr: registers::packet_snr(&mut self.bus)?,
            rssi: registers::packet_rssi(&mut self.bus)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::registers::tests::FakeBus;
    use tokio::sync::mpsc;

    fn radio() -> Sx127x<FakeBus> {
        let mut bus = FakeBus::new();
        bus.registers[reg::VERSION as usize] = registers::SX1272_VERSION;
        Sx127x::new(bus, RadioConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_unknown_chip() {
        let mut bus = FakeBus::new();
        bus.registers[reg::VERSION as usize] = 0x12;
        assert!(matches!(
            Sx127x::new(bus, RadioConfig::default()),
            Err(RadioError::UnexpectedVersion(0x12))
        ));
    }

    #[test]
    fn test_configure_writes_defaults() {
        let radio = radio();
        let bus = radio.bus();
        assert_eq!(bus.registers[reg::SYNC_WORD as usize], 0x34);
        assert_eq!(bus.registers[reg::MODEM_CONFIG_2 as usize] >> 4, 12);
        assert_eq!(bus.registers[reg::MAX_PAYLOAD_LENGTH as usize], 0xFF);
        assert_eq!(bus.registers[reg::LNA as usize], registers::LNA_MAX_GAIN);
        assert_eq!(bus.wrote(reg::OP_MODE), vec![mode::SLEEP, mode::STDBY]);
    }

    #[test]
    fn test_transmit_fills_fifo_and_fires_tx_done() {
        let mut radio = radio();
        let (tx, mut rx) = mpsc::channel(4);
        radio
            .set_transmit(&[0x02, 0x01, 0xAA], CompletionSink::new(tx, RadioEvent::TxDone))
            .unwrap();

        let bus = radio.bus();
        assert_eq!(&bus.fifo[..3], &[0x02, 0x01, 0xAA]);
        assert_eq!(bus.registers[reg::PAYLOAD_LENGTH as usize], 3);
        assert_eq!(bus.registers[reg::OP_MODE as usize], mode::TX);
        assert_eq!(bus.registers[reg::DIO_MAPPING_1 as usize] >> 6, DioMapping::DIO0_TX_DONE);

        radio.bus_mut().registers[reg::IRQ_FLAGS as usize] = IrqFlags::TX_DONE;
        assert_eq!(radio.on_dio0().unwrap(), Some(RadioEvent::TxDone));
        assert_eq!(rx.try_recv().ok(), Some(RadioEvent::TxDone));
        assert_eq!(radio.bus().registers[reg::IRQ_FLAGS as usize], 0);

        // Nothing pending anymore.
        radio.bus_mut().registers[reg::IRQ_FLAGS as usize] = IrqFlags::TX_DONE;
        assert_eq!(radio.on_dio0().unwrap(), None);
    }

    #[test]
    fn test_transmit_rejects_bad_sizes() {
        let mut radio = radio();
        let (tx, _rx) = mpsc::channel(1);
        let sink = CompletionSink::new(tx, RadioEvent::TxDone);
        assert!(matches!(radio.set_transmit(&[], sink.clone()), Err(RadioError::EmptyPacket)));
        assert!(matches!(
            radio.set_transmit(&[0u8; 256], sink),
            Err(RadioError::PacketTooLarge { size: 256, max: 255 })
        ));
    }

    #[test]
    fn test_receive_reads_from_current_address() {
        let mut radio = radio();
        let (tx, mut rx) = mpsc::channel(4);
        radio
            .set_receive_continuous(CompletionSink::new(tx, RadioEvent::RxDone))
            .unwrap();
        assert_eq!(radio.bus().registers[reg::OP_MODE as usize], mode::RX_CONTINUOUS);

        {
            let bus = radio.bus_mut();
            bus.fifo[0x40..0x44].copy_from_slice(&[0x0D, 0x00, 0x12, 0x34]);
            bus.registers[reg::FIFO_RX_CURR_ADDR as usize] = 0x40;
            bus.registers[reg::RX_NB_BYTES as usize] = 4;
            bus.registers[reg::PKT_SNR_VALUE as usize] = 40;
            bus.registers[reg::PKT_RSSI_VALUE as usize] = 100;
            bus.registers[reg::IRQ_FLAGS as usize] = IrqFlags::RX_DONE | IrqFlags::VALID_HEADER;
        }

        assert_eq!(radio.on_dio0().unwrap(), Some(RadioEvent::RxDone));
        assert_eq!(rx.try_recv().ok(), Some(RadioEvent::RxDone));
        assert!(radio.crc_ok().unwrap());
        assert_eq!(radio.read_received_payload().unwrap(), vec![0x0D, 0x00, 0x12, 0x34]);
        let link = radio.link_quality().unwrap();
        assert_eq!(link.snr, 10.0);
        assert_eq!(link.rssi, -39);
    }

    #[test]
    fn test_crc_error_is_reported() {
        let mut radio = radio();
        let (tx, _rx) = mpsc::channel(4);
        radio
            .set_receive_continuous(CompletionSink::new(tx, RadioEvent::RxDone))
            .unwrap();
        radio.bus_mut().registers[reg::IRQ_FLAGS as usize] =
            IrqFlags::RX_DONE | IrqFlags::PAYLOAD_CRC_ERROR;
        radio.on_dio0().unwrap();
        assert!(!radio.crc_ok().unwrap());
    }
}
