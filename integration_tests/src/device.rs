//! Modem communication client.
//!
//! Talks HCI to a WiMOD module on a USB-UART adapter, using the firmware's
//! own framing and parsers.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serialport::SerialPort;

use wimod_lorawan_node::config::hci::{MAX_ENCODED_FRAME, WAKEUP_BYTES};
use wimod_lorawan_node::config::slip::END;
use wimod_lorawan_node::hci::transport::build_frame;
use wimod_lorawan_node::hci::types::{devmgmt, sap};
use wimod_lorawan_node::hci::{HciMessage, HciReceiver};
use wimod_lorawan_node::lorawan::responses::FromResponse;
use wimod_lorawan_node::lorawan::Request;
use wimod_lorawan_node::protocol::slip;

/// Find the first port that answers a ping.
pub fn find_modem_port() -> Result<String> {
    for port_info in serialport::available_ports()? {
        if !port_info.port_name.contains("ttyUSB") && !port_info.port_name.contains("ttyACM") {
            continue;
        }

        if let Ok(mut client) = ModemClient::new(&port_info.port_name, 115200) {
            client.set_timeout(Duration::from_millis(500));
            if client.request(sap::DEVMGMT, devmgmt::PING_REQ, &[]).is_ok() {
                return Ok(port_info.port_name);
            }
        }
    }

    anyhow::bail!("No modem found - ensure the module is connected and powered")
}

/// Resolve a port argument - returns the port path if not "auto", otherwise auto-detects.
pub fn resolve_port(port_arg: &str) -> Result<String> {
    if port_arg == "auto" {
        find_modem_port()
    } else {
        Ok(port_arg.to_string())
    }
}

/// Client for a WiMOD modem on a serial port.
pub struct ModemClient {
    port: Box<dyn SerialPort>,
    receiver: HciReceiver,
    timeout: Duration,
    /// Unsolicited messages seen while waiting for responses
    indications: VecDeque<HciMessage>,
}

impl ModemClient {
    pub fn new(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(50))
            .open()?;

        Ok(Self {
            port,
            receiver: HciReceiver::new(),
            timeout: Duration::from_secs(1),
            indications: VecDeque::new(),
        })
    }

    /// Set the response timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Clear any pending data in the serial buffer.
    pub fn clear_buffer(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::All)?;
        self.indications.clear();
        Ok(())
    }

    /// Frames the receiver dropped on CRC mismatch.
    pub fn crc_errors(&self) -> u32 {
        self.receiver.crc_errors()
    }

    /// Send a raw message, with the wakeup preamble the firmware uses.
    pub fn send(&mut self, sap_id: u8, msg_id: u8, payload: &[u8]) -> Result<()> {
        let frame = build_frame(sap_id, msg_id, payload).map_err(|e| anyhow!("framing failed: {:?}", e))?;
        let mut encoded = [0u8; MAX_ENCODED_FRAME];
        let len = slip::encode(&frame, &mut encoded).map_err(|e| anyhow!("SLIP encoding failed: {:?}", e))?;

        self.port.write_all(&[END; WAKEUP_BYTES])?;
        self.port.write_all(&encoded[..len])?;
        self.port.flush()?;
        Ok(())
    }

    /// Send a request and wait for its response, queueing any indications.
    pub fn request(&mut self, sap_id: u8, msg_id: u8, payload: &[u8]) -> Result<HciMessage> {
        self.send(sap_id, msg_id, payload)?;

        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            if let Some(message) = self.read_message(deadline)? {
                if message.sap_id == sap_id && message.msg_id == msg_id.wrapping_add(1) {
                    return Ok(message);
                }
                self.indications.push_back(message);
            }
        }

        anyhow::bail!("Timeout waiting for response to 0x{:02x}/0x{:02x}", sap_id, msg_id)
    }

    /// Issue a typed request and parse its response.
    pub fn call<R: FromResponse>(&mut self, request: Request, payload: &[u8]) -> Result<R> {
        let response = self.request(request.sap_id(), request.msg_id(), payload)?;
        R::from_response(&response.payload).map_err(|e| anyhow!("{:?}: {}", request, e))
    }

    /// Wait for an indication with the given IDs, keeping any others queued.
    pub fn wait_for_indication(&mut self, sap_id: u8, msg_id: u8, timeout: Duration) -> Result<HciMessage> {
        let matches = |m: &HciMessage| m.sap_id == sap_id && m.msg_id == msg_id;

        if let Some(pos) = self.indications.iter().position(matches) {
            if let Some(message) = self.indications.remove(pos) {
                return Ok(message);
            }
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(message) = self.read_message(deadline)? {
                if matches(&message) {
                    return Ok(message);
                }
                self.indications.push_back(message);
            }
        }

        anyhow::bail!("Timeout waiting for indication 0x{:02x}/0x{:02x}", sap_id, msg_id)
    }

    /// Read bytes until one message is complete or `deadline` passes.
    fn read_message(&mut self, deadline: Instant) -> Result<Option<HciMessage>> {
        let mut buf = [0u8; 1];

        while Instant::now() < deadline {
            match self.port.read(&mut buf) {
                Ok(1) => {
                    if let Some(message) = self.receiver.feed(buf[0]) {
                        return Ok(Some(message));
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }
}
