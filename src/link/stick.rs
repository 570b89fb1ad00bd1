//! # Radio Stick Commands
//!
//! The stick firmware takes one-byte command codes followed by a body and
//! answers with a zero-terminated reply.
//!
//! ```text
//! send and listen: 05 tx_ch repeat delay rx_ch timeout(4, BE) retry <frame> 00
//! reply:           <rssi> <sequence> <frame> 00     or    <status> 00
//! ```

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use super::port_trait::LinkIo;
use super::rssi::rssi_to_dbm;
use super::{LinkTransport, FRAME_TERMINATOR, MAX_REPLY_SIZE};
use crate::error::{PumpLinkError, Result, TransportError};

pub const CMD_GET_STATE: u8 = 0x01;
pub const CMD_GET_VERSION: u8 = 0x02;
pub const CMD_SEND_AND_LISTEN: u8 = 0x05;
pub const CMD_UPDATE_REGISTER: u8 = 0x06;
pub const CMD_RESET: u8 = 0x07;
pub const CMD_READ_REGISTER: u8 = 0x09;

/// Reply to a successful register update
const REGISTER_UPDATED: u8 = 0x01;

/// Link-layer header of a received packet: rssi, sequence
const LINK_HEADER_SIZE: usize = 2;

/// Default timeout for replies to local (non-radio) stick commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Radio parameters of a send-and-listen exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenParams {
    pub tx_channel: u8,
    /// Extra copies of the packet sent back to back (wake-up bursts)
    pub repeat: u8,
    pub delay_ms: u8,
    pub rx_channel: u8,
    pub timeout_ms: u32,
    pub retry: u8,
}

impl ListenParams {
    /// Single transmission, listen for `timeout_ms`
    pub fn once(timeout_ms: u32) -> Self {
        Self {
            tx_channel: 0,
            repeat: 0,
            delay_ms: 0,
            rx_channel: 0,
            timeout_ms,
            retry: 0,
        }
    }

    /// Burst of `repeat` extra copies before listening
    pub fn burst(repeat: u8, timeout_ms: u32) -> Self {
        Self {
            repeat,
            ..Self::once(timeout_ms)
        }
    }
}

/// A packet the stick heard, still line-coded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub rssi_dbm: i16,
    pub sequence: u8,
    pub frame: Vec<u8>,
}

/// Command-level access to the radio stick
pub struct RadioStick<P: LinkIo> {
    link: LinkTransport<P>,
    rssi_offset_db: f64,
    /// Reply deadline of local commands, also the slack after a radio listen
    command_timeout: Duration,
}

impl<P: LinkIo> std::fmt::Debug for RadioStick<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioStick")
            .field("link", &self.link)
            .field("rssi_offset_db", &self.rssi_offset_db)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl<P: LinkIo> RadioStick<P> {
    pub fn new(link: LinkTransport<P>, rssi_offset_db: f64) -> Self {
        Self {
            link,
            rssi_offset_db,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Path of the underlying device
    pub fn device_path(&self) -> &str {
        self.link.device_path()
    }

    /// Release the stick, handing back the transport
    pub fn into_link(self) -> LinkTransport<P> {
        self.link
    }

    /// Ask the firmware whether it is ready
    pub async fn get_state(&mut self) -> Result<bool> {
        self.link.write(&[CMD_GET_STATE]).await?;
        let reply = self.link.read(MAX_REPLY_SIZE, self.command_timeout).await?;
        Ok(reply == b"OK")
    }

    /// Firmware version string
    pub async fn get_version(&mut self) -> Result<String> {
        self.link.write(&[CMD_GET_VERSION]).await?;
        let reply = self.link.read(MAX_REPLY_SIZE, self.command_timeout).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Reset the radio chip; no reply is expected
    pub async fn reset(&mut self) -> Result<()> {
        self.link.write(&[CMD_RESET]).await
    }

    /// Write one radio register
    ///
    /// # Errors
    ///
    /// Returns a decode error if the firmware does not confirm the update
    pub async fn update_register(&mut self, register: u8, value: u8) -> Result<()> {
        self.link.write(&[CMD_UPDATE_REGISTER, register, value]).await?;
        let reply = self.link.read(MAX_REPLY_SIZE, self.command_timeout).await?;

        if reply != [REGISTER_UPDATED] {
            return Err(PumpLinkError::Decode(format!(
                "register 0x{:02X} update answered with {:02X?}",
                register, reply
            )));
        }
        trace!("Register 0x{:02X} <- 0x{:02X}", register, value);
        Ok(())
    }

    /// Read one radio register
    pub async fn read_register(&mut self, register: u8) -> Result<u8> {
        self.link.write(&[CMD_READ_REGISTER, register]).await?;
        // value + terminator; either may be zero
        let reply = self.link.read_fixed(2, self.command_timeout).await?;
        Ok(reply[0])
    }

    /// Transmit an encoded packet and wait for the pump's answer
    ///
    /// # Errors
    ///
    /// Returns a radio status error when the stick heard nothing, or a
    /// transport error when the stick itself did not answer in time.
    pub async fn send_and_listen(&mut self, frame: &[u8], params: &ListenParams) -> Result<ReceivedPacket> {
        let command = send_and_listen_command(frame, params);
        self.link.write(&command).await?;

        // The stick answers after its own radio timeout and every burst copy
        let wait = Duration::from_millis(u64::from(params.timeout_ms) * (u64::from(params.retry) + 1))
            + Duration::from_millis(u64::from(params.repeat) * u64::from(params.delay_ms))
            + self.command_timeout;
        let reply = self.link.read(MAX_REPLY_SIZE, wait).await?;

        if reply.len() <= LINK_HEADER_SIZE {
            debug!("Radio reply too short for a packet: {:02X?}", reply);
            return Err(TransportError::Interrupted.into());
        }

        let packet = ReceivedPacket {
            rssi_dbm: rssi_to_dbm(reply[0], self.rssi_offset_db),
            sequence: reply[1],
            frame: reply[LINK_HEADER_SIZE..].to_vec(),
        };
        trace!("Heard packet #{} at {} dBm", packet.sequence, packet.rssi_dbm);
        Ok(packet)
    }
}

/// Build the send-and-listen command bytes
pub fn send_and_listen_command(frame: &[u8], params: &ListenParams) -> Vec<u8> {
    let mut command = BytesMut::with_capacity(9 + frame.len() + 1);
    command.put_u8(CMD_SEND_AND_LISTEN);
    command.put_u8(params.tx_channel);
    command.put_u8(params.repeat);
    command.put_u8(params.delay_ms);
    command.put_u8(params.rx_channel);
    command.put_u32(params.timeout_ms);
    command.put_u8(params.retry);
    command.put_slice(frame);
    command.put_u8(FRAME_TERMINATOR);
    command.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RadioStatus;
    use crate::link::port_trait::mocks::ScriptedPort;
    use crate::link::rssi::DEFAULT_RSSI_OFFSET_DB;

    fn stick(port: &ScriptedPort) -> RadioStick<ScriptedPort> {
        RadioStick::new(LinkTransport::with_port(port.clone(), "mock"), DEFAULT_RSSI_OFFSET_DB)
    }

    #[tokio::test]
    async fn test_command_timeout_is_configurable() {
        let port = ScriptedPort::new();
        let mut stick = stick(&port).with_command_timeout(Duration::from_millis(20));

        let err = stick.get_state().await.unwrap_err();
        assert!(matches!(
            err,
            PumpLinkError::Transport(TransportError::ReadTimeout { waited_ms: 20 })
        ));
    }

    #[test]
    fn test_send_and_listen_command_layout() {
        let command = send_and_listen_command(&[0xA9, 0x65], &ListenParams::burst(3, 250));
        assert_eq!(
            command,
            vec![0x05, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFA, 0x00, 0xA9, 0x65, 0x00]
        );
    }

    #[tokio::test]
    async fn test_get_state() {
        let port = ScriptedPort::new();
        port.reply(b"OK\0");
        let mut stick = stick(&port);

        assert!(stick.get_state().await.unwrap());
        assert_eq!(port.get_written_data(), vec![vec![CMD_GET_STATE]]);
    }

    #[tokio::test]
    async fn test_get_version() {
        let port = ScriptedPort::new();
        port.reply(b"subg_rfspy 0.9\0");
        let mut stick = stick(&port);

        assert_eq!(stick.get_version().await.unwrap(), "subg_rfspy 0.9");
    }

    #[tokio::test]
    async fn test_update_register() {
        let port = ScriptedPort::new();
        port.reply(&[0x01, 0x00]);
        let mut stick = stick(&port);

        stick.update_register(0x09, 0x26).await.unwrap();
        assert_eq!(port.get_written_data(), vec![vec![CMD_UPDATE_REGISTER, 0x09, 0x26]]);
    }

    #[tokio::test]
    async fn test_update_register_rejected() {
        let port = ScriptedPort::new();
        port.reply(&[0x02, 0x00]);
        let mut stick = stick(&port);

        assert!(matches!(
            stick.update_register(0x09, 0x26).await,
            Err(PumpLinkError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_read_register_value_colliding_with_status_code() {
        let port = ScriptedPort::new();
        port.reply(&[0xAA, 0x00]);
        port.reply(&[0x00, 0x00]);
        let mut stick = stick(&port);

        assert_eq!(stick.read_register(0x0B).await.unwrap(), 0xAA);
        assert_eq!(stick.read_register(0x0B).await.unwrap(), 0x00);
    }

    #[tokio::test]
    async fn test_send_and_listen_splits_link_header() {
        let port = ScriptedPort::new();
        port.reply(&[0x20, 0x07, 0xA9, 0x65, 0x99, 0x00]);
        let mut stick = stick(&port);

        let packet = stick
            .send_and_listen(&[0xA9, 0x65], &ListenParams::once(100))
            .await
            .unwrap();
        assert_eq!(packet.rssi_dbm, -57);
        assert_eq!(packet.sequence, 7);
        assert_eq!(packet.frame, vec![0xA9, 0x65, 0x99]);
    }

    #[tokio::test]
    async fn test_send_and_listen_radio_timeout() {
        let port = ScriptedPort::new();
        port.reply(&[0xAA, 0x00]);
        let mut stick = stick(&port);

        let err = stick
            .send_and_listen(&[0xA9, 0x65], &ListenParams::once(100))
            .await
            .unwrap_err();
        assert!(matches!(err, PumpLinkError::RadioStatus(RadioStatus::Timeout)));
    }
}
