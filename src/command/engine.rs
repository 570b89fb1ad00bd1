//! # Command Engine
//!
//! Stateless executor for [`CommandSpec`]s over a [`RadioStick`].
//!
//! Every invocation owns its buffers and its retry counters; nothing carries
//! over between commands. The stick is borrowed mutably for the whole
//! invocation, so exchanges of two commands can never interleave.

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use super::{CommandKind, CommandSpec, Exchange, Prelude, PumpCommand, Response, RetryBudget};
use crate::codec::decoder::parse_inbound;
use crate::codec::encoder::build_outbound;
use crate::codec::protocol::{Packet, PumpSerial, ResponseShape, OPCODE_ACK, OPCODE_NAK, PUMP_RECIPIENT};
use crate::config::RetryConfig;
use crate::error::{ProtocolError, Result};
use crate::link::port_trait::LinkIo;
use crate::link::{ListenParams, RadioStick};
use crate::radio::tuner::RssiProbe;

/// Payload of the ACK and NAK commands
const FLOW_CONTROL_PAYLOAD: [u8; 1] = [0x00];

/// Default radio listen window per exchange
pub const DEFAULT_LISTEN_TIMEOUT_MS: u32 = 250;

/// One received and validated packet
struct Reply {
    packet: Packet,
    rssi_dbm: i16,
}

/// Executes pump commands for one pump
#[derive(Debug, Clone)]
pub struct CommandEngine {
    serial: PumpSerial,
    recipient: u8,
    listen_timeout_ms: u32,
    /// Session-wide `init_attempts` / `nak_retries` replacing the per-command ones
    retry_override: Option<(u32, u32)>,
}

impl CommandEngine {
    pub fn new(serial: PumpSerial) -> Self {
        Self {
            serial,
            recipient: PUMP_RECIPIENT,
            listen_timeout_ms: DEFAULT_LISTEN_TIMEOUT_MS,
            retry_override: None,
        }
    }

    pub fn with_listen_timeout(mut self, listen_timeout_ms: u32) -> Self {
        self.listen_timeout_ms = listen_timeout_ms;
        self
    }

    /// Apply configured prelude and NAK budgets to every big transfer
    pub fn with_retries(mut self, retries: &RetryConfig) -> Self {
        self.retry_override = Some((retries.init_attempts, retries.nak_retries));
        self
    }

    pub fn serial(&self) -> PumpSerial {
        self.serial
    }

    /// Budget actually used for a big transfer
    pub fn effective_budget(&self, budget: RetryBudget) -> RetryBudget {
        match self.retry_override {
            Some((init_attempts, nak_retries)) => RetryBudget {
                init_attempts,
                nak_retries,
                ..budget
            },
            None => budget,
        }
    }

    /// Run a command and decode its response
    ///
    /// # Errors
    ///
    /// Any transport, packet, protocol or decode error. Decode failures
    /// discard the response.
    pub async fn execute<P, C>(&self, stick: &mut RadioStick<P>, command: &C) -> Result<C::Output>
    where
        P: LinkIo,
        C: PumpCommand + ?Sized,
    {
        let spec = command.spec();
        let payload = command.build_payload();
        let response = self.exchange(stick, &spec, &payload).await?;
        command.decode_response(&response)
    }

    /// Run the exchange a spec describes and return the raw response
    pub async fn exchange<P: LinkIo>(&self, stick: &mut RadioStick<P>, spec: &CommandSpec, payload: &[u8]) -> Result<Response> {
        debug!("{} (0x{:02X}) payload {:02X?}", spec.name, spec.opcode, payload);

        match spec.exchange {
            Exchange::Simple { kind } => self.simple(stick, spec, kind, payload).await,
            Exchange::BigTransfer {
                prelude,
                kind,
                budget,
                end_marker,
            } => {
                let budget = self.effective_budget(budget);
                if let Some(prelude) = prelude {
                    self.prelude(stick, spec, prelude, &budget).await?;
                }
                match kind {
                    CommandKind::Set => self.big_set(stick, spec, &budget, payload).await,
                    CommandKind::Get => self.big_get(stick, spec, &budget, end_marker, payload).await,
                }
            }
        }
    }

    /// Run a Simple Get and report how strongly its answer was heard
    pub async fn probe<P: LinkIo>(&self, stick: &mut RadioStick<P>, spec: &CommandSpec) -> Result<i16> {
        let reply = self
            .transact(stick, spec.opcode, &[], ResponseShape::Simple, self.listen_once())
            .await?;
        expect_opcode(spec.opcode, &reply.packet)?;
        Ok(reply.rssi_dbm)
    }

    async fn simple<P: LinkIo>(
        &self,
        stick: &mut RadioStick<P>,
        spec: &CommandSpec,
        kind: CommandKind,
        payload: &[u8],
    ) -> Result<Response> {
        let reply = self
            .transact(stick, spec.opcode, payload, ResponseShape::Simple, self.listen_once())
            .await?;

        match kind {
            CommandKind::Get => expect_opcode(spec.opcode, &reply.packet)?,
            CommandKind::Set => expect_acknowledgement(spec, &reply.packet)?,
        }
        Ok(single(reply))
    }

    /// Send the prelude until the pump acknowledges it
    async fn prelude<P: LinkIo>(
        &self,
        stick: &mut RadioStick<P>,
        spec: &CommandSpec,
        prelude: Prelude,
        budget: &RetryBudget,
    ) -> Result<()> {
        let params = ListenParams::burst(prelude.repeat, self.listen_timeout_ms);

        for attempt in 1..=budget.init_attempts {
            match self
                .transact(stick, prelude.opcode, &[], ResponseShape::Simple, params)
                .await
            {
                Ok(reply) if reply.packet.is_acknowledgement() => {
                    debug!("{}: pump awake after {} prelude attempt(s)", spec.name, attempt);
                    return Ok(());
                }
                Ok(reply) => {
                    debug!("{}: prelude answered with opcode 0x{:02X}", spec.name, reply.packet.opcode);
                }
                Err(e) if e.is_link_failure() => {
                    debug!("{}: prelude attempt {}/{} failed: {}", spec.name, attempt, budget.init_attempts, e);
                }
                Err(e) => return Err(e),
            }
        }

        warn!("{}: pump never acknowledged the prelude", spec.name);
        Err(ProtocolError::BudgetExhausted {
            command: spec.name,
            budget: "init_attempts",
        }
        .into())
    }

    async fn big_set<P: LinkIo>(
        &self,
        stick: &mut RadioStick<P>,
        spec: &CommandSpec,
        budget: &RetryBudget,
        payload: &[u8],
    ) -> Result<Response> {
        let mut naks_left = budget.nak_retries;
        let first = self
            .transact(stick, spec.opcode, payload, ResponseShape::Simple, self.listen_once())
            .await;
        let reply = self
            .with_nak_retry(stick, spec, budget, &mut naks_left, ResponseShape::Simple, first)
            .await?;

        expect_acknowledgement(spec, &reply.packet)?;
        Ok(single(reply))
    }

    async fn big_get<P: LinkIo>(
        &self,
        stick: &mut RadioStick<P>,
        spec: &CommandSpec,
        budget: &RetryBudget,
        end_marker: u8,
        payload: &[u8],
    ) -> Result<Response> {
        let mut naks_left = budget.nak_retries;
        let first = self
            .transact(stick, spec.opcode, payload, ResponseShape::Fragment, self.listen_once())
            .await;
        let reply = self
            .with_nak_retry(stick, spec, budget, &mut naks_left, ResponseShape::Fragment, first)
            .await?;

        let opcode = reply.packet.opcode;
        let mut assembly = FragmentAssembly::new(spec.opcode, end_marker);
        let mut rssi_dbm = reply.rssi_dbm;
        let mut terminal = assembly.accept(reply.packet)?;

        while !terminal {
            if assembly.count() >= budget.fragment_limit() as usize {
                debug!("{}: fragment limit of {} reached", spec.name, budget.fragment_limit());
                break;
            }

            let next = self
                .transact(stick, OPCODE_ACK, &FLOW_CONTROL_PAYLOAD, ResponseShape::Fragment, self.listen_once())
                .await;
            let reply = self
                .with_nak_retry(stick, spec, budget, &mut naks_left, ResponseShape::Fragment, next)
                .await?;

            rssi_dbm = reply.rssi_dbm;
            terminal = assembly.accept(reply.packet)?;
        }

        info!("{}: {} fragments, {} bytes", spec.name, assembly.count(), assembly.len());
        Ok(Response {
            opcode,
            fragments: assembly.count(),
            payload: assembly.into_page(),
            rssi_dbm,
        })
    }

    /// Recover a failed exchange with NAKs
    ///
    /// Only link failures (radio status, transport, bad frame or packet) are
    /// retried; the first answered NAK stands in for the failed reply.
    /// `naks_left` is shared by every exchange of one invocation.
    async fn with_nak_retry<P: LinkIo>(
        &self,
        stick: &mut RadioStick<P>,
        spec: &CommandSpec,
        budget: &RetryBudget,
        naks_left: &mut u32,
        shape: ResponseShape,
        attempt: Result<Reply>,
    ) -> Result<Reply> {
        let mut last_error = match attempt {
            Ok(reply) => return Ok(reply),
            Err(e) if e.is_link_failure() => e,
            Err(e) => return Err(e),
        };

        while *naks_left > 0 {
            *naks_left -= 1;
            let retry = budget.nak_retries - *naks_left;
            warn!(
                "{}: {}; sending NAK {}/{}",
                spec.name, last_error, retry, budget.nak_retries
            );
            match self
                .transact(stick, OPCODE_NAK, &FLOW_CONTROL_PAYLOAD, shape, self.listen_once())
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_link_failure() => last_error = e,
                Err(e) => return Err(e),
            }
        }

        Err(ProtocolError::UnsuccessfulCommand {
            command: spec.name,
            source: Box::new(last_error),
        }
        .into())
    }

    /// One packet out, one validated packet back
    async fn transact<P: LinkIo>(
        &self,
        stick: &mut RadioStick<P>,
        opcode: u8,
        payload: &[u8],
        shape: ResponseShape,
        params: ListenParams,
    ) -> Result<Reply> {
        let frame = build_outbound(opcode, payload, self.serial, self.recipient)?;
        let received = stick.send_and_listen(&frame, &params).await?;
        let packet = parse_inbound(&received.frame, self.recipient, shape)?;

        trace!(
            "0x{:02X} answered by 0x{:02X} {:?} ({} bytes, {} dBm)",
            opcode,
            packet.opcode,
            packet.header,
            packet.payload.len(),
            received.rssi_dbm
        );
        Ok(Reply {
            packet,
            rssi_dbm: received.rssi_dbm,
        })
    }

    fn listen_once(&self) -> ListenParams {
        ListenParams::once(self.listen_timeout_ms)
    }
}

fn single(reply: Reply) -> Response {
    Response {
        opcode: reply.packet.opcode,
        payload: reply.packet.payload,
        rssi_dbm: reply.rssi_dbm,
        fragments: 1,
    }
}

fn expect_opcode(expected: u8, packet: &Packet) -> Result<()> {
    if packet.opcode != expected {
        return Err(ProtocolError::UnexpectedOpcode {
            expected,
            found: packet.opcode,
        }
        .into());
    }
    Ok(())
}

fn expect_acknowledgement(spec: &CommandSpec, packet: &Packet) -> Result<()> {
    if !packet.is_acknowledgement() {
        debug!(
            "{}: expected ACK, got opcode 0x{:02X} payload {:02X?}",
            spec.name, packet.opcode, packet.payload
        );
        return Err(ProtocolError::UnsuccessfulCommand {
            command: spec.name,
            source: Box::new(ProtocolError::NotAcknowledged { command: spec.name }.into()),
        }
        .into());
    }
    Ok(())
}

/// Page under construction, strictly in arrival order
struct FragmentAssembly {
    opcode: u8,
    end_marker: u8,
    page: Vec<u8>,
    count: usize,
}

impl FragmentAssembly {
    fn new(opcode: u8, end_marker: u8) -> Self {
        Self {
            opcode,
            end_marker,
            page: Vec::new(),
            count: 0,
        }
    }

    /// Append a fragment; returns whether it was the terminal one
    fn accept(&mut self, packet: Packet) -> Result<bool> {
        expect_opcode(self.opcode, &packet)?;

        let index = packet.header.raw();
        let (sequence, terminal) = if index >= self.end_marker {
            (index - self.end_marker, true)
        } else {
            (index, false)
        };

        let expected = self.expected_sequence();
        if sequence != expected {
            if sequence >= 1 && sequence < expected {
                return Err(ProtocolError::DuplicateFragment(sequence).into());
            }
            return Err(ProtocolError::FragmentOutOfOrder {
                expected,
                found: sequence,
            }
            .into());
        }

        trace!("Fragment #{}{} accepted", sequence, if terminal { " (last)" } else { "" });
        self.page.extend_from_slice(&packet.payload);
        self.count += 1;
        Ok(terminal)
    }

    fn expected_sequence(&self) -> u8 {
        (self.count + 1).min(usize::from(u8::MAX)) as u8
    }

    fn count(&self) -> usize {
        self.count
    }

    fn len(&self) -> usize {
        self.page.len()
    }

    fn into_page(self) -> Vec<u8> {
        self.page
    }
}

/// Scan probe running one Simple Get through the engine
#[derive(Debug, Clone, Copy)]
pub struct EngineProbe<'a> {
    pub engine: &'a CommandEngine,
    pub spec: CommandSpec,
}

#[async_trait]
impl<'a, P: LinkIo> RssiProbe<RadioStick<P>> for EngineProbe<'a> {
    async fn probe(&self, stick: &mut RadioStick<P>) -> Result<i16> {
        self.engine.probe(stick, &self.spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crc::{crc16, Crc16Variant};
    use crate::codec::decoder::check_page;
    use crate::codec::protocol::FRAGMENT_PAYLOAD_SIZE;
    use crate::error::{PumpLinkError, RadioStatus};
    use crate::link::port_trait::mocks::{ack_reply, pump_reply, sent_packet, status_reply, ScriptedPort};
    use crate::link::rssi::DEFAULT_RSSI_OFFSET_DB;
    use crate::link::LinkTransport;
    use tokio_test::{assert_err, assert_ok};

    const SERIAL: PumpSerial = PumpSerial([0x79, 0x91, 0x63]);
    const READ_MODEL: CommandSpec = CommandSpec::simple_get("read_model", 0x8D);
    const SUSPEND: CommandSpec = CommandSpec::simple_set("suspend", 0x4D);
    const POWER_ON: CommandSpec = CommandSpec::woken_set("power_on", 0x5D, 50);
    const HISTORY: CommandSpec = CommandSpec::big_get("read_history_page", 0x80, 15);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn stick(port: &ScriptedPort) -> RadioStick<ScriptedPort> {
        RadioStick::new(LinkTransport::with_port(port.clone(), "mock"), DEFAULT_RSSI_OFFSET_DB)
    }

    fn engine(nak_retries: u32) -> CommandEngine {
        CommandEngine::new(SERIAL).with_retries(&RetryConfig {
            init_attempts: 3,
            nak_retries,
        })
    }

    fn sent_opcodes(port: &ScriptedPort) -> Vec<u8> {
        port.get_written_data().iter().map(|c| sent_packet(c).0).collect()
    }

    /// A page of `fragments` 64-byte windows ending in a revised CRC-16
    fn history_page(fragments: usize) -> Vec<u8> {
        let len = fragments * FRAGMENT_PAYLOAD_SIZE;
        let mut page: Vec<u8> = (0..len - 2).map(|i| (i * 7 % 251) as u8).collect();
        let crc = crc16(&page, Crc16Variant::Revised);
        page.extend_from_slice(&crc.to_be_bytes());
        page
    }

    /// Pump answering a history read with the given fragment indices in turn
    fn serve_fragments(port: &ScriptedPort, page: Vec<u8>, indices: Vec<u8>) {
        let mut next = 0;
        port.respond_with(move |command| {
            let (opcode, _) = sent_packet(command);
            if opcode != 0x80 && opcode != OPCODE_ACK {
                return Some(status_reply(RadioStatus::NoData));
            }
            let index = *indices.get(next)?;
            let window = &page[next * FRAGMENT_PAYLOAD_SIZE..(next + 1) * FRAGMENT_PAYLOAD_SIZE];
            next += 1;
            Some(pump_reply(0x80, index, window))
        });
    }

    #[tokio::test]
    async fn test_simple_get() {
        init_tracing();
        let port = ScriptedPort::new();
        port.reply(&pump_reply(0x8D, 3, b"522"));
        let mut stick = stick(&port);

        let response = engine(2).exchange(&mut stick, &READ_MODEL, &[]).await.unwrap();
        assert_eq!(response.payload, b"522".to_vec());
        assert_eq!(response.rssi_dbm, -57);
        assert_eq!(response.fragments, 1);
        assert_eq!(sent_packet(&port.get_written_data()[0]), (0x8D, vec![]));
    }

    #[tokio::test]
    async fn test_simple_get_unexpected_opcode() {
        let port = ScriptedPort::new();
        port.reply(&pump_reply(0x70, 1, &[0x00]));
        let mut stick = stick(&port);

        let err = engine(2).exchange(&mut stick, &READ_MODEL, &[]).await.unwrap_err();
        assert!(matches!(
            err,
            PumpLinkError::Protocol(ProtocolError::UnexpectedOpcode {
                expected: 0x8D,
                found: 0x70
            })
        ));
    }

    #[tokio::test]
    async fn test_simple_get_does_not_retry() {
        let port = ScriptedPort::new();
        port.reply(&status_reply(RadioStatus::Timeout));
        let mut stick = stick(&port);

        let err = engine(5).exchange(&mut stick, &READ_MODEL, &[]).await.unwrap_err();
        assert!(matches!(err, PumpLinkError::RadioStatus(RadioStatus::Timeout)));
        assert_eq!(port.get_written_data().len(), 1);
    }

    #[tokio::test]
    async fn test_simple_set_acknowledged() {
        let port = ScriptedPort::new();
        port.reply(&ack_reply());
        let mut stick = stick(&port);

        assert_ok!(engine(2).exchange(&mut stick, &SUSPEND, &[0x01]).await);
        assert_eq!(sent_packet(&port.get_written_data()[0]), (0x4D, vec![0x01]));
    }

    #[tokio::test]
    async fn test_simple_set_not_acknowledged() {
        let port = ScriptedPort::new();
        port.reply(&pump_reply(OPCODE_NAK, 1, &[0x0C]));
        let mut stick = stick(&port);

        let err = engine(2).exchange(&mut stick, &SUSPEND, &[0x01]).await.unwrap_err();
        match err {
            PumpLinkError::Protocol(ProtocolError::UnsuccessfulCommand { command, source }) => {
                assert_eq!(command, "suspend");
                assert!(matches!(
                    *source,
                    PumpLinkError::Protocol(ProtocolError::NotAcknowledged { .. })
                ));
            }
            other => panic!("Expected UnsuccessfulCommand, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_returns_rssi() {
        let port = ScriptedPort::new();
        port.reply(&pump_reply(0x8D, 3, b"522"));
        let mut stick = stick(&port);

        assert_eq!(engine(0).probe(&mut stick, &READ_MODEL).await.unwrap(), -57);
    }

    #[tokio::test]
    async fn test_big_transfer_accumulates_fragments() {
        init_tracing();
        let port = ScriptedPort::new();
        let page = history_page(4);
        serve_fragments(&port, page.clone(), vec![1, 2, 3, 0x84]);
        let mut stick = stick(&port);

        let response = engine(2).exchange(&mut stick, &HISTORY, &[0x00]).await.unwrap();

        assert_eq!(response.fragments, 4);
        assert_eq!(response.payload.len(), 4 * FRAGMENT_PAYLOAD_SIZE);
        assert_eq!(response.payload, page);
        assert_ok!(check_page(&response.payload, Crc16Variant::Revised));
        assert_eq!(sent_opcodes(&port), vec![0x80, OPCODE_ACK, OPCODE_ACK, OPCODE_ACK]);
    }

    #[tokio::test]
    async fn test_big_transfer_stops_at_fragment_limit() {
        let port = ScriptedPort::new();
        serve_fragments(&port, history_page(3), vec![1, 2, 3]);
        let mut stick = stick(&port);
        let spec = CommandSpec::big_get("short_read", 0x80, 1);

        let response = engine(0).exchange(&mut stick, &spec, &[]).await.unwrap();
        assert_eq!(response.fragments, 2);
        assert_eq!(response.payload.len(), 2 * FRAGMENT_PAYLOAD_SIZE);
        assert_eq!(port.get_written_data().len(), 2);
    }

    #[tokio::test]
    async fn test_big_transfer_out_of_order_fragment() {
        let port = ScriptedPort::new();
        serve_fragments(&port, history_page(4), vec![1, 3, 4, 0x84]);
        let mut stick = stick(&port);

        let err = engine(2).exchange(&mut stick, &HISTORY, &[]).await.unwrap_err();
        assert!(matches!(
            err,
            PumpLinkError::Protocol(ProtocolError::FragmentOutOfOrder { expected: 2, found: 3 })
        ));
    }

    #[tokio::test]
    async fn test_big_transfer_duplicate_fragment() {
        let port = ScriptedPort::new();
        serve_fragments(&port, history_page(4), vec![1, 1, 2, 0x83]);
        let mut stick = stick(&port);

        let err = engine(2).exchange(&mut stick, &HISTORY, &[]).await.unwrap_err();
        assert!(matches!(
            err,
            PumpLinkError::Protocol(ProtocolError::DuplicateFragment(1))
        ));
    }

    #[tokio::test]
    async fn test_nak_retries_exhausted() {
        for k in [0u32, 1, 3] {
            let port = ScriptedPort::new();
            port.respond_with(|_| Some(status_reply(RadioStatus::Timeout)));
            let mut stick = stick(&port);

            let err = engine(k).exchange(&mut stick, &HISTORY, &[]).await.unwrap_err();

            let naks = sent_opcodes(&port).iter().filter(|&&op| op == OPCODE_NAK).count();
            assert_eq!(naks, k as usize);
            match err {
                PumpLinkError::Protocol(ProtocolError::UnsuccessfulCommand { command, source }) => {
                    assert_eq!(command, "read_history_page");
                    assert!(matches!(*source, PumpLinkError::RadioStatus(RadioStatus::Timeout)));
                }
                other => panic!("Expected UnsuccessfulCommand, got: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_nak_recovers_lost_fragment() {
        let port = ScriptedPort::new();
        let page = history_page(2);
        let mut sent = 0;
        let fragments = page.clone();
        port.respond_with(move |command| {
            sent += 1;
            let (opcode, _) = sent_packet(command);
            match (sent, opcode) {
                (1, 0x80) => Some(pump_reply(0x80, 1, &fragments[..64])),
                (2, OPCODE_ACK) => Some(vec![0xCC, 0x00]),
                (3, OPCODE_NAK) => Some(pump_reply(0x80, 0x82, &fragments[64..])),
                _ => None,
            }
        });
        let mut stick = stick(&port);

        let response = engine(2).exchange(&mut stick, &HISTORY, &[]).await.unwrap();
        assert_eq!(response.payload, page);
        assert_eq!(sent_opcodes(&port), vec![0x80, OPCODE_ACK, OPCODE_NAK]);
    }

    /// Pump serving `page` whose answer to every first ACK is lost; the NAK
    /// that follows gets the fragment
    fn serve_fragments_dropping_acks(port: &ScriptedPort, page: Vec<u8>) {
        let fragments = page.len() / FRAGMENT_PAYLOAD_SIZE;
        let mut next = 0;
        let mut dropped = false;
        port.respond_with(move |command| {
            let (opcode, _) = sent_packet(command);
            if opcode == OPCODE_ACK && !dropped {
                dropped = true;
                return Some(status_reply(RadioStatus::NoData));
            }
            dropped = false;
            if next >= fragments {
                return None;
            }
            let window = &page[next * FRAGMENT_PAYLOAD_SIZE..(next + 1) * FRAGMENT_PAYLOAD_SIZE];
            next += 1;
            let index = if next == fragments { 0x80 | next as u8 } else { next as u8 };
            Some(pump_reply(0x80, index, window))
        });
    }

    #[tokio::test]
    async fn test_nak_budget_is_shared_across_fragments() {
        let port = ScriptedPort::new();
        serve_fragments_dropping_acks(&port, history_page(4));
        let mut stick = stick(&port);

        let err = engine(1).exchange(&mut stick, &HISTORY, &[]).await.unwrap_err();

        assert_eq!(sent_opcodes(&port), vec![0x80, OPCODE_ACK, OPCODE_NAK, OPCODE_ACK]);
        match err {
            PumpLinkError::Protocol(ProtocolError::UnsuccessfulCommand { source, .. }) => {
                assert!(matches!(*source, PumpLinkError::RadioStatus(RadioStatus::NoData)));
            }
            other => panic!("Expected UnsuccessfulCommand, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nak_budget_covers_losses_on_several_fragments() {
        let port = ScriptedPort::new();
        let page = history_page(4);
        serve_fragments_dropping_acks(&port, page.clone());
        let mut stick = stick(&port);

        let response = engine(3).exchange(&mut stick, &HISTORY, &[]).await.unwrap();

        assert_eq!(response.payload, page);
        let naks = sent_opcodes(&port).iter().filter(|&&op| op == OPCODE_NAK).count();
        assert_eq!(naks, 3);
    }

    #[tokio::test]
    async fn test_corrupted_reply_triggers_nak() {
        let port = ScriptedPort::new();
        let mut corrupted = ack_reply();
        corrupted[4] ^= 0x10;
        let mut sent = 0;
        port.respond_with(move |command| {
            sent += 1;
            match (sent, sent_packet(command).0) {
                (1, 0x5D) => Some(ack_reply()),
                (2, 0x5D) => Some(corrupted.clone()),
                (3, OPCODE_NAK) => Some(ack_reply()),
                _ => None,
            }
        });
        let mut stick = stick(&port);

        assert_ok!(engine(1).exchange(&mut stick, &POWER_ON, &[0x01, 0x0A]).await);
    }

    #[tokio::test]
    async fn test_prelude_then_set() {
        let port = ScriptedPort::new();
        port.reply(&status_reply(RadioStatus::Timeout));
        port.reply(&ack_reply());
        port.reply(&ack_reply());
        let mut stick = stick(&port);

        assert_ok!(engine(2).exchange(&mut stick, &POWER_ON, &[0x01, 0x0A]).await);

        let written = port.get_written_data();
        assert_eq!(written.len(), 3);
        assert_eq!(written[0][2], 50, "prelude is sent as a burst");
        assert_eq!(sent_packet(&written[1]), (0x5D, vec![]));
        assert_eq!(sent_packet(&written[2]), (0x5D, vec![0x01, 0x0A]));
        assert_eq!(written[2][2], 0, "main exchange is a single transmission");
    }

    #[tokio::test]
    async fn test_prelude_budget_exhausted() {
        let port = ScriptedPort::new();
        port.respond_with(|_| Some(status_reply(RadioStatus::NoData)));
        let mut stick = stick(&port);

        let err = engine(2).exchange(&mut stick, &POWER_ON, &[0x01, 0x0A]).await.unwrap_err();
        assert!(matches!(
            err,
            PumpLinkError::Protocol(ProtocolError::BudgetExhausted {
                budget: "init_attempts",
                ..
            })
        ));
        assert_eq!(port.get_written_data().len(), 3);
    }

    #[tokio::test]
    async fn test_execute_decodes_through_command() {
        use crate::command::Query;

        fn model(response: &Response) -> Result<String> {
            Ok(String::from_utf8_lossy(&response.payload).into_owned())
        }

        let port = ScriptedPort::new();
        port.reply(&pump_reply(0x8D, 3, b"554"));
        let mut stick = stick(&port);

        let query = Query::new(READ_MODEL, model);
        assert_eq!(engine(0).execute(&mut stick, &query).await.unwrap(), "554");
    }

    #[tokio::test]
    async fn test_engine_probe_as_scan_probe() {
        let port = ScriptedPort::new();
        port.reply(&pump_reply(0x8D, 3, b"522"));
        port.silence();
        let mut stick = stick(&port);
        let engine = engine(0);
        let probe = EngineProbe {
            engine: &engine,
            spec: READ_MODEL,
        };

        assert_eq!(probe.probe(&mut stick).await.unwrap(), -57);
        assert_err!(probe.probe(&mut stick).await);
    }

    #[test]
    fn test_effective_budget_override() {
        let engine = engine(4);
        let budget = engine.effective_budget(RetryBudget::new(1, 15, 0));
        assert_eq!(budget, RetryBudget::new(3, 15, 4));
        assert_eq!(
            CommandEngine::new(SERIAL).effective_budget(RetryBudget::new(1, 15, 0)),
            RetryBudget::new(1, 15, 0)
        );
    }
}
