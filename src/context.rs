use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::circuit::reliable::{DeliveryOutcome, RetryTimeout};
use crate::circuit::{Circuit, CircuitInfo, TimeoutCallback};
use crate::config::CircuitConfig;
use crate::control_messages::ControlMessage;
use crate::host::Host;
use crate::packet_header::PacketHeader;
use crate::packet_id::PacketId;
use crate::raw_transport::RawTransport;
use crate::registry::CircuitRegistry;

/// What the receive path needs to know about an incoming packet, typically taken from its
///  [PacketHeader]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IncomingPacket {
    pub packet_id: PacketId,
    pub reliable: bool,
    pub resent: bool,
    /// total length of the packet in bytes, for statistics
    pub len: usize,
}

impl IncomingPacket {
    pub fn from_header(header: &PacketHeader, len: usize) -> IncomingPacket {
        IncomingPacket {
            packet_id: header.packet_id,
            reliable: header.is_reliable(),
            resent: header.is_resent(),
            len,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// The packet should be processed. `gap` is the number of packets missing between the
    ///  previously expected packet and this one.
    Accepted { gap: u32 },
    /// A control message for the circuit layer, which was handled already. Only returned by
    ///  [TransportContext::on_datagram].
    Control,
    /// A resend of a packet that was processed before. It must be dropped.
    Duplicate,
    /// There is no usable circuit for the sender, and none may be created. The packet must be
    ///  dropped.
    OffCircuit,
}

/// The circuit layer as seen by the rest of an application: it owns all circuits and the raw
///  transport they send on, and all protocol events go through it.
///
/// All operations take the current time as a parameter and never block. Periodic maintenance
///  happens in [TransportContext::process], which is driven by
///  [crate::driver::run_maintenance_loop] or by application code.
pub struct TransportContext {
    config: Arc<CircuitConfig>,
    registry: CircuitRegistry,
    transport: Arc<dyn RawTransport>,
}

impl TransportContext {
    pub fn new(config: CircuitConfig, transport: Arc<dyn RawTransport>) -> anyhow::Result<TransportContext> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(TransportContext {
            registry: CircuitRegistry::new(config.clone()),
            config,
            transport,
        })
    }

    pub fn from_registry(registry: CircuitRegistry, transport: Arc<dyn RawTransport>) -> anyhow::Result<TransportContext> {
        registry.config().validate()?;
        Ok(TransportContext {
            config: registry.config().clone(),
            registry,
            transport,
        })
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn registry(&self) -> &CircuitRegistry {
        &self.registry
    }

    pub fn circuit(&self, host: &Host) -> Option<&Circuit> {
        self.registry.get(host)
    }

    fn circuit_mut(&mut self, host: &Host) -> anyhow::Result<&mut Circuit> {
        self.registry.find_circuit(host)
            .ok_or_else(|| anyhow!("no circuit for {:?}", host))
    }

    /// Handles a datagram as it was received from the network: registers it with the sender's
    ///  circuit, applies the acks appended to it, and handles it if it is a control message.
    ///  Returns the outcome and, for accepted application packets, the application payload.
    ///
    /// Datagrams with a malformed header or malformed appended acks are rejected without touching
    ///  any circuit.
    pub fn on_datagram<'a>(&mut self, host: &Host, datagram: &'a [u8], now: Instant) -> anyhow::Result<(ReceiveOutcome, &'a [u8])> {
        let mut body = datagram;
        let header = PacketHeader::deser(&mut body)?;
        let (payload, acks) = header.split_appended_acks(body)?;

        let outcome = self.on_packet_received(host, IncomingPacket::from_header(&header, datagram.len()), now);
        if outcome == ReceiveOutcome::OffCircuit {
            return Ok((outcome, &[][..]));
        }

        if !acks.is_empty() {
            let num_acked = self.on_acks_received(host, &acks);
            trace!("{} of {} appended acks from {:?} matched unacked packets", num_acked, acks.len(), host);
        }

        match outcome {
            ReceiveOutcome::Accepted { .. } if header.is_control() => {
                self.on_control_message(host, payload, now)?;
                Ok((ReceiveOutcome::Control, &[][..]))
            }
            ReceiveOutcome::Accepted { .. } => Ok((outcome, payload)),
            _ => Ok((outcome, &[][..])),
        }
    }

    /// Registers a received packet with the sender's circuit, creating the circuit if necessary,
    ///  and queues an ack if the packet is reliable.
    pub fn on_packet_received(&mut self, host: &Host, packet: IncomingPacket, now: Instant) -> ReceiveOutcome {
        trace!("received packet #{} from {:?}: {:?}", packet.packet_id, host, packet);

        if !self.registry.contains(host) {
            if self.config.protected {
                debug!("dropping packet #{} from {:?}: no circuit", packet.packet_id, host);
                return ReceiveOutcome::OffCircuit;
            }
            self.registry.add_circuit(*host, packet.packet_id, now);
        }
        let Some(circuit) = self.registry.find_circuit(host) else {
            return ReceiveOutcome::OffCircuit;
        };

        if !circuit.is_alive() {
            if self.config.protected {
                debug!("dropping packet #{} from {:?}: circuit is dead", packet.packet_id, host);
                return ReceiveOutcome::OffCircuit;
            }
            debug!("reviving dead circuit {:?} for incoming packet #{}", host, packet.packet_id);
            circuit.set_alive(true, now);
        }

        if packet.resent && circuit.is_duplicate_resend(packet.packet_id) {
            debug!("dropping duplicate resend #{} from {:?}", packet.packet_id, host);
            if packet.reliable {
                // the previous ack may have been lost
                self.registry.collect_ack(host, packet.packet_id, now);
            }
            return ReceiveOutcome::Duplicate;
        }

        let gap = circuit.record_incoming(packet.packet_id, packet.resent, packet.len, now);
        if packet.reliable {
            circuit.remember_reliable(packet.packet_id, now);
            self.registry.collect_ack(host, packet.packet_id, now);
        }
        ReceiveOutcome::Accepted { gap }
    }

    /// Makes sure there is a live circuit to send on, creating one if permitted
    fn ensure_sendable(&mut self, host: &Host, now: Instant) -> anyhow::Result<()> {
        match self.registry.find_circuit(host) {
            Some(circuit) if circuit.is_alive() => Ok(()),
            Some(_) => {
                warn!("trying to send to dead circuit {:?}", host);
                bail!("circuit for {:?} is dead", host);
            }
            None if self.config.protected => {
                warn!("trying to send to {:?} without a circuit", host);
                bail!("no circuit for {:?}", host);
            }
            None => {
                self.registry.add_circuit(*host, PacketId::ZERO, now);
                Ok(())
            }
        }
    }

    /// Sends a packet that is resent until it is acked or its retries are used up. The returned
    ///  receiver gets exactly one [DeliveryOutcome].
    pub fn send_reliable(
        &mut self,
        host: &Host,
        payload: &[u8],
        retries: u8,
        timeout: RetryTimeout,
        report_timeout_on_ack: bool,
        now: Instant,
    ) -> anyhow::Result<oneshot::Receiver<DeliveryOutcome>> {
        self.ensure_sendable(host, now)?;
        self.registry.send_reliable(host, payload, retries, timeout, report_timeout_on_ack, now, self.transport.as_ref())
            .ok_or_else(|| anyhow!("no circuit for {:?}", host))
    }

    /// [TransportContext::send_reliable] with the configured default number of retries and ping
    ///  based timeouts
    pub fn send_reliable_with_defaults(&mut self, host: &Host, payload: &[u8], now: Instant) -> anyhow::Result<oneshot::Receiver<DeliveryOutcome>> {
        self.send_reliable(host, payload, self.config.default_reliable_retries, RetryTimeout::PingBased, false, now)
    }

    /// Sends a packet once, but keeps it around for a round trip based timeout so the caller
    ///  learns whether it was acked
    pub fn send_semi_reliable(&mut self, host: &Host, payload: &[u8], now: Instant) -> anyhow::Result<oneshot::Receiver<DeliveryOutcome>> {
        let timeout = match self.registry.get(host) {
            Some(circuit) => circuit.reliable_timeout(now),
            None => self.config.averaged_ping_max.mul_f64(self.config.reliable_timeout_factor),
        };
        self.send_reliable(host, payload, 0, RetryTimeout::Fixed(timeout), false, now)
    }

    pub fn send_unreliable(&mut self, host: &Host, payload: &[u8], now: Instant) -> anyhow::Result<PacketId> {
        self.ensure_sendable(host, now)?;
        let transport = self.transport.clone();
        Ok(self.circuit_mut(host)?
            .send_unreliable(payload, transport.as_ref()))
    }

    /// Returns the number of ids that acknowledged a packet that was actually waiting for an ack
    pub fn on_acks_received(&mut self, host: &Host, ids: &[PacketId]) -> usize {
        self.registry.ack_reliable_packets(host, ids)
    }

    /// Handles the payload of a packet carrying a [ControlMessage]
    pub fn on_control_message(&mut self, host: &Host, mut buf: &[u8], now: Instant) -> anyhow::Result<()> {
        let message = ControlMessage::deser(&mut buf)?;
        trace!("received {:?} from {:?}", message, host);

        match message {
            ControlMessage::PacketAck { ids } => {
                self.on_acks_received(host, &ids);
            }
            ControlMessage::StartPingCheck { ping_id, oldest_unacked } => {
                let transport = self.transport.clone();
                match self.registry.find_circuit(host) {
                    Some(circuit) => circuit.on_start_ping_check(ping_id, oldest_unacked, now, transport.as_ref()),
                    None => debug!("ping from {:?} without a circuit", host),
                }
            }
            ControlMessage::CompletePingCheck { ping_id } => {
                match self.registry.find_circuit(host) {
                    Some(circuit) => circuit.ping_response_received(ping_id, now),
                    None => debug!("ping response from {:?} without a circuit", host),
                }
            }
        }
        Ok(())
    }

    /// Sets a callback that is called when the circuit for `host` stops answering pings
    pub fn register_timeout_callback(&mut self, host: &Host, callback: TimeoutCallback) -> anyhow::Result<()> {
        if !self.registry.set_timeout_callback(host, callback) {
            bail!("no circuit for {:?}", host);
        }
        Ok(())
    }

    pub fn set_alive(&mut self, host: &Host, alive: bool, now: Instant) -> anyhow::Result<()> {
        self.circuit_mut(host)?
            .set_alive(alive, now);
        Ok(())
    }

    pub fn set_allow_timeout(&mut self, host: &Host, allow: bool, now: Instant) -> anyhow::Result<()> {
        self.circuit_mut(host)?
            .set_allow_timeout(allow, now);
        Ok(())
    }

    /// `false` if there is no circuit for the host
    pub fn is_alive(&self, host: &Host) -> bool {
        self.registry.is_circuit_alive(host)
    }

    /// `true` if too many pings to the host are unanswered, a hint to send less
    pub fn is_blocked(&self, host: &Host) -> bool {
        self.registry.get(host)
            .map(|c| c.is_blocked())
            .unwrap_or(false)
    }

    pub fn remove_circuit(&mut self, host: &Host) -> bool {
        self.registry.remove_circuit(host)
    }

    /// Periodic maintenance: pings and timeouts, resends, and queued acks that are older than
    ///  `ack_collect_time`. Returns the hosts whose circuits timed out and were removed.
    pub fn process(&mut self, now: Instant, ack_collect_time: Duration) -> Vec<Host> {
        let transport = self.transport.as_ref();

        let removed = self.registry.update_watchdog(now, transport);
        let (unacked_count, unacked_bytes) = self.registry.resend_unacked(now, transport);
        if unacked_count > 0 {
            trace!("{} reliable packets ({} bytes) waiting for acks", unacked_count, unacked_bytes);
        }
        self.registry.send_acks(ack_collect_time, now, transport);

        removed
    }

    pub fn dump_resends(&mut self) {
        self.registry.dump_resends();
    }

    pub fn info(&self, now: Instant) -> Vec<CircuitInfo> {
        self.registry.info(now)
    }
}
