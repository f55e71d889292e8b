//! Reliable messaging over an unreliable datagram transport, organized in *circuits*: one per
//!  remote host.
//!
//! A circuit numbers outgoing packets in a wrapping sequence, tracks gaps and duplicates in the
//!  incoming sequence, resends reliable packets until they are acked or their retries are used up,
//!  batches acks, and measures round trip times with pings that also detect dead peers.
//!
//! [context::TransportContext] is the entry point: applications feed received datagrams into
//!  [context::TransportContext::on_datagram], send through it, and call
//!  [context::TransportContext::process] periodically (or let [driver::run_maintenance_loop] do
//!  that). Control messages and acks travel in the same datagrams as application data and are
//!  handled by the context.

pub mod circuit;
pub mod config;
pub mod context;
pub mod control_messages;
pub mod driver;
pub mod host;
pub mod packet_header;
pub mod packet_id;
pub mod raw_transport;
pub mod registry;
pub mod test_util;
pub mod throttle;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
