use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

/// the biggest payload that fits into a single IPV4 UDP datagram
pub const MAX_UDP_PAYLOAD: usize = 65_507;

pub struct RelayConfig {
    pub self_addr: SocketAddr,

    /// Datagrams bigger than this are dropped without being handled. Since a file chunk's payload
    ///  is base64 encoded inside a JSON object, senders must choose their chunk size well below
    ///  this limit.
    pub max_datagram_size: usize,

    /// A MISSING control frame for a transfer with many gaps can get too big for a single
    ///  datagram. The end point splits the list of missing sequence numbers into several
    ///  MISSING frames of at most this many entries each.
    pub max_missing_per_control: usize,

    /// Transfers that receive no chunks or resume requests for this long are regarded as abandoned
    ///  and evicted. `None` keeps transfers forever.
    pub idle_transfer_ttl: Option<Duration>,
    pub eviction_interval: Duration,

    /// the maximum number of control frames waiting to be sent - further replies are dropped
    pub reply_queue_capacity: usize,
}

impl RelayConfig {
    pub fn new(self_addr: SocketAddr) -> RelayConfig {
        RelayConfig {
            self_addr,
            max_datagram_size: MAX_UDP_PAYLOAD,
            max_missing_per_control: 1024,
            idle_transfer_ttl: Some(Duration::from_secs(600)),
            eviction_interval: Duration::from_secs(30),
            reply_queue_capacity: 4096,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 512 {
            bail!("max datagram size {} is too small", self.max_datagram_size);
        }
        if self.max_datagram_size > MAX_UDP_PAYLOAD {
            bail!("max datagram size {} exceeds the UDP maximum of {}", self.max_datagram_size, MAX_UDP_PAYLOAD);
        }
        if self.max_missing_per_control == 0 {
            bail!("max number of missing sequence numbers per control frame must be greater than 0");
        }
        if self.reply_queue_capacity == 0 {
            bail!("reply queue capacity must be greater than 0");
        }
        if self.idle_transfer_ttl.is_some() && self.eviction_interval.is_zero() {
            bail!("eviction interval must be greater than 0");
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn config() -> RelayConfig {
        RelayConfig::new(SocketAddr::from(([127, 0, 0, 1], 9999)))
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[rstest]
    #[case::datagram_too_small(|c: &mut RelayConfig| c.max_datagram_size = 511, false)]
    #[case::datagram_min(|c: &mut RelayConfig| c.max_datagram_size = 512, true)]
    #[case::datagram_too_big(|c: &mut RelayConfig| c.max_datagram_size = MAX_UDP_PAYLOAD + 1, false)]
    #[case::no_missing(|c: &mut RelayConfig| c.max_missing_per_control = 0, false)]
    #[case::no_reply_queue(|c: &mut RelayConfig| c.reply_queue_capacity = 0, false)]
    #[case::zero_interval(|c: &mut RelayConfig| c.eviction_interval = Duration::ZERO, false)]
    #[case::zero_interval_without_eviction(|c: &mut RelayConfig| { c.idle_transfer_ttl = None; c.eviction_interval = Duration::ZERO; }, true)]
    fn test_validate(#[case] modify: fn(&mut RelayConfig), #[case] valid: bool) {
        let mut config = config();
        modify(&mut config);
        assert_eq!(config.validate().is_ok(), valid);
    }
}
