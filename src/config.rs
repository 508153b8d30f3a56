/**
 * config.rs
 *
 * Timing constants and endpoints for the matchmaking state machine.
 * Everything that used to be a magic number in a poll loop lives here so
 * tests can shrink the deadlines.
 */

use std::ops::RangeInclusive;
use std::time::Duration;

/// Default directory (matchmaking) server endpoint.
pub const DIRECTORY_HOST: &str = "mm.matchpoint.gg";
pub const DIRECTORY_PORT: u16 = 43113;

/// Local control port range. The port picked here is reused as the
/// peer-to-peer listening port, which is what makes hole punching work:
/// the remote NAT already has a mapping keyed to it from ticket traffic.
pub const CONTROL_PORT_RANGE: RangeInclusive<u16> = 41000..=50999;

#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// Directory server address, "host:port" form.
    pub directory_host: String,
    pub directory_port: u16,

    /// Range to draw the local control/listen port from.
    pub port_range: RangeInclusive<u16>,
    /// Bind attempts before giving up with `ClientBindFailed`.
    pub bind_attempts: u32,

    /// Poll step while waiting for the directory CONNECT event.
    pub connect_poll: Duration,
    /// Number of connect poll steps before `DirectoryUnreachable`.
    pub connect_poll_steps: u32,

    /// Transport service step used when receiving control messages.
    pub service_step: Duration,
    /// Budget for the create-ticket response.
    pub create_ticket_timeout: Duration,
    /// Budget for one get-ticket poll; a miss self-loops the state machine.
    pub get_ticket_timeout: Duration,

    /// Overall deadline for the connection coordinator.
    pub punch_deadline: Duration,
    /// Coordinator service poll step.
    pub punch_poll: Duration,
    /// Peers the p2p host is sized for.
    pub peer_capacity: usize,

    /// Bounded wait for a graceful disconnect before force reset.
    pub disconnect_wait: Duration,

    /// Reported to the directory server as appVersion.
    pub app_version: String,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            directory_host: DIRECTORY_HOST.to_string(),
            directory_port: DIRECTORY_PORT,
            port_range: CONTROL_PORT_RANGE,
            bind_attempts: 15,
            connect_poll: Duration::from_millis(500),
            connect_poll_steps: 20,
            service_step: Duration::from_millis(250),
            create_ticket_timeout: Duration::from_secs(5),
            get_ticket_timeout: Duration::from_secs(2),
            punch_deadline: Duration::from_secs(8),
            punch_poll: Duration::from_millis(500),
            peer_capacity: 10,
            disconnect_wait: Duration::from_secs(3),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl MatchmakingConfig {
    pub fn directory_addr(&self) -> String {
        format!("{}:{}", self.directory_host, self.directory_port)
    }
}
