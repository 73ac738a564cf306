pub mod connection;
pub mod hub;
pub mod ratelimit;
pub mod screen_share;
pub mod signaling;
pub mod socket;
pub mod voice;

use std::sync::Arc;
use std::time::Duration;

use lanyard_core::store::{MessageStore, UserStore};
use lanyard_models::voice::IceServer;

use crate::hub::Hub;
use crate::ratelimit::RateWindow;

/// Tunables for the gateway. Every limit here is enforced per connection
/// or inside the hub loop; see the `[gateway]` section of the server config.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub jwt_secret: String,
    /// Bounded outbound queue per connection.
    pub outbound_capacity: usize,
    pub max_message_len: usize,
    /// Flat minimum interval between MESSAGE_SEND dispatches.
    pub message_min_interval: Duration,
    /// Sliding window for VOICE_JOIN attempts.
    pub voice_join_window: RateWindow,
    /// Sliding window for clearing mute/deafen. Setting them is never limited.
    pub voice_relief_window: RateWindow,
    /// How long an identify blocks on hub registration before AUTH_FAILED.
    pub register_timeout: Duration,
    pub watchdog_interval: Duration,
    /// A voice session stuck in Joining longer than this is force-cleaned.
    pub joining_timeout: Duration,
    /// Consecutive outbound drops before the connection is force-closed.
    pub drop_disconnect_threshold: u32,
    pub drop_log_every: u32,
    pub keepalive_interval: Duration,
    pub ice_servers: Vec<IceServer>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            outbound_capacity: 256,
            max_message_len: 4096,
            message_min_interval: Duration::from_millis(500),
            voice_join_window: RateWindow {
                max_events: 5,
                window: Duration::from_secs(30),
                cooldown: Duration::from_secs(30),
            },
            voice_relief_window: RateWindow {
                max_events: 5,
                window: Duration::from_secs(30),
                cooldown: Duration::from_secs(30),
            },
            register_timeout: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(10),
            joining_timeout: Duration::from_secs(30),
            drop_disconnect_threshold: 100,
            drop_log_every: 10,
            keepalive_interval: Duration::from_secs(20),
            ice_servers: Vec::new(),
        }
    }
}

/// Everything a connection actor needs, cloned per accepted socket.
#[derive(Clone)]
pub struct GatewayContext {
    pub hub: Hub,
    pub users: Arc<dyn UserStore>,
    pub messages: Arc<dyn MessageStore>,
    pub config: Arc<GatewayConfig>,
}
