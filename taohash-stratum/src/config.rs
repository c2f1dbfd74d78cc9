use serde::{Deserialize, Serialize};

/// Descriptor of one upstream Stratum pool.
///
/// Immutable while a session is bound to it; a configuration reload installs
/// a replacement descriptor for new sessions rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    /// Pool hostname or IP address
    pub host: String,

    /// Pool port
    pub port: u16,

    /// Pool account name, used to authorize upstream and to rewrite the
    /// worker field of forwarded share submissions
    pub user: String,

    /// Pool account password
    pub pass: String,
}

impl PoolDescriptor {
    /// `host:port` form used for connecting and logging.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
