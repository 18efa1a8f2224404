/// Server-side tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub max_pending_connections: i32,
    pub poll_timeout_ms: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8896".to_string(),
            max_pending_connections: 16,
            poll_timeout_ms: 500,
        }
    }
}
