use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
    Http,
    Stdio,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::WebSocket => "websocket",
            Transport::Http => "http",
            Transport::Stdio => "stdio",
        })
    }
}

/// Protocol state for one connection. Never shared between connections.
#[derive(Debug)]
pub struct Session {
    id: u64,
    transport: Transport,
    initialized: bool,
    client_info: Option<Value>,
    client_capabilities: Option<Value>,
    negotiated_capabilities: Vec<String>,
}

impl Session {
    pub fn new(transport: Transport) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            initialized: false,
            client_info: None,
            client_capabilities: None,
            negotiated_capabilities: Vec::new(),
        }
    }

    /// A throwaway HTTP session, treated as already initialized.
    pub fn stateless() -> Self {
        Self {
            initialized: true,
            ..Self::new(Transport::Http)
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn client_info(&self) -> Option<&Value> {
        self.client_info.as_ref()
    }

    pub fn client_capabilities(&self) -> Option<&Value> {
        self.client_capabilities.as_ref()
    }

    pub fn negotiated_capabilities(&self) -> &[String] {
        &self.negotiated_capabilities
    }

    /// Record a completed `initialize` handshake in one step.
    pub fn initialize(
        &mut self,
        client_info: Option<Value>,
        client_capabilities: Option<Value>,
        negotiated_capabilities: Vec<String>,
    ) {
        self.client_info = client_info;
        self.client_capabilities = client_capabilities;
        self.negotiated_capabilities = negotiated_capabilities;
        self.initialized = true;
    }
}
