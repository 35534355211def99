//! Named service registry entries and the connect callback they expose.

use crate::multiplexer::ConnectContext;

/// Callback invoked when a guest client connects to a registered service.
///
/// Implementations typically construct and own per-client state, then hand
/// back a [`crate::ClientHandler`] via [`ConnectContext::accept`] to receive
/// that client's subsequent traffic.
pub trait ServiceHandler {
    /// Called once per incoming connection, after the service's concurrent
    /// client cap has already been checked.
    ///
    /// `ctx` exposes the newly allocated channel id and the means to accept
    /// or reject the connection; see [`ConnectContext`].
    fn on_connect(&mut self, ctx: &mut ConnectContext<'_>);
}

/// A named entry in the [`crate::Multiplexer`]'s service registry.
///
/// Construct via [`crate::Multiplexer::register_service`]; a `Service`
/// cannot be built standalone since it must be assigned a slot in the
/// multiplexer's client arena's membership tracking.
pub struct Service {
    pub(crate) name: String,
    pub(crate) max_clients: Option<usize>,
    pub(crate) handler: Box<dyn ServiceHandler>,
    pub(crate) clients: Vec<u8>,
}

impl Service {
    pub(crate) fn new(
        name: impl Into<String>,
        max_clients: Option<usize>,
        handler: Box<dyn ServiceHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            max_clients,
            handler,
            clients: Vec::new(),
        }
    }

    /// The name clients connect to this service by.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of clients currently connected to this service.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.max_clients.is_some_and(|cap| self.clients.len() >= cap)
    }

    pub(crate) fn add_client(&mut self, channel: u8) {
        self.clients.push(channel);
    }

    pub(crate) fn remove_client(&mut self, channel: u8) {
        self.clients.retain(|&c| c != channel);
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("max_clients", &self.max_clients)
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}
