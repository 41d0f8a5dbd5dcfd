//! Clients API: browsing contexts the worker may control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::container::ServiceWorkerId;
use crate::error::ServiceWorkerError;

/// Client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// A client (open page or worker).
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// A window client at `url`, not yet controlled.
    pub fn window(url: Url) -> Self {
        Self {
            id: ClientId::new(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Registry of open clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        id
    }

    /// Remove a client.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Clients in `scope` matching `options`, ordered by id.
    pub fn match_all(&self, scope: &Url, options: &ClientMatchOptions) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| options.include_uncontrolled || c.controller.is_some())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by_key(|c| c.id.0);
        matched
    }

    /// Make `worker` the controller of every client in `scope`. Returns the
    /// clients whose controller changed.
    pub fn claim(&mut self, scope: &Url, worker: ServiceWorkerId) -> Vec<ClientId> {
        let mut claimed: Vec<ClientId> = self
            .clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id
            })
            .collect();
        claimed.sort_by_key(|id| id.0);
        claimed
    }

    /// Open a new focused window controlled by `controller`.
    pub fn open_window(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> ClientId {
        for client in self.clients.values_mut() {
            client.focused = false;
        }
        let client = Client {
            focused: true,
            controller,
            ..Client::window(url)
        };
        self.add(client)
    }

    /// Focus a window client.
    pub fn focus(&mut self, id: ClientId) -> Result<(), ServiceWorkerError> {
        match self.clients.get(&id) {
            None => return Err(ServiceWorkerError::NotFound(id.to_string())),
            Some(c) if c.client_type != ClientType::Window => {
                return Err(ServiceWorkerError::StateError(
                    "Can only focus window clients".to_string(),
                ));
            }
            Some(_) => {}
        }

        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        Ok(())
    }
}
