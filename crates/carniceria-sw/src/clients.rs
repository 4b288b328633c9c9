//! Client views (open storefront windows) the worker can control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::{ServiceWorkerError, ServiceWorkerId};

/// A client (open view).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Worker currently routing this client's requests.
    pub controller: Option<ServiceWorkerId>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

impl Client {
    /// Create a window client for the given URL.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
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

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) -> String {
        let id = client.id.clone();
        self.clients.insert(id.clone(), client);
        id
    }

    /// Number of known clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Match clients, optionally limited to those controlled by `worker`.
    ///
    /// Results are ordered by client ID so callers see a stable order.
    pub fn match_all(
        &self,
        options: &ClientMatchOptions,
        worker: Option<ServiceWorkerId>,
    ) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || (worker.is_some() && c.controller == worker))
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Open a window and focus it.
    pub fn open_window(
        &mut self,
        url: Url,
        controller: Option<ServiceWorkerId>,
    ) -> Client {
        let mut client = Client::window(url);
        client.controller = controller;
        self.add(client.clone());
        self.focus_only(&client.id);
        client.focused = true;
        client
    }

    /// Focus a window client, unfocusing every other one.
    pub fn focus(&mut self, id: &str) -> Result<&Client, ServiceWorkerError> {
        let client = self
            .clients
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))?;
        if client.client_type != ClientType::Window {
            return Err(ServiceWorkerError::State(
                "Can only focus window clients".to_string(),
            ));
        }
        self.focus_only(id);
        self.clients
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))
    }

    /// Make `worker` the controller of every client. Returns the IDs whose
    /// controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    fn focus_only(&mut self, id: &str) {
        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:08}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
