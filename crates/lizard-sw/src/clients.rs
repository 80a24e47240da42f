//! Controlled pages.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::ServiceWorkerError;

/// A client (page or worker) the service worker may control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Bucket name of the version controlling this client, if any.
    pub controller: Option<String>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

impl Client {
    /// A window client that no worker controls yet.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }

    pub fn is_controlled(&self) -> bool {
        self.controller.is_some()
    }
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

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// All clients, optionally including ones no worker controls.
    pub fn match_all(&self, include_uncontrolled: bool) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| include_uncontrolled || c.is_controlled())
            .collect()
    }

    /// Focus a window controlled by `controller` on `url`.
    ///
    /// An existing window client already on `url` is reused, otherwise a new
    /// one is opened.
    pub fn open_window(&mut self, url: Url, controller: &str) -> Client {
        let mut client = self
            .clients
            .values()
            .find(|c| c.client_type == ClientType::Window && c.url == url)
            .cloned()
            .unwrap_or_else(|| Client::window(url));

        for other in self.clients.values_mut() {
            other.focused = false;
        }
        client.focused = true;
        client.controller = Some(controller.to_string());
        self.add(client.clone());
        client
    }

    /// Take control of every window client. Returns how many changed controller.
    pub fn claim(&mut self, controller: &str) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.client_type == ClientType::Window
                && client.controller.as_deref() != Some(controller)
            {
                client.controller = Some(controller.to_string());
                claimed += 1;
            }
        }
        claimed
    }

    /// Focus a window client.
    pub fn focus(&mut self, id: &str) -> Result<(), ServiceWorkerError> {
        let client = self
            .clients
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))?;
        if client.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }

        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        Ok(())
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
