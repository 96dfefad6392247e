// Application registry
// Name -> owning client + subscribers, and per-client registration/subscriptions

use std::collections::{HashMap, HashSet};

use crate::error::RegistryError;
use crate::net::client::ClientState;

/// Per-process connection identifier
pub type ClientId = u64;

/// A registered application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    /// Client that registered the name
    pub owner: ClientId,
    /// Clients subscribed to this application
    pub subscribers: HashSet<ClientId>,
}

/// What a single client holds in the registry, by name only
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub registration: Option<String>,
    pub subscriptions: HashSet<String>,
}

impl Membership {
    pub fn state(&self) -> ClientState {
        ClientState::derive(self.registration.is_some(), !self.subscriptions.is_empty())
    }
}

/// Shared broker state: every application and every client's membership.
///
/// Each mutating call updates both sides (application and membership) before
/// returning, so a caller holding the registry lock never observes one side
/// without the other.
#[derive(Debug, Default)]
pub struct Registry {
    applications: HashMap<String, Application>,
    members: HashMap<ClientId, Membership>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly connected client (state Pending)
    pub fn add_client(&mut self, client: ClientId) {
        self.members.entry(client).or_default();
    }

    /// Forget a client; caller is expected to have unregistered/unsubscribed it
    pub fn remove_client(&mut self, client: ClientId) -> Option<Membership> {
        self.members.remove(&client)
    }

    pub fn membership(&self, client: ClientId) -> Option<&Membership> {
        self.members.get(&client)
    }

    /// Derived state of a client; unknown clients are Pending
    pub fn state_of(&self, client: ClientId) -> ClientState {
        self.members
            .get(&client)
            .map(Membership::state)
            .unwrap_or(ClientState::Pending)
    }

    pub fn registration_of(&self, client: ClientId) -> Option<&str> {
        self.members
            .get(&client)
            .and_then(|m| m.registration.as_deref())
    }

    pub fn subscriptions_of(&self, client: ClientId) -> Vec<String> {
        self.members
            .get(&client)
            .map(|m| m.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, client: ClientId, name: &str) -> bool {
        self.members
            .get(&client)
            .is_some_and(|m| m.subscriptions.contains(name))
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.get(name)
    }

    pub fn owner_of(&self, name: &str) -> Option<ClientId> {
        self.applications.get(name).map(|app| app.owner)
    }

    /// Subscribers of the application registered by `client`
    pub fn subscribers_of_registration(&self, client: ClientId) -> Vec<ClientId> {
        self.registration_of(client)
            .and_then(|name| self.applications.get(name))
            .map(|app| app.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn application_names(&self) -> Vec<String> {
        self.applications.keys().cloned().collect()
    }

    /// Register `name` as owned by `client`
    pub fn register(&mut self, client: ClientId, name: &str) -> Result<ClientState, RegistryError> {
        if self.applications.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }

        let member = self.members.entry(client).or_default();
        if let Some(current) = &member.registration {
            return Err(RegistryError::RegistrationHeld {
                current: current.clone(),
                requested: name.to_string(),
            });
        }

        member.registration = Some(name.to_string());
        let state = member.state();
        self.applications.insert(
            name.to_string(),
            Application {
                name: name.to_string(),
                owner: client,
                subscribers: HashSet::new(),
            },
        );
        Ok(state)
    }

    /// Remove `client`'s registration of `name`.
    ///
    /// Every subscriber loses its subscription in the same step. Returns the
    /// former subscribers so the caller can notify them.
    pub fn unregister(&mut self, client: ClientId, name: &str) -> Result<Vec<ClientId>, RegistryError> {
        if self.registration_of(client) != Some(name) {
            return Err(RegistryError::NotRegistered(name.to_string()));
        }

        let subscribers: Vec<ClientId> = self
            .applications
            .remove(name)
            .map(|app| app.subscribers.into_iter().collect())
            .unwrap_or_default();

        for subscriber in &subscribers {
            if let Some(member) = self.members.get_mut(subscriber) {
                member.subscriptions.remove(name);
            }
        }

        if let Some(member) = self.members.get_mut(&client) {
            member.registration = None;
        }

        Ok(subscribers)
    }

    /// Subscribe `client` to the registered application `name`
    pub fn subscribe(&mut self, client: ClientId, name: &str) -> Result<ClientState, RegistryError> {
        let app = self
            .applications
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownApplication(name.to_string()))?;

        let member = self.members.entry(client).or_default();
        if member.subscriptions.contains(name) {
            return Err(RegistryError::AlreadySubscribed(name.to_string()));
        }

        app.subscribers.insert(client);
        member.subscriptions.insert(name.to_string());
        Ok(member.state())
    }

    /// Drop `client`'s subscription to `name`
    pub fn unsubscribe(&mut self, client: ClientId, name: &str) -> Result<ClientState, RegistryError> {
        let member = self
            .members
            .get_mut(&client)
            .filter(|m| m.subscriptions.contains(name))
            .ok_or_else(|| RegistryError::NotSubscribed(name.to_string()))?;

        member.subscriptions.remove(name);
        let state = member.state();
        if let Some(app) = self.applications.get_mut(name) {
            app.subscribers.remove(&client);
        }
        Ok(state)
    }
}
