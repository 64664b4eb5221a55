//! Stream subscriptions.
//!
//! A subscription is a bound procedure call re-run every tick on behalf of
//! one client. Identifiers come from a single counter that skips zero and
//! any id still in use after it wraps.

use crate::codec::Value;
use crate::protocol::ClientId;
use crate::service::Procedure;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct Subscription {
    pub id: u32,
    pub client: ClientId,
    pub procedure: Arc<Procedure>,
    pub arguments: Vec<Value>,
    /// Encoded result most recently sent, for change suppression.
    last_sent: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct StreamManager {
    subscriptions: BTreeMap<u32, Subscription>,
    next_id: u32,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            subscriptions: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Add a subscription, or return the id of an equal one the client
    /// already holds. Arguments are compared as decoded values.
    pub fn add(&mut self, client: ClientId, procedure: Arc<Procedure>, arguments: Vec<Value>) -> u32 {
        let existing = self.subscriptions.values().find(|s| {
            s.client == client && Arc::ptr_eq(&s.procedure, &procedure) && s.arguments == arguments
        });
        if let Some(existing) = existing {
            return existing.id;
        }

        let id = self.allocate_id();
        debug!(
            "Added stream {} for client {} ({})",
            id,
            client,
            procedure.signature.qualified_name()
        );
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                client,
                procedure,
                arguments,
                last_sent: None,
            },
        );
        id
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.subscriptions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Remove `id` if `client` owns it.
    pub fn remove(&mut self, client: ClientId, id: u32) -> bool {
        match self.subscriptions.get(&id) {
            Some(subscription) if subscription.client == client => {
                self.subscriptions.remove(&id);
                debug!("Removed stream {} for client {}", id, client);
                true
            }
            _ => false,
        }
    }

    /// Remove every subscription of `client`, returning how many there were.
    pub fn remove_client(&mut self, client: ClientId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, s| s.client != client);
        before - self.subscriptions.len()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub fn count_for(&self, client: ClientId) -> usize {
        self.subscriptions
            .values()
            .filter(|s| s.client == client)
            .count()
    }

    /// Subscriptions to evaluate this tick, in id order.
    pub fn snapshot(&self) -> Vec<(u32, ClientId, Arc<Procedure>, Vec<Value>)> {
        self.subscriptions
            .values()
            .map(|s| (s.id, s.client, s.procedure.clone(), s.arguments.clone()))
            .collect()
    }

    /// Remember `encoded` as sent for `id`. Returns false when it matches
    /// what was sent last time.
    pub fn record_sent(&mut self, id: u32, encoded: &[u8]) -> bool {
        match self.subscriptions.get_mut(&id) {
            Some(subscription) => {
                if subscription.last_sent.as_deref() == Some(encoded) {
                    return false;
                }
                subscription.last_sent = Some(encoded.to_vec());
                true
            }
            None => false,
        }
    }
}
