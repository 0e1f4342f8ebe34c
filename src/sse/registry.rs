//! Connection registry and channel index.
//!
//! Both maps are only mutated together, under the manager's lock, so that
//! `id ∈ channels[name]` holds exactly when `name ∈ connections[id].subscribed_channels`.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use super::connection::{Connection, ConnectionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub subscriber_count: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    channels: HashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    /// Inserts a connection and indexes any channels it already lists.
    pub fn insert(&mut self, connection: Connection) {
        for channel in &connection.subscribed_channels {
            self.channels
                .entry(channel.clone())
                .or_default()
                .insert(connection.id.clone());
        }
        self.connections.insert(connection.id.clone(), connection);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn subscribe(&mut self, id: &str, channel: &str) -> bool {
        let Some(connection) = self.connections.get_mut(id) else {
            return false;
        };
        connection.subscribed_channels.insert(channel.to_string());
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id.to_string());
        true
    }

    pub fn unsubscribe(&mut self, id: &str, channel: &str) -> bool {
        let Some(connection) = self.connections.get_mut(id) else {
            return false;
        };
        connection.subscribed_channels.remove(channel);
        self.detach(id, channel);
        true
    }

    /// Removes a connection and all of its channel memberships.
    pub fn remove(&mut self, id: &str) -> Option<Connection> {
        let mut connection = self.connections.remove(id)?;
        for channel in connection.subscribed_channels.drain() {
            self.detach(id, &channel);
        }
        Some(connection)
    }

    fn detach(&mut self, id: &str, channel: &str) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(id);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    #[must_use]
    pub fn connection_count(&self, channel: Option<&str>) -> usize {
        match channel {
            Some(name) => self.channels.get(name).map_or(0, HashSet::len),
            None => self.connections.len(),
        }
    }

    #[must_use]
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn channel_infos(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self
            .channels
            .iter()
            .map(|(name, members)| ChannelInfo {
                name: name.clone(),
                subscriber_count: members.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Verifies both directions of the channel index.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let forward = self.connections.values().all(|conn| {
            conn.subscribed_channels.iter().all(|channel| {
                self.channels
                    .get(channel)
                    .is_some_and(|members| members.contains(&conn.id))
            })
        });
        let backward = self.channels.iter().all(|(channel, members)| {
            !members.is_empty()
                && members.iter().all(|id| {
                    self.connections
                        .get(id)
                        .is_some_and(|conn| conn.subscribed_channels.contains(channel))
                })
        });
        forward && backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::connection::ConnectionLimits;

    fn registry_with(ids: &[&str]) -> Registry {
        let mut registry = Registry::default();
        for id in ids {
            registry.insert(Connection::new((*id).to_string(), ConnectionLimits::default()));
        }
        registry
    }

    #[test]
    fn test_subscribe_unknown_connection() {
        let mut registry = Registry::default();
        assert!(!registry.subscribe("missing", "news"));
        assert!(!registry.unsubscribe("missing", "news"));
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let mut registry = registry_with(&["a", "b"]);
        assert!(registry.subscribe("a", "news"));
        assert!(registry.subscribe("b", "news"));
        assert!(registry.subscribe("a", "sports"));

        assert_eq!(registry.connection_count(Some("news")), 2);
        assert_eq!(registry.connection_count(Some("sports")), 1);
        assert_eq!(registry.connection_count(None), 2);
        assert!(registry.is_consistent());

        assert!(registry.unsubscribe("a", "sports"));
        assert_eq!(registry.connection_count(Some("sports")), 0);
        assert_eq!(registry.channel_count(), 1);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_unsubscribe_from_unjoined_channel_is_ok() {
        let mut registry = registry_with(&["a"]);
        assert!(registry.unsubscribe("a", "never"));
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn test_remove_clears_channels() {
        let mut registry = registry_with(&["a", "b"]);
        registry.subscribe("a", "news");
        registry.subscribe("b", "news");
        registry.subscribe("a", "solo");

        let removed = registry.remove("a").unwrap();
        assert!(removed.subscribed_channels.is_empty());
        assert_eq!(registry.subscribers("news"), vec!["b".to_string()]);
        assert_eq!(registry.connection_count(Some("solo")), 0);
        assert!(registry.remove("a").is_none());
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_insert_indexes_preset_channels() {
        let mut registry = Registry::default();
        let mut conn = Connection::new("a".to_string(), ConnectionLimits::default());
        conn.subscribed_channels.insert("news".to_string());
        registry.insert(conn);

        assert_eq!(
            registry.channel_infos(),
            vec![ChannelInfo {
                name: "news".to_string(),
                subscriber_count: 1
            }]
        );
        assert!(registry.is_consistent());
    }
}
