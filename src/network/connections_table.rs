//! Nonce to connection id index
//!
//! Lets the node see that two transport sessions belong to the same logical
//! peer, so duplicate connections can be collapsed.

use crate::network::error::NetworkError;
use std::collections::HashMap;

/// Bidirectional map between peer nonces and transport connection ids
#[derive(Debug, Default, Clone)]
pub struct ConnectionsTable {
    by_nonce: HashMap<String, String>,
    by_connection: HashMap<String, String>,
}

impl ConnectionsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, nonce: &str, connection_id: &str) -> Result<(), NetworkError> {
        if nonce.is_empty() {
            return Err(NetworkError::validation("cannot register a connection without a nonce"));
        }
        if connection_id.is_empty() {
            return Err(NetworkError::validation("cannot register a nonce without a connection id"));
        }

        // Drop stale pairs on both sides so the maps stay mirror images
        if let Some(previous) = self.by_nonce.remove(nonce) {
            self.by_connection.remove(&previous);
        }
        if let Some(previous) = self.by_connection.remove(connection_id) {
            self.by_nonce.remove(&previous);
        }

        self.by_nonce.insert(nonce.to_string(), connection_id.to_string());
        self.by_connection.insert(connection_id.to_string(), nonce.to_string());
        Ok(())
    }

    pub fn get_nonce(&self, connection_id: &str) -> Option<&str> {
        self.by_connection.get(connection_id).map(String::as_str)
    }

    pub fn get_connection_id(&self, nonce: &str) -> Option<&str> {
        self.by_nonce.get(nonce).map(String::as_str)
    }

    pub fn remove(&mut self, nonce: &str) -> Result<(), NetworkError> {
        if nonce.is_empty() {
            return Err(NetworkError::validation("cannot remove a connection without a nonce"));
        }
        if let Some(connection_id) = self.by_nonce.remove(nonce) {
            self.by_connection.remove(&connection_id);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_nonce.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_nonce.is_empty()
    }
}
