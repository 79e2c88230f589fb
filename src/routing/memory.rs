//! In-memory StreamRegistry implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Result, StreamRegistration, StreamRegistry};

/// In-memory registry for tests and embedded use. Lookups read the live map,
/// so registrations are visible immediately.
#[derive(Default)]
pub struct MemoryStreamRegistry {
    registrations: RwLock<HashMap<String, StreamRegistration>>,
}

impl MemoryStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamRegistry for MemoryStreamRegistry {
    async fn save_stream(&self, registration: StreamRegistration) -> Result<()> {
        let mut registrations = self.registrations.write().await;
        registrations.insert(registration.id.clone(), registration);
        Ok(())
    }

    async fn find_streams(&self, event_type: u32) -> Result<Vec<String>> {
        let registrations = self.registrations.read().await;
        let mut streams: Vec<String> = registrations
            .values()
            .filter(|registration| registration.events.contains(&event_type))
            .map(|registration| registration.id.clone())
            .collect();
        streams.sort();
        Ok(streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reverse_lookup_matches_registered_interest() {
        let registry = MemoryStreamRegistry::new();
        registry
            .save_stream(StreamRegistration::new("proj-a", vec![1, 2]))
            .await
            .unwrap();
        registry
            .save_stream(StreamRegistration::new("proj-b", vec![2, 3]))
            .await
            .unwrap();

        assert_eq!(registry.find_streams(1).await.unwrap(), vec!["proj-a"]);
        assert_eq!(
            registry.find_streams(2).await.unwrap(),
            vec!["proj-a", "proj-b"]
        );
        assert!(registry.find_streams(9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_stream_upserts_by_id() {
        let registry = MemoryStreamRegistry::new();
        registry
            .save_stream(StreamRegistration::new("proj-a", vec![1]))
            .await
            .unwrap();
        registry
            .save_stream(StreamRegistration::new("proj-a", vec![2]))
            .await
            .unwrap();

        assert!(registry.find_streams(1).await.unwrap().is_empty());
        assert_eq!(registry.find_streams(2).await.unwrap(), vec!["proj-a"]);
    }
}
