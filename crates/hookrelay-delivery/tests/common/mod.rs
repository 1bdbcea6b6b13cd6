//! Shared fixtures for delivery integration tests.

#![allow(dead_code)]

use std::{collections::BTreeMap, sync::Arc};

use hookrelay_core::{
    events::{DeliveryEvent, EventHandler},
    models::{ActorRecord, Destination},
    time::{Clock, TestClock},
};
use hookrelay_delivery::{
    client::mock::MockTransport,
    dispatcher::{Dispatcher, DispatcherConfig, Extensions},
    log::DeliveryLogService,
    queue::{JobQueue, QueueConfig},
    storage::mock::MockStorage,
    transform::{ActorStrategies, InMemoryActorDirectory, PayloadTransformer},
};
use tokio::sync::Mutex;

/// Records every published delivery event.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<DeliveryEvent>>>,
}

impl RecordingHandler {
    pub async fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.lock().await.push(event);
    }
}

/// Dispatcher wired to in-memory storage, a scripted transport and a
/// manual clock.
pub struct Harness {
    pub storage: MockStorage,
    pub transport: MockTransport,
    pub clock: TestClock,
    pub events: RecordingHandler,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        HarnessBuilder::default().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Subscribes a fresh destination to `triggers` and returns it.
    pub async fn destination(&self, url: &str, triggers: &[&str]) -> Destination {
        let destination = Destination::new("test destination", url, triggers.iter().copied());
        self.storage.add_destination(destination.clone()).await;
        destination
    }
}

#[derive(Default)]
pub struct HarnessBuilder {
    queue: QueueConfig,
    dispatcher: Option<DispatcherConfig>,
    actors: InMemoryActorDirectory,
    extensions: Extensions,
    transport: Option<MockTransport>,
    history_cap: Option<usize>,
}

impl HarnessBuilder {
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.queue.max_attempts = max_attempts;
        self
    }

    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = Some(config);
        self
    }

    pub fn actors(mut self, actors: InMemoryActorDirectory) -> Self {
        self.actors = actors;
        self
    }

    pub fn extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn transport(mut self, transport: MockTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn history_cap(mut self, cap: usize) -> Self {
        self.history_cap = Some(cap);
        self
    }

    pub fn build(self) -> Harness {
        let storage = MockStorage::new();
        let transport = self.transport.unwrap_or_default();
        let clock = TestClock::new();
        let events = RecordingHandler::default();

        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(storage.clone());

        let dispatcher = Dispatcher::new(
            self.dispatcher.unwrap_or_else(|| DispatcherConfig {
                site_url: "https://site.test".to_string(),
                ..DispatcherConfig::default()
            }),
            JobQueue::new(store.clone(), self.queue, shared_clock.clone()),
            DeliveryLogService::new(
                store.clone(),
                self.history_cap.unwrap_or(5),
                shared_clock.clone(),
            ),
            PayloadTransformer::new(
                store.clone(),
                Arc::new(self.actors),
                ActorStrategies::default(),
                shared_clock.clone(),
            ),
            store,
            Arc::new(transport.clone()),
            shared_clock,
        )
        .with_event_handler(Arc::new(events.clone()))
        .with_extensions(self.extensions);

        Harness { storage, transport, clock, events, dispatcher }
    }
}

pub fn actor(id: i64, login: &str) -> ActorRecord {
    ActorRecord {
        id,
        login: login.to_string(),
        email: format!("{login}@example.com"),
        display_name: login.to_string(),
        first_name: String::new(),
        last_name: String::new(),
        roles: vec!["subscriber".to_string()],
        registered: Some("2024-01-01 00:00:00".to_string()),
        meta: BTreeMap::new(),
    }
}
