//! Shared infrastructure, booth instances and scripted clients.

use booth_service::auth::TokenAuthRegistry;
use booth_service::booth::BoothScheduler;
use booth_service::bus::{EventBus, LocalBus, WireMessage};
use booth_service::config::Tuning;
use booth_service::connections::{
    ConnectionRegistryHandle, OutboundFrame, RegistryContext, TransportEvent, KEEPALIVE_FRAME,
};
use booth_service::directory::{MemoryDirectory, Permission, PlaylistItem, UserDirectory, UserRecord};
use booth_service::store::{MemoryStore, StateStore};
use booth_service::waitlist::WaitlistQueue;
use common::types::ConnectionId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long a client waits for a frame before failing the test.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(120);

/// Store, bus and directory shared by every instance of one test.
pub struct TestInfra {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<LocalBus>,
    pub directory: Arc<MemoryDirectory>,
}

impl Default for TestInfra {
    fn default() -> Self {
        Self::new()
    }
}

impl TestInfra {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(LocalBus::new()),
            directory: Arc::new(MemoryDirectory::new()),
        }
    }

    /// A regular participant who may join the waitlist and chat, with a
    /// playlist of `(track id, seconds)` items.
    pub fn add_participant(&self, id: &str, tracks: &[(&str, u64)]) {
        let playlist_id = format!("{id}-playlist");
        self.directory
            .put_playlist(&playlist_id, tracks.iter().map(|(track, secs)| track_item(track, *secs)))
            .unwrap();
        self.directory
            .put_user(
                UserRecord::new(id, id)
                    .with_playlist(playlist_id)
                    .with_permissions([Permission::WaitlistJoin, Permission::ChatSend]),
            )
            .unwrap();
    }

    /// A participant holding every waitlist and booth permission.
    pub fn add_moderator(&self, id: &str) {
        self.directory
            .put_user(UserRecord::new(id, id).with_permissions([
                Permission::WaitlistJoin,
                Permission::WaitlistJoinLocked,
                Permission::WaitlistAdd,
                Permission::WaitlistMove,
                Permission::WaitlistRemove,
                Permission::WaitlistClear,
                Permission::WaitlistLock,
                Permission::BoothSkipOther,
                Permission::ChatSend,
            ]))
            .unwrap();
    }

    /// Replace a participant's playlist items.
    pub fn set_tracks(&self, id: &str, tracks: &[(&str, u64)]) {
        self.directory
            .put_playlist(
                &format!("{id}-playlist"),
                tracks.iter().map(|(track, secs)| track_item(track, *secs)),
            )
            .unwrap();
    }

    pub fn instance(&self, instance_id: &str) -> TestInstance {
        self.instance_with(instance_id, Tuning::default())
    }

    pub fn instance_with(&self, instance_id: &str, tuning: Tuning) -> TestInstance {
        TestInstance::start(self, instance_id, tuning)
    }
}

pub fn track_item(id: &str, secs: u64) -> PlaylistItem {
    PlaylistItem {
        id: id.to_string(),
        artist: "Test Artist".to_string(),
        title: format!("Track {id}"),
        start: 0,
        end: secs,
    }
}

/// One booth process.
pub struct TestInstance {
    pub instance_id: String,
    pub store: Arc<MemoryStore>,
    pub booth: Arc<BoothScheduler>,
    pub waitlist: Arc<WaitlistQueue>,
    pub auth: TokenAuthRegistry,
    pub registry: ConnectionRegistryHandle,
    pub cancel_token: CancellationToken,
}

impl TestInstance {
    fn start(infra: &TestInfra, instance_id: &str, tuning: Tuning) -> Self {
        let store = Arc::clone(&infra.store) as Arc<dyn StateStore>;
        let bus = Arc::clone(&infra.bus) as Arc<dyn EventBus>;
        let directory = Arc::clone(&infra.directory) as Arc<dyn UserDirectory>;
        let cancel_token = CancellationToken::new();

        let booth = BoothScheduler::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&directory),
            tuning.advance_lock_ttl,
            cancel_token.child_token(),
        );
        let waitlist = Arc::new(WaitlistQueue::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&directory),
            Arc::clone(&booth),
        ));
        let auth = TokenAuthRegistry::new(Arc::clone(&store), tuning.auth_token_ttl);
        let registry = ConnectionRegistryHandle::spawn(
            RegistryContext {
                instance_id: instance_id.to_string(),
                tuning,
                store,
                bus,
                directory,
                auth: auth.clone(),
                booth: Arc::clone(&booth),
                waitlist: Arc::clone(&waitlist),
            },
            cancel_token.child_token(),
        );

        Self {
            instance_id: instance_id.to_string(),
            store: Arc::clone(&infra.store),
            booth,
            waitlist,
            auth,
            registry,
            cancel_token,
        }
    }

    /// Open a transport that stays a Guest.
    pub async fn connect(&self) -> TestClient {
        let (connection_id, frames) = self.registry.open_transport().await.unwrap();
        TestClient {
            connection_id,
            registry: self.registry.clone(),
            frames,
        }
    }

    /// Open a transport and authenticate it as `user_id`.
    pub async fn login(&self, user_id: &str) -> TestClient {
        let token = self.auth.create_auth_token(user_id).await.unwrap();
        let mut client = self.connect().await;
        client.send_raw(&token).await;
        let ack = client.expect_command("authenticated").await;
        assert_eq!(ack["userID"], user_id);
        client
    }

    /// Stop the instance as if the process exited.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

/// A scripted transport.
pub struct TestClient {
    pub connection_id: ConnectionId,
    registry: ConnectionRegistryHandle,
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl TestClient {
    pub async fn send_raw(&self, frame: &str) {
        self.registry
            .transport_event(self.connection_id, TransportEvent::Frame(frame.to_string()))
            .await
            .unwrap();
    }

    pub async fn send(&self, command: &str, data: serde_json::Value) {
        let frame = WireMessage::new(command, data).to_frame().unwrap();
        self.send_raw(&frame).await;
    }

    /// Report the transport closed, as a dropped socket would.
    pub async fn close(&self) {
        self.registry
            .transport_event(self.connection_id, TransportEvent::Closed)
            .await
            .unwrap();
    }

    /// Next frame, keepalives included. `None` once the registry dropped
    /// the transport.
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        tokio::time::timeout(RECEIVE_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
    }

    /// Next decoded message, skipping keepalives.
    pub async fn next_message(&mut self) -> WireMessage {
        loop {
            match self.next_frame().await {
                Some(OutboundFrame::Text(text)) if text == KEEPALIVE_FRAME => {}
                Some(OutboundFrame::Text(text)) => return serde_json::from_str(&text).unwrap(),
                Some(OutboundFrame::Close) => panic!("transport closed by registry"),
                None => panic!("transport dropped by registry"),
            }
        }
    }

    /// Skip messages until `command` arrives and return its data.
    pub async fn expect_command(&mut self, command: &str) -> serde_json::Value {
        loop {
            let message = self.next_message().await;
            if message.command == command {
                return message.data;
            }
        }
    }

    /// Wait until the registry asks the transport to close.
    pub async fn expect_close(&mut self) {
        loop {
            match self.next_frame().await {
                Some(OutboundFrame::Close) | None => return,
                Some(OutboundFrame::Text(_)) => {}
            }
        }
    }

    /// Every message already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                if text != KEEPALIVE_FRAME {
                    messages.push(serde_json::from_str(&text).unwrap());
                }
            }
        }
        messages
    }
}
