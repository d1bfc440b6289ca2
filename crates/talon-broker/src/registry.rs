use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info};

use talon_core::types::{InboundMessage, SessionKey};
use talon_sessions::SessionStore;

use crate::channel::ChannelClient;
use crate::error::{BrokerError, Result};

/// Boxed error for handler implementations living in other crates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Invoked for every inbound message after session resolution. Errors are
/// logged; they never stop dispatch.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        key: SessionKey,
        msg: InboundMessage,
    ) -> std::result::Result<(), BoxError>;
}

struct RunningChannel {
    client: Arc<ChannelClient>,
    dispatch: JoinHandle<()>,
}

/// Owns every running channel broker plus its dispatch task.
///
/// Per channel, one dispatch task reads the broker inbox, resolves the
/// session key, lazily creates the session, and synchronously invokes the
/// handler.
pub struct ChannelRegistry {
    sessions: Arc<SessionStore>,
    channels: StdMutex<HashMap<String, RunningChannel>>,
}

impl ChannelRegistry {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self {
            sessions,
            channels: StdMutex::new(HashMap::new()),
        }
    }

    /// Start the channel and begin dispatching its messages to `handler`.
    pub async fn register(
        &self,
        client: Arc<ChannelClient>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let id = client.id().to_string();
        client.start().await?;
        let mut inbox = client.take_inbox().ok_or(BrokerError::InboxTaken)?;

        let sessions = Arc::clone(&self.sessions);
        let dispatch_id = id.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                let key = SessionKey::for_message(&msg);
                if let Err(e) = sessions.ensure(&key.format()) {
                    error!(channel = %dispatch_id, session = %key, error = %e, "session create failed");
                    continue;
                }
                if let Err(e) = handler.handle(key.clone(), msg).await {
                    error!(channel = %dispatch_id, session = %key, error = %e, "message handler failed");
                }
            }
            info!(channel = %dispatch_id, "channel dispatch ended");
        });

        info!(channel = %id, "channel registered");
        self.channels
            .lock()
            .unwrap()
            .insert(id, RunningChannel { client, dispatch });
        Ok(())
    }

    /// The running broker for `id`, used by outbound senders (replies,
    /// scheduler notifications).
    pub fn get(&self, id: &str) -> Option<Arc<ChannelClient>> {
        self.channels
            .lock()
            .unwrap()
            .get(id)
            .map(|c| Arc::clone(&c.client))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every channel: cancel brokers (which unblocks their readers and
    /// closes the inboxes), then wait for the dispatch tasks to drain.
    pub async fn stop_all(&self) {
        let drained: Vec<RunningChannel> = {
            let mut channels = self.channels.lock().unwrap();
            channels.drain().map(|(_, c)| c).collect()
        };
        for running in drained {
            running.client.stop().await;
            let _ = running.dispatch.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::net::UnixListener;

    use talon_core::types::ChannelCapabilities;
    use talon_protocol::channel::{ChannelRequest, ChannelResponse};
    use talon_protocol::handshake::SocketNetwork;
    use talon_protocol::{read_frame, write_frame};

    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(
            &self,
            key: SessionKey,
            msg: InboundMessage,
        ) -> std::result::Result<(), BoxError> {
            if self.fail_on.as_deref() == Some(msg.content.as_str()) {
                return Err("handler exploded".into());
            }
            self.seen.lock().unwrap().push((key.format(), msg.content));
            Ok(())
        }
    }

    fn push(conversation: &str, thread: &str, content: &str) -> ChannelResponse {
        ChannelResponse {
            msg: Some(InboundMessage {
                channel_id: "slack".into(),
                conversation_id: conversation.into(),
                thread_id: thread.into(),
                sender_id: "U1".into(),
                sender_name: "ada".into(),
                content: content.into(),
                files: Vec::new(),
                metadata: Default::default(),
                timestamp: String::new(),
            }),
            ..Default::default()
        }
    }

    async fn spawn_channel_server(
        listener: UnixListener,
        pushes: Vec<ChannelResponse>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _: ChannelRequest = read_frame(&mut sock).await.unwrap(); // capabilities
            write_frame(
                &mut sock,
                &ChannelResponse {
                    caps: Some(ChannelCapabilities {
                        id: "slack".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            let _: ChannelRequest = read_frame(&mut sock).await.unwrap(); // start
            for p in pushes {
                write_frame(&mut sock, &p).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        })
    }

    #[tokio::test]
    async fn dispatch_resolves_keys_and_survives_handler_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chan.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = spawn_channel_server(
            listener,
            vec![
                push("C042", "", "first"),
                push("C042", "", "boom"),
                push("C042", "171.5", "threaded"),
            ],
        )
        .await;

        let sessions = Arc::new(SessionStore::new());
        let registry = ChannelRegistry::new(Arc::clone(&sessions));
        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_on: Some("boom".to_string()),
        });

        let client = Arc::new(
            ChannelClient::connect_handshake(
                SocketNetwork::Unix,
                path.to_str().unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap(),
        );
        registry.register(client, handler.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = handler.seen.lock().unwrap().clone();
        // the failing message was dropped, dispatch kept going
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("chan:slack:conv:C042".to_string(), "first".to_string()));
        assert_eq!(
            seen[1],
            (
                "chan:slack:conv:C042:thread:171.5".to_string(),
                "threaded".to_string()
            )
        );

        // sessions were lazily created for every delivered key
        assert!(sessions.get("chan:slack:conv:C042").is_some());
        assert!(sessions.get("chan:slack:conv:C042:thread:171.5").is_some());

        registry.stop_all().await;
        server.abort();
    }
}
