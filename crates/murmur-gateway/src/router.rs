use std::sync::Arc;

use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use murmur_db::Database;
use murmur_db::models::{NewUser, ProfileChanges};
use murmur_types::events::{ClientCommand, Presence, ServerEvent, Status};
use murmur_types::models::{MessageKind, UnreadCounts};

use crate::error::RouteError;
use crate::profiles::{contact_profile, decode_image, full_profile};
use crate::registry::{PresenceLocks, SessionHandle, SessionRegistry};

const BAD_CREDENTIALS: &str = "Invalid username or password";

/// State the router keeps for one connection.
pub struct ConnectionContext {
    handle: SessionHandle,
    username: Option<String>,
}

impl ConnectionContext {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            username: None,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.handle.conn_id()
    }

    /// The user this connection is logged in as, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn reply(&self, event: ServerEvent) {
        if let Err(e) = self.handle.send(event) {
            debug!("Reply dropped: {}", e);
        }
    }

    fn require_login(&self) -> Result<String, RouteError> {
        self.username
            .clone()
            .ok_or_else(|| RouteError::invalid("Not logged in"))
    }
}

/// Dispatches decoded envelopes to the store and to live sessions.
#[derive(Clone)]
pub struct MessageRouter {
    db: Arc<Database>,
    registry: SessionRegistry,
    presence: PresenceLocks,
}

impl MessageRouter {
    pub fn new(db: Arc<Database>, registry: SessionRegistry) -> Self {
        Self {
            db,
            registry,
            presence: PresenceLocks::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Handle one envelope from `ctx`. Failures are answered on `ctx` and
    /// never escape to the connection loop.
    pub async fn dispatch(&self, ctx: &mut ConnectionContext, cmd: ClientCommand) {
        let kind = cmd.kind();
        let result = match cmd {
            ClientCommand::Register {
                username,
                password,
                display_name,
                profile_image,
                additional_image,
            } => {
                self.register(ctx, username, password, display_name, profile_image, additional_image)
                    .await
            }
            ClientCommand::Login { username, password } => {
                self.login(ctx, username, password).await
            }
            ClientCommand::Message {
                sender,
                receiver,
                message_type,
                content,
            } => self.message(ctx, sender, receiver, message_type, content).await,
            ClientCommand::ProfileUpdate {
                username,
                display_name,
                status_message,
                profile_picture,
                additional_image,
                current_theme,
            } => {
                let changes = decode_image(profile_picture.as_deref()).and_then(|profile_image| {
                    Ok(ProfileChanges {
                        display_name,
                        status_message,
                        profile_image,
                        additional_image: decode_image(additional_image.as_deref())?,
                        current_theme,
                    })
                });
                match changes {
                    Ok(changes) => self.profile_update(ctx, username, changes).await,
                    Err(e) => Err(e),
                }
            }
            ClientCommand::ProfileRequest { requested_username } => {
                self.profile_request(ctx, requested_username).await
            }
            ClientCommand::SaveUnread {
                username,
                unread_messages,
            } => self.save_unread(ctx, username, unread_messages).await,
            ClientCommand::HistoryRequest { peer } => self.history_request(ctx, peer).await,
            ClientCommand::Unknown => {
                debug!("Ignoring envelope of unknown type on {}", ctx.conn_id());
                Ok(())
            }
        };

        if let Err(e) = result {
            match &e {
                RouteError::Validation(reason) => {
                    warn!("{} rejected on {}: {}", kind, ctx.conn_id(), reason)
                }
                RouteError::Storage(cause) => {
                    error!("{} failed on {}: {:#}", kind, ctx.conn_id(), cause)
                }
            }
            ctx.reply(error_reply(kind, &e));
        }
    }

    /// Release the connection's session, if it still owns one: drop the
    /// registry entry, persist `last_seen` and tell everyone else.
    pub async fn disconnect(&self, ctx: &mut ConnectionContext) {
        let Some(username) = ctx.username.take() else {
            return;
        };
        let _presence = self.presence.acquire(&username).await;

        if !self.registry.remove_if_current(&username, ctx.conn_id()).await {
            debug!("{} on {} was already superseded", username, ctx.conn_id());
            return;
        }

        let name = username.clone();
        if let Err(e) = self.blocking(move |db| db.set_offline(&name)).await {
            error!("Failed to persist offline state for {}: {}", username, e);
        }

        let report = self
            .registry
            .broadcast_except(&username, &ServerEvent::presence(&username, Presence::Offline))
            .await;
        info!(
            "{} went offline (notified {}, {} unreachable)",
            username, report.delivered, report.failed
        );
    }

    async fn register(
        &self,
        ctx: &ConnectionContext,
        username: String,
        password: String,
        display_name: Option<String>,
        profile_image: Option<String>,
        additional_image: Option<String>,
    ) -> Result<(), RouteError> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(RouteError::invalid("Username and password required"));
        }
        let profile_image = decode_image(profile_image.as_deref())?;
        let additional_image = decode_image(additional_image.as_deref())?;
        let display_name = display_name.filter(|s| !s.trim().is_empty());

        let name = username.clone();
        let created = self
            .blocking(move |db| {
                db.create_user(&NewUser {
                    username: &name,
                    password: &password,
                    display_name: display_name.as_deref(),
                    profile_image: profile_image.as_deref(),
                    additional_image: additional_image.as_deref(),
                })
            })
            .await?;

        if !created {
            return Err(RouteError::invalid("Username already exists"));
        }

        info!("Registered {}", username);
        ctx.reply(ServerEvent::register_ok());
        Ok(())
    }

    async fn login(
        &self,
        ctx: &mut ConnectionContext,
        username: String,
        password: String,
    ) -> Result<(), RouteError> {
        if username.is_empty() || password.is_empty() {
            return Err(RouteError::invalid(BAD_CREDENTIALS));
        }

        let name = username.clone();
        let verified = self
            .blocking(move |db| db.verify_credential(&name, &password))
            .await?;
        if !verified {
            return Err(RouteError::invalid(BAD_CREDENTIALS));
        }

        // Same connection switching accounts: the old identity goes offline.
        if ctx.username.as_deref().is_some_and(|current| current != username) {
            self.disconnect(ctx).await;
        }

        // Held until the online broadcast has gone out.
        let _presence = self.presence.acquire(&username).await;

        // Load everything the reply needs before the session becomes visible.
        let online = self.registry.online_usernames().await;
        let name = username.clone();
        let (contacts, chat_history, unread_messages) = self
            .blocking(move |db| {
                let contacts = db
                    .get_all_profiles()?
                    .into_iter()
                    .map(|row| {
                        let is_online = row.username == name || online.contains(&row.username);
                        contact_profile(row, is_online)
                    })
                    .collect::<Vec<_>>();
                let history = db.get_user_history(&name)?;
                let unread = db.get_unread(&name)?;
                db.set_online(&name)?;
                Ok((contacts, history, unread))
            })
            .await?;

        if let Some(previous) = self.registry.put(&username, ctx.handle.clone()).await {
            if previous.conn_id() != ctx.conn_id() {
                info!(
                    "{} logged in again on {}; {} no longer receives events",
                    username,
                    ctx.conn_id(),
                    previous.conn_id()
                );
            }
        }
        ctx.username = Some(username.clone());

        info!(
            "{} logged in on {} ({} contacts, {} messages)",
            username,
            ctx.conn_id(),
            contacts.len(),
            chat_history.len()
        );

        ctx.reply(ServerEvent::Login {
            status: Status::Success,
            message: None,
            contacts: Some(contacts),
            chat_history: Some(chat_history),
            unread_messages: Some(unread_messages),
        });

        self.registry
            .broadcast_except(&username, &ServerEvent::presence(&username, Presence::Online))
            .await;
        Ok(())
    }

    async fn message(
        &self,
        ctx: &ConnectionContext,
        sender: Option<String>,
        receiver: String,
        message_type: Option<String>,
        content: String,
    ) -> Result<(), RouteError> {
        let me = ctx.require_login()?;
        let sender = sender.filter(|s| !s.is_empty()).unwrap_or_else(|| me.clone());
        if sender != me {
            return Err(RouteError::invalid("Sender does not match the logged-in user"));
        }
        if receiver.is_empty() {
            return Err(RouteError::invalid("Receiver required"));
        }
        let kind = match message_type.as_deref() {
            None | Some("") => return Err(RouteError::invalid("message_type required")),
            Some(raw) => MessageKind::parse(raw)
                .ok_or_else(|| RouteError::invalid(format!("Unsupported message_type: {}", raw)))?,
        };
        if content.is_empty() {
            return Err(RouteError::invalid("Content required"));
        }
        if kind == MessageKind::Image && B64.decode(&content).is_err() {
            return Err(RouteError::invalid("Invalid image encoding"));
        }

        // Persist before any live delivery.
        let to = receiver.clone();
        let stored = self
            .blocking(move |db| {
                if !db.user_exists(&to)? {
                    return Ok(None);
                }
                db.insert_message(&sender, &to, kind, &content).map(Some)
            })
            .await?
            .ok_or_else(|| RouteError::invalid("Unknown receiver"))?;

        match self.registry.get(&receiver).await {
            Some(peer) => {
                if let Err(e) = peer.send(stored.into()) {
                    debug!("{} -> {} stored, live delivery failed: {}", me, receiver, e);
                }
            }
            None => debug!("{} -> {} stored for later retrieval", me, receiver),
        }
        Ok(())
    }

    async fn profile_update(
        &self,
        ctx: &ConnectionContext,
        username: Option<String>,
        changes: ProfileChanges,
    ) -> Result<(), RouteError> {
        let me = ctx.require_login()?;
        let target = username.filter(|s| !s.is_empty()).unwrap_or_else(|| me.clone());
        if target != me {
            return Err(RouteError::invalid("Cannot update another user's profile"));
        }
        match self.registry.get(&target).await {
            Some(handle) if handle.conn_id() == ctx.conn_id() => {}
            _ => return Err(RouteError::invalid("User is not online")),
        }
        if changes.is_empty() {
            return Err(RouteError::invalid("No profile fields supplied"));
        }

        let name = target.clone();
        let profile = self
            .blocking(move |db| {
                if !db.update_profile(&name, &changes)? {
                    return Ok(None);
                }
                Ok(db.get_profile(&name)?.map(|row| contact_profile(row, true)))
            })
            .await?
            .ok_or_else(|| RouteError::invalid("User not found"))?;

        let report = self
            .registry
            .broadcast_except(
                &target,
                &ServerEvent::ProfileUpdate {
                    username: target.clone(),
                    profile,
                },
            )
            .await;
        info!("{} updated their profile (notified {})", target, report.delivered);

        ctx.reply(ServerEvent::ProfileUpdateResult {
            status: Status::Success,
            message: None,
        });
        Ok(())
    }

    async fn profile_request(
        &self,
        ctx: &ConnectionContext,
        requested_username: String,
    ) -> Result<(), RouteError> {
        ctx.require_login()?;
        if requested_username.is_empty() {
            return Err(RouteError::invalid("requested_username required"));
        }

        let online = self.registry.contains(&requested_username).await;
        let profile = self
            .blocking(move |db| {
                Ok(db
                    .get_profile(&requested_username)?
                    .map(|row| full_profile(row, online)))
            })
            .await?
            .ok_or_else(|| RouteError::invalid("User not found"))?;

        ctx.reply(ServerEvent::ProfileData { profile });
        Ok(())
    }

    async fn save_unread(
        &self,
        ctx: &ConnectionContext,
        username: Option<String>,
        counts: UnreadCounts,
    ) -> Result<(), RouteError> {
        let me = ctx.require_login()?;
        if username.as_deref().is_some_and(|u| !u.is_empty() && u != me) {
            return Err(RouteError::invalid("Cannot save unread counts for another user"));
        }

        let entries = counts.len();
        let owner = me.clone();
        self.blocking(move |db| db.replace_unread(&owner, &counts))
            .await?;
        debug!("Saved {} unread counters for {}", entries, me);
        Ok(())
    }

    async fn history_request(&self, ctx: &ConnectionContext, peer: String) -> Result<(), RouteError> {
        let me = ctx.require_login()?;
        if peer.is_empty() {
            return Err(RouteError::invalid("peer required"));
        }

        let other = peer.clone();
        let messages = self
            .blocking(move |db| db.get_conversation(&me, &other))
            .await?;
        ctx.reply(ServerEvent::History { peer, messages });
        Ok(())
    }

    /// Run a store call on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, RouteError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow!("spawn_blocking join error: {}", e))?;
        Ok(result?)
    }
}

/// Build the failure reply for a request of wire type `kind`.
fn error_reply(kind: &str, err: &RouteError) -> ServerEvent {
    let message = err.reply_text();
    match kind {
        "register" => ServerEvent::register_failed(message),
        "login" => ServerEvent::login_failed(message),
        "profile_update" => ServerEvent::ProfileUpdateResult {
            status: Status::Error,
            message: Some(message),
        },
        _ => ServerEvent::Error {
            request: kind.to_string(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use murmur_types::models::Profile;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Client {
        ctx: ConnectionContext,
        rx: UnboundedReceiver<ServerEvent>,
    }

    impl Client {
        fn connect() -> Self {
            let (handle, rx) = SessionHandle::channel();
            Self {
                ctx: ConnectionContext::new(handle),
                rx,
            }
        }

        async fn send(&mut self, router: &MessageRouter, json: &str) {
            let cmd: ClientCommand = serde_json::from_str(json).unwrap();
            router.dispatch(&mut self.ctx, cmd).await;
        }

        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn router() -> MessageRouter {
        let db = Arc::new(Database::open_in_memory().unwrap());
        MessageRouter::new(db, SessionRegistry::new())
    }

    async fn register(router: &MessageRouter, name: &str, password: &str) {
        let mut c = Client::connect();
        c.send(
            router,
            &format!(r#"{{"type":"register","username":"{}","password":"{}"}}"#, name, password),
        )
        .await;
        assert_eq!(c.drain(), vec![ServerEvent::register_ok()]);
    }

    async fn login(router: &MessageRouter, name: &str, password: &str) -> (Client, ServerEvent) {
        let mut c = Client::connect();
        c.send(
            router,
            &format!(r#"{{"type":"login","username":"{}","password":"{}"}}"#, name, password),
        )
        .await;
        let mut events = c.drain();
        assert_eq!(events.len(), 1, "expected exactly one login reply");
        let reply = events.remove(0);
        (c, reply)
    }

    fn contacts_of(reply: &ServerEvent) -> Vec<Profile> {
        match reply {
            ServerEvent::Login {
                status: Status::Success,
                contacts: Some(contacts),
                ..
            } => contacts.clone(),
            other => panic!("not a successful login: {:?}", other),
        }
    }

    fn history_of(reply: &ServerEvent) -> Vec<String> {
        match reply {
            ServerEvent::Login {
                chat_history: Some(history),
                ..
            } => history.iter().map(|m| m.content.clone()).collect(),
            other => panic!("not a successful login: {:?}", other),
        }
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_blank_credentials() {
        let router = router();
        register(&router, "alice", "pw1").await;

        let mut c = Client::connect();
        c.send(&router, r#"{"type":"register","username":"alice","password":"other"}"#)
            .await;
        c.send(&router, r#"{"type":"register","username":"","password":"x"}"#)
            .await;
        assert_eq!(
            c.drain(),
            vec![
                ServerEvent::register_failed("Username already exists"),
                ServerEvent::register_failed("Username and password required"),
            ]
        );
    }

    #[tokio::test]
    async fn wrong_password_never_creates_a_session() {
        let router = router();
        register(&router, "alice", "pw1").await;

        let (client, reply) = login(&router, "alice", "wrong").await;
        assert_eq!(reply, ServerEvent::login_failed(BAD_CREDENTIALS));
        assert!(client.ctx.username().is_none());
        assert!(router.registry().is_empty().await);

        let (_, reply) = login(&router, "nobody", "pw1").await;
        assert_eq!(reply, ServerEvent::login_failed(BAD_CREDENTIALS));
        assert!(router.registry().is_empty().await);
    }

    #[tokio::test]
    async fn login_lists_every_user_and_announces_presence() {
        let router = router();
        register(&router, "alice", "pw1").await;
        register(&router, "bob", "pw2").await;

        let (mut alice, reply) = login(&router, "alice", "pw1").await;
        let contacts = contacts_of(&reply);
        let listed: Vec<(&str, bool)> = contacts
            .iter()
            .map(|p| (p.username.as_str(), p.online))
            .collect();
        assert_eq!(listed, vec![("alice", true), ("bob", false)]);
        assert!(history_of(&reply).is_empty());

        let (_bob, reply) = login(&router, "bob", "pw2").await;
        let contacts = contacts_of(&reply);
        assert!(contacts.iter().all(|p| p.online));

        assert_eq!(
            alice.drain(),
            vec![ServerEvent::presence("bob", Presence::Online)]
        );
        assert_eq!(router.registry().len().await, 2);
    }

    #[tokio::test]
    async fn message_reaches_live_receiver_after_persisting() {
        let router = router();
        register(&router, "alice", "pw1").await;
        register(&router, "bob", "pw2").await;
        let (mut alice, _) = login(&router, "alice", "pw1").await;
        let (mut bob, _) = login(&router, "bob", "pw2").await;
        alice.drain();

        alice
            .send(
                &router,
                r#"{"type":"message","sender":"alice","receiver":"bob","message_type":"text","content":"hi"}"#,
            )
            .await;

        let events = bob.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Message {
                sender, content, ..
            } => {
                assert_eq!(sender, "alice");
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(alice.drain().is_empty());

        let stored = router.db.get_conversation("alice", "bob").unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn offline_receiver_gets_messages_at_next_login() {
        let router = router();
        register(&router, "alice", "pw1").await;
        register(&router, "bob", "pw2").await;
        let (mut alice, _) = login(&router, "alice", "pw1").await;

        for text in ["first", "second", "third"] {
            alice
                .send(
                    &router,
                    &format!(
                        r#"{{"type":"message","receiver":"bob","message_type":"text","content":"{}"}}"#,
                        text
                    ),
                )
                .await;
        }
        assert!(alice.drain().is_empty());

        let (_bob, reply) = login(&router, "bob", "pw2").await;
        assert_eq!(history_of(&reply), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn message_validation_errors_are_reported() {
        let router = router();
        register(&router, "alice", "pw1").await;

        let mut anon = Client::connect();
        anon.send(
            &router,
            r#"{"type":"message","sender":"alice","receiver":"alice","message_type":"text","content":"x"}"#,
        )
        .await;
        assert_eq!(
            anon.drain(),
            vec![ServerEvent::Error {
                request: "message".into(),
                message: "Not logged in".into(),
            }]
        );

        let (mut alice, _) = login(&router, "alice", "pw1").await;
        alice
            .send(
                &router,
                r#"{"type":"message","receiver":"ghost","message_type":"text","content":"x"}"#,
            )
            .await;
        alice
            .send(
                &router,
                r#"{"type":"message","sender":"mallory","receiver":"alice","message_type":"text","content":"x"}"#,
            )
            .await;
        alice
            .send(
                &router,
                r#"{"type":"message","receiver":"alice","message_type":"image","content":"***"}"#,
            )
            .await;

        let reasons: Vec<String> = alice
            .drain()
            .into_iter()
            .map(|e| match e {
                ServerEvent::Error { message, .. } => message,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                "Unknown receiver",
                "Sender does not match the logged-in user",
                "Invalid image encoding",
            ]
        );
        assert!(router.db.get_user_history("alice").unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_marks_offline_and_notifies_peers() {
        let router = router();
        register(&router, "alice", "pw1").await;
        register(&router, "bob", "pw2").await;
        let (mut alice, _) = login(&router, "alice", "pw1").await;
        let (mut bob, _) = login(&router, "bob", "pw2").await;
        bob.drain();

        router.disconnect(&mut alice.ctx).await;

        assert_eq!(
            bob.drain(),
            vec![ServerEvent::presence("alice", Presence::Offline)]
        );
        assert!(!router.registry().contains("alice").await);
        let row = router.db.get_profile("alice").unwrap().unwrap();
        assert!(row.last_seen.is_some());

        // Disconnecting twice is harmless.
        router.disconnect(&mut alice.ctx).await;
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn second_login_replaces_the_first_session() {
        let router = router();
        register(&router, "alice", "pw1").await;
        register(&router, "bob", "pw2").await;

        let (mut first, _) = login(&router, "alice", "pw1").await;
        let (mut second, _) = login(&router, "alice", "pw1").await;
        let (mut bob, _) = login(&router, "bob", "pw2").await;
        first.drain();
        second.drain();

        assert_eq!(router.registry().len().await, 2);
        assert_eq!(
            router.registry().get("alice").await.unwrap().conn_id(),
            second.ctx.conn_id()
        );

        bob.send(
            &router,
            r#"{"type":"message","receiver":"alice","message_type":"text","content":"hey"}"#,
        )
        .await;
        assert!(first.drain().is_empty());
        assert_eq!(second.drain().len(), 1);

        // The displaced connection closing must not take alice offline.
        router.disconnect(&mut first.ctx).await;
        assert!(router.registry().contains("alice").await);
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn concurrent_logins_leave_one_session() {
        let router = router();
        register(&router, "alice", "pw1").await;

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                let (client, reply) = login(&router, "alice", "pw1").await;
                assert!(matches!(
                    reply,
                    ServerEvent::Login {
                        status: Status::Success,
                        ..
                    }
                ));
                client
            }));
        }
        let mut clients = Vec::new();
        for task in tasks {
            clients.push(task.await.unwrap());
        }

        let snapshot = router.registry().snapshot().await;
        assert_eq!(snapshot.len(), 1);
        let owner = snapshot[0].1.conn_id();
        assert!(clients.iter().any(|c| c.ctx.conn_id() == owner));
    }

    #[tokio::test]
    async fn status_only_update_keeps_other_fields() {
        let router = router();
        let mut c = Client::connect();
        c.send(
            &router,
            r#"{"type":"register","username":"alice","password":"pw1","display_name":"Alice","profile_image":"AQID"}"#,
        )
        .await;
        register(&router, "bob", "pw2").await;
        let (mut alice, _) = login(&router, "alice", "pw1").await;
        let (mut bob, _) = login(&router, "bob", "pw2").await;
        alice.drain();

        alice
            .send(
                &router,
                r#"{"type":"profile_update","username":"alice","status_message":"away"}"#,
            )
            .await;
        assert_eq!(
            alice.drain(),
            vec![ServerEvent::ProfileUpdateResult {
                status: Status::Success,
                message: None,
            }]
        );

        let events = bob.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::ProfileUpdate { username, profile } => {
                assert_eq!(username, "alice");
                assert_eq!(profile.status_message, "away");
                assert_eq!(profile.display_name, "Alice");
                assert_eq!(profile.profile_image.as_deref(), Some("AQID"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let row = router.db.get_profile("alice").unwrap().unwrap();
        assert_eq!(row.display_name, "Alice");
        assert_eq!(row.profile_image, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn profile_update_requires_own_live_session() {
        let router = router();
        register(&router, "alice", "pw1").await;
        register(&router, "bob", "pw2").await;

        let mut anon = Client::connect();
        anon.send(&router, r#"{"type":"profile_update","username":"alice","status_message":"x"}"#)
            .await;
        assert_eq!(
            anon.drain(),
            vec![ServerEvent::ProfileUpdateResult {
                status: Status::Error,
                message: Some("Not logged in".into()),
            }]
        );

        let (mut alice, _) = login(&router, "alice", "pw1").await;
        alice
            .send(&router, r#"{"type":"profile_update","username":"bob","status_message":"x"}"#)
            .await;
        alice
            .send(&router, r#"{"type":"profile_update","username":"alice"}"#)
            .await;
        let messages: Vec<Option<String>> = alice
            .drain()
            .into_iter()
            .map(|e| match e {
                ServerEvent::ProfileUpdateResult {
                    status: Status::Error,
                    message,
                } => message,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            messages,
            vec![
                Some("Cannot update another user's profile".to_string()),
                Some("No profile fields supplied".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn profile_request_returns_profile_without_side_effects() {
        let router = router();
        register(&router, "alice", "pw1").await;
        register(&router, "bob", "pw2").await;
        let (mut alice, _) = login(&router, "alice", "pw1").await;

        alice
            .send(&router, r#"{"type":"profile_request","requested_username":"bob"}"#)
            .await;
        alice
            .send(&router, r#"{"type":"profile_request","requested_username":"ghost"}"#)
            .await;

        let events = alice.drain();
        assert_eq!(events.len(), 2);
        match &events[0] {
            ServerEvent::ProfileData { profile } => {
                assert_eq!(profile.username, "bob");
                assert!(!profile.online);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            events[1],
            ServerEvent::Error {
                request: "profile_request".into(),
                message: "User not found".into(),
            }
        );
        assert_eq!(router.registry().len().await, 1);
    }

    #[tokio::test]
    async fn unread_counters_come_back_at_login() {
        let router = router();
        register(&router, "alice", "pw1").await;
        register(&router, "bob", "pw2").await;
        let (mut alice, _) = login(&router, "alice", "pw1").await;

        alice
            .send(
                &router,
                r#"{"type":"save_unread","username":"alice","unread_messages":{"bob":4}}"#,
            )
            .await;
        assert!(alice.drain().is_empty());
        router.disconnect(&mut alice.ctx).await;

        let (_, reply) = login(&router, "alice", "pw1").await;
        match reply {
            ServerEvent::Login {
                unread_messages: Some(unread),
                ..
            } => assert_eq!(unread.get("bob"), Some(&4)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn history_request_returns_one_conversation() {
        let router = router();
        for (name, pw) in [("alice", "pw1"), ("bob", "pw2"), ("carol", "pw3")] {
            register(&router, name, pw).await;
        }
        let (mut alice, _) = login(&router, "alice", "pw1").await;
        for (to, text) in [("bob", "to bob"), ("carol", "to carol")] {
            alice
                .send(
                    &router,
                    &format!(
                        r#"{{"type":"message","receiver":"{}","message_type":"text","content":"{}"}}"#,
                        to, text
                    ),
                )
                .await;
        }

        alice
            .send(&router, r#"{"type":"history_request","peer":"carol"}"#)
            .await;
        match alice.drain().as_slice() {
            [ServerEvent::History { peer, messages }] => {
                assert_eq!(peer, "carol");
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].content, "to carol");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsupported_message_kind_is_answered() {
        let router = router();
        register(&router, "alice", "pw1").await;
        let (mut alice, _) = login(&router, "alice", "pw1").await;

        alice
            .send(
                &router,
                r#"{"type":"message","receiver":"alice","message_type":"video","content":"x"}"#,
            )
            .await;
        assert_eq!(
            alice.drain(),
            vec![ServerEvent::Error {
                request: "message".into(),
                message: "Unsupported message_type: video".into(),
            }]
        );
        assert!(router.db.get_user_history("alice").unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failures_reply_generically_in_the_request_shape() {
        let router = router();
        register(&router, "alice", "pw1").await;
        let (mut alice, _) = login(&router, "alice", "pw1").await;

        router
            .db
            .with_conn(|conn| {
                conn.execute_batch(
                    "DROP TABLE chat_history; DROP TABLE unread_messages; DROP TABLE users;",
                )?;
                Ok(())
            })
            .unwrap();

        alice
            .send(&router, r#"{"type":"profile_update","status_message":"away"}"#)
            .await;
        alice
            .send(&router, r#"{"type":"history_request","peer":"bob"}"#)
            .await;
        assert_eq!(
            alice.drain(),
            vec![
                ServerEvent::ProfileUpdateResult {
                    status: Status::Error,
                    message: Some("Internal server error".into()),
                },
                ServerEvent::Error {
                    request: "history_request".into(),
                    message: "Internal server error".into(),
                },
            ]
        );

        let (late, reply) = login(&router, "alice", "pw1").await;
        assert_eq!(reply, ServerEvent::login_failed("Internal server error"));
        assert!(late.ctx.username().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn relogin_racing_old_disconnect_stays_consistent() {
        let router = router();
        register(&router, "alice", "pw1").await;
        register(&router, "bob", "pw2").await;
        let (mut bob, _) = login(&router, "bob", "pw2").await;
        let (mut current, _) = login(&router, "alice", "pw1").await;

        for step in 0..40u64 {
            bob.drain();

            let relogin = {
                let router = router.clone();
                tokio::spawn(async move { login(&router, "alice", "pw1").await.0 })
            };
            let teardown = {
                let router = router.clone();
                let mut old = current;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_micros(step * 250)).await;
                    router.disconnect(&mut old.ctx).await;
                })
            };
            current = relogin.await.unwrap();
            teardown.await.unwrap();

            let live = router.registry().get("alice").await.unwrap();
            assert_eq!(live.conn_id(), current.ctx.conn_id(), "step {}", step);

            let row = router.db.get_profile("alice").unwrap().unwrap();
            assert!(row.last_seen.is_none(), "step {}: stored as offline", step);

            let last_seen_by_bob = bob
                .drain()
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::StatusUpdate { username, status } if username == "alice" => {
                        Some(status)
                    }
                    _ => None,
                })
                .last();
            assert_eq!(last_seen_by_bob, Some(Presence::Online), "step {}", step);
        }
    }

    #[tokio::test]
    async fn unknown_type_gets_no_reply() {
        let router = router();
        let mut c = Client::connect();
        c.send(&router, r#"{"type":"typing","to":"bob"}"#).await;
        assert!(c.drain().is_empty());
    }

    #[tokio::test]
    async fn switching_accounts_releases_the_previous_one() {
        let router = router();
        for (name, pw) in [("alice", "pw1"), ("bob", "pw2"), ("carol", "pw3")] {
            register(&router, name, pw).await;
        }
        let (mut carol, _) = login(&router, "carol", "pw3").await;
        let (mut c, _) = login(&router, "alice", "pw1").await;
        carol.drain();

        c.send(&router, r#"{"type":"login","username":"bob","password":"pw2"}"#)
            .await;
        assert_eq!(c.ctx.username(), Some("bob"));
        assert!(!router.registry().contains("alice").await);
        assert_eq!(
            carol.drain(),
            vec![
                ServerEvent::presence("alice", Presence::Offline),
                ServerEvent::presence("bob", Presence::Online),
            ]
        );
    }
}
