/*
    session - One peer connection served by one dispatcher

    The Session is the dispatcher state: it owns the property store of
    every component, the queue of outgoing API calls and the responses
    that arrived for calls still waiting. It only ever runs on the
    dispatcher owner thread.

    SessionHandle is the thread-safe side. Inbound bytes are decoded on
    the receiving thread and turned into work units:
    - property updates run at the default level
    - call responses and errors run at the API-call level, so they get
      through while a call is suspended
*/

mod message;
mod transport;

pub use message::{Incoming, Outgoing, PeerCall};
pub use transport::{Transport, TransportError};

use serde_json::Value as JsonValue;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SessionConfig, SyncConfig};
use crate::dispatcher::{
    DispatchContext, DispatchError, DispatcherHandle, EventDispatcher, Level, EVENT_LEVEL_DEFAULT,
    EVENT_LEVEL_SYNC_API_CALL,
};
use crate::error::{SyncError, SyncResult};
use crate::store::PropertyStore;
use crate::types::TypeRegistry;
use crate::wire;

/// Failure of a session operation that may involve the dispatcher
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type SessionResult<T> = Result<T, SessionError>;

pub struct Session {
    id: Uuid,
    config: SessionConfig,
    transport: Box<dyn Transport>,
    components: BTreeMap<String, PropertyStore>,
    hidden: BTreeSet<(String, String)>,
    outgoing_calls: Vec<PeerCall>,
    responses: HashMap<u64, JsonValue>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("outgoing_calls", &self.outgoing_calls.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: SessionConfig, transport: impl Transport + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            transport: Box::new(transport),
            components: BTreeMap::new(),
            hidden: BTreeSet::new(),
            outgoing_calls: Vec::new(),
            responses: HashMap::new(),
        }
    }

    /// Start a dispatcher whose state is a new session
    ///
    /// `setup` runs on the owner thread before any unit, typically to
    /// register components. If it fails the dispatcher is shut down and
    /// its error returned.
    pub fn start<F>(
        config: &SyncConfig,
        transport: impl Transport + 'static,
        setup: F,
    ) -> SessionResult<SessionHandle>
    where
        F: FnOnce(&mut Session) -> SyncResult<()> + Send + 'static,
    {
        let session_config = config.session.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let dispatcher = EventDispatcher::new(config.dispatcher.clone()).start(move |_| {
            let mut session = Session::new(session_config, transport);
            let result = setup(&mut session);
            match &result {
                Ok(()) => {
                    info!(session = %session.id, components = session.components.len(), "session ready")
                }
                Err(err) => warn!(session = %session.id, %err, "session setup failed"),
            }
            let _ = ready_tx.send(result);
            session
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(SessionHandle { dispatcher }),
            Ok(Err(err)) => {
                dispatcher.shutdown();
                Err(SessionError::Sync(err))
            }
            // setup panicked and the dispatcher already stopped
            Err(_) => Err(SessionError::Dispatch(DispatchError::ShutDown)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a component; its store is attached right away
    pub fn add_component(&mut self, name: impl Into<String>, registry: Arc<dyn TypeRegistry>) -> &mut PropertyStore {
        let name = name.into();
        let mut store = PropertyStore::new(registry);
        store.attach();
        debug!(session = %self.id, component = %name, "component added");
        match self.components.entry(name) {
            Entry::Occupied(mut slot) => {
                slot.insert(store).detach();
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(store),
        }
    }

    /// Drop a component after detaching its values
    pub fn remove_component(&mut self, name: &str) -> SyncResult<PropertyStore> {
        let mut store = self
            .components
            .remove(name)
            .ok_or_else(|| SyncError::UnknownComponent(name.to_string()))?;
        store.detach();
        self.hidden.retain(|(component, _)| component != name);
        Ok(store)
    }

    pub fn component(&self, name: &str) -> SyncResult<&PropertyStore> {
        self.components
            .get(name)
            .ok_or_else(|| SyncError::UnknownComponent(name.to_string()))
    }

    pub fn component_mut(&mut self, name: &str) -> SyncResult<&mut PropertyStore> {
        self.components
            .get_mut(name)
            .ok_or_else(|| SyncError::UnknownComponent(name.to_string()))
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Hidden properties stay dirty until they become visible again
    pub fn set_visible(&mut self, component: &str, property: &str, visible: bool) {
        let key = (component.to_string(), property.to_string());
        if visible {
            self.hidden.remove(&key);
        } else {
            self.hidden.insert(key);
        }
    }

    pub fn is_visible(&self, component: &str, property: &str) -> bool {
        !self
            .hidden
            .contains(&(component.to_string(), property.to_string()))
    }

    /// Queue a call for the next flush
    pub fn queue_call(&mut self, call: PeerCall) {
        debug!(session = %self.id, id = call.id, component = %call.component, method = %call.method, "call queued");
        self.outgoing_calls.push(call);
    }

    /// Collect pending changes and calls into one message
    pub fn take_outgoing(&mut self) -> Outgoing {
        let mut outgoing = Outgoing::default();
        let hidden = &self.hidden;
        for (name, store) in self.components.iter_mut() {
            let visible = |property: &str| !hidden.contains(&(name.clone(), property.to_string()));
            outgoing.add_changes(name, store.read_and_clear_changes(&visible));
        }
        outgoing.calls = std::mem::take(&mut self.outgoing_calls);
        outgoing
    }

    /// Send everything pending; false if there was nothing to send
    pub fn flush(&mut self) -> SyncResult<bool> {
        let outgoing = self.take_outgoing();
        if outgoing.is_empty() {
            return Ok(false);
        }
        let bytes = wire::encode(&outgoing)?;
        debug!(
            session = %self.id,
            components = outgoing.changes.len(),
            calls = outgoing.calls.len(),
            bytes = bytes.len(),
            "flushing to peer"
        );
        self.transport.send(bytes)?;
        Ok(true)
    }

    /// Apply one property update from the peer
    ///
    /// A refused update is not an error here: the store already scheduled
    /// a resend of the server value.
    pub fn apply_update(&mut self, component: &str, property: &str, value: JsonValue) -> SyncResult<()> {
        let session = self.id;
        let store = self.component_mut(component)?;
        match store.apply_client_update(property, value) {
            Ok(outcome) => {
                if !outcome.is_clean() {
                    debug!(%session, component, property, denied = ?outcome.denied, conflict = outcome.conflict, "peer update partially applied");
                }
                Ok(())
            }
            Err(SyncError::AccessDenied { property, reason }) => {
                warn!(%session, component, %property, %reason, "peer update denied, resending");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn flush_if_configured(&mut self) -> SyncResult<()> {
        if self.config.flush_after_each_unit {
            self.flush()?;
        }
        Ok(())
    }

    /// Invoke `method` on the peer and wait for its result
    ///
    /// The call is flushed immediately; while waiting only units at
    /// `EVENT_LEVEL_SYNC_API_CALL` or above run. `None` uses the
    /// session's `api_call_timeout`.
    pub fn call_peer(
        ctx: &DispatchContext<Session>,
        component: &str,
        method: &str,
        args: Vec<JsonValue>,
        timeout: Option<Duration>,
    ) -> SessionResult<JsonValue> {
        let id = ctx.next_suspend_id();
        let call = PeerCall {
            id,
            component: component.to_string(),
            method: method.to_string(),
            args,
        };
        let timeout = ctx.with_state(|session| -> SyncResult<Duration> {
            session.component(component)?;
            session.queue_call(call);
            session.flush()?;
            Ok(timeout.unwrap_or(session.config.api_call_timeout))
        })??;

        if let Err(err) = ctx.suspend(id, EVENT_LEVEL_SYNC_API_CALL, Some(timeout)) {
            warn!(id, component, method, %err, "peer call failed");
            ctx.with_state(|session| session.responses.remove(&id))?;
            return Err(err.into());
        }

        ctx.with_state(|session| session.responses.remove(&id))?
            .ok_or_else(|| SyncError::MalformedUpdate(format!("call {} resumed without a result", id)).into())
    }

    fn deliver_response(ctx: &DispatchContext<Session>, id: u64, result: JsonValue) -> anyhow::Result<()> {
        if !ctx.is_waiting(id) {
            warn!(id, "response for a call nobody waits on, dropping");
            return Ok(());
        }
        ctx.with_state(|session| session.responses.insert(id, result))?;
        ctx.resume(id);
        Ok(())
    }

    fn deliver_error(ctx: &DispatchContext<Session>, id: u64, message: String) -> anyhow::Result<()> {
        if !ctx.is_waiting(id) {
            warn!(id, %message, "error for a call nobody waits on, dropping");
            return Ok(());
        }
        ctx.cancel(id, message);
        Ok(())
    }
}

/// Thread-safe handle to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    dispatcher: DispatcherHandle<Session>,
}

impl SessionHandle {
    pub fn dispatcher(&self) -> &DispatcherHandle<Session> {
        &self.dispatcher
    }

    /// Route bytes received from the peer
    ///
    /// Undecodable input is rejected here, before anything is queued.
    pub fn receive(&self, bytes: &[u8]) -> SessionResult<()> {
        let message: Incoming = wire::decode(bytes)?;
        let level = Self::level_of(&message);
        self.dispatcher.submit(level, move |ctx| match message {
            Incoming::Update {
                component,
                property,
                value,
            } => {
                ctx.with_state(|session| -> SyncResult<()> {
                    session.apply_update(&component, &property, value)?;
                    session.flush_if_configured()
                })??;
                Ok(())
            }
            Incoming::Response { id, result } => Session::deliver_response(ctx, id, result),
            Incoming::Error { id, message } => Session::deliver_error(ctx, id, message),
        })?;
        Ok(())
    }

    fn level_of(message: &Incoming) -> Level {
        match message.call_id() {
            Some(_) => EVENT_LEVEL_SYNC_API_CALL,
            None => EVENT_LEVEL_DEFAULT,
        }
    }

    /// Run server-side logic against the session, flushing afterwards when
    /// the session is configured to
    pub fn execute<F>(&self, f: F) -> SessionResult<()>
    where
        F: FnOnce(&mut Session) -> SyncResult<()> + Send + 'static,
    {
        self.dispatcher.submit(EVENT_LEVEL_DEFAULT, move |ctx| {
            ctx.with_state(|session| -> SyncResult<()> {
                f(session)?;
                session.flush_if_configured()
            })??;
            Ok(())
        })?;
        Ok(())
    }

    /// Run a unit with the full dispatch context, e.g. one that calls
    /// [`Session::call_peer`]
    pub fn submit<F>(&self, level: Level, unit: F) -> SessionResult<()>
    where
        F: FnOnce(&DispatchContext<Session>) -> anyhow::Result<()> + Send + 'static,
    {
        self.dispatcher.submit(level, unit)?;
        Ok(())
    }

    /// Send whatever is pending regardless of configuration
    pub fn flush(&self) -> SessionResult<()> {
        self.execute(|session| session.flush().map(|_| ()))
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessLevel;
    use crate::test_utils::{sample_registry, RecordingTransport};
    use serde_json::json;

    fn session() -> (Session, RecordingTransport) {
        let transport = RecordingTransport::new();
        let mut session = Session::new(SessionConfig::default(), transport.clone());
        session.add_component("grid", sample_registry());
        (session, transport)
    }

    #[test]
    fn test_flush_groups_changes_by_component() {
        let (mut session, transport) = session();
        session.component_mut("grid").unwrap().set("title", "Orders").unwrap();

        assert!(session.flush().unwrap());
        assert_eq!(
            transport.messages(),
            vec![json!({
                "changes": {"grid": {"title": "Orders"}},
                "types": {"grid": {"title": "string"}}
            })]
        );
        assert!(!session.flush().unwrap());
        assert_eq!(transport.len(), 1);
    }

    #[test]
    fn test_hidden_property_waits_until_visible() {
        let (mut session, transport) = session();
        session.set_visible("grid", "title", false);
        session.component_mut("grid").unwrap().set("title", "Orders").unwrap();

        assert!(!session.flush().unwrap());
        session.set_visible("grid", "title", true);
        assert!(session.flush().unwrap());
        assert_eq!(transport.messages()[0]["changes"]["grid"]["title"], json!("Orders"));
    }

    #[test]
    fn test_denied_update_is_resent() {
        let (mut session, transport) = session();
        session.component_mut("grid").unwrap().set("status", "ready").unwrap();
        session.flush().unwrap();

        session.apply_update("grid", "status", json!("hacked")).unwrap();
        assert_eq!(session.component("grid").unwrap().get("status").unwrap(), json!("ready"));
        session.flush().unwrap();
        assert_eq!(transport.messages()[1]["changes"]["grid"]["status"], json!("ready"));
    }

    #[test]
    fn test_unknown_component() {
        let (mut session, _) = session();
        assert_eq!(
            session.apply_update("chart", "title", json!("x")),
            Err(SyncError::UnknownComponent("chart".to_string()))
        );
        assert!(session.remove_component("chart").is_err());
        assert!(session.remove_component("grid").unwrap().registry().describe("title").is_some());
    }

    #[test]
    fn test_sample_registry_levels() {
        let (session, _) = session();
        let store = session.component("grid").unwrap();
        assert!(store.check_client_mutation_allowed("title").is_ok());
        assert!(store.check_client_mutation_allowed("status").is_err());
        assert_eq!(
            store.registry().describe("rows").unwrap().ty.access,
            Some(AccessLevel::Deep)
        );
    }
}
