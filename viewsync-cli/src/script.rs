//! Replay scripts: component declarations plus a list of steps fed through
//! a real session, collecting every message the session sends to the peer

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{mpsc, Arc};
use tracing::debug;
use viewsync_core::config::SyncConfig;
use viewsync_core::types::{PropertyDescription, StaticTypeRegistry};
use viewsync_core::{Session, EVENT_LEVEL_DEFAULT};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Script {
    /// Component name to its property declarations
    #[serde(default)]
    pub components: BTreeMap<String, Vec<PropertyDescription>>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Server-side assignment
    Set {
        component: String,
        property: String,
        value: JsonValue,
    },
    /// Bytes arriving from the peer
    Receive { message: JsonValue },
    Hide { component: String, property: String },
    Show { component: String, property: String },
    Flush,
}

impl Script {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid replay script")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
        Self::parse(&raw)
    }

    fn registries(&self) -> Vec<(String, StaticTypeRegistry)> {
        self.components
            .iter()
            .map(|(name, descriptions)| {
                let mut registry = StaticTypeRegistry::new();
                for description in descriptions {
                    registry.insert(description.clone());
                }
                (name.clone(), registry)
            })
            .collect()
    }
}

/// Run every step and return the decoded outgoing messages in send order
pub fn replay(script: Script, config: &SyncConfig) -> Result<Vec<JsonValue>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let registries = script.registries();
    let handle = Session::start(config, tx, move |session| {
        for (name, registry) in registries {
            session.add_component(name, Arc::new(registry));
        }
        Ok(())
    })?;

    for (index, step) in script.steps.into_iter().enumerate() {
        debug!(index, ?step, "replaying step");
        match step {
            Step::Set {
                component,
                property,
                value,
            } => handle.execute(move |session| {
                session.component_mut(&component)?.set(&property, value)?;
                Ok(())
            })?,
            Step::Receive { message } => handle.receive(&serde_json::to_vec(&message)?)?,
            Step::Hide { component, property } => handle.execute(move |session| {
                session.set_visible(&component, &property, false);
                Ok(())
            })?,
            Step::Show { component, property } => handle.execute(move |session| {
                session.set_visible(&component, &property, true);
                Ok(())
            })?,
            Step::Flush => handle.flush()?,
        }
    }

    // shutdown drops queued units, so wait for the last step first
    let (done_tx, done_rx) = mpsc::channel();
    handle.submit(EVENT_LEVEL_DEFAULT, move |_| {
        done_tx.send(())?;
        Ok(())
    })?;
    done_rx
        .recv_timeout(config.session.api_call_timeout)
        .context("replay did not finish")?;
    handle.shutdown();

    rx.try_iter()
        .map(|bytes| serde_json::from_slice(&bytes).context("session sent invalid JSON"))
        .collect()
}
