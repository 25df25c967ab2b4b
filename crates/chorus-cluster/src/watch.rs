//! Workbench watch subscription
//!
//! Streams Workbench events across all namespaces, decodes them and fans them
//! out to every registered handler in registration order. A failing handler
//! is logged and skipped; later handlers and later events are unaffected.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{ClusterWorkbench, CodecConfig};
use crate::crd::{Workbench, WORKBENCH_KIND};
use crate::error::ClusterError;
use crate::kind_resolver::KindResolver;

/// Error returned by a workbench event handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback for decoded workbench events
#[async_trait]
pub trait WorkbenchEventHandler: Send + Sync {
    /// Handle one decoded workbench
    async fn handle(&self, workbench: &ClusterWorkbench) -> Result<(), HandlerError>;
}

/// Which handler list an event is delivered to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// First sighting of a workbench
    Add,
    /// Change to a workbench already seen
    Update,
    /// Workbench removed
    Delete,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

type HandlerList = RwLock<Vec<Arc<dyn WorkbenchEventHandler>>>;

/// Ordered handler lists for add, update and delete events
#[derive(Default)]
pub struct WatchHandlers {
    on_add: HandlerList,
    on_update: HandlerList,
    on_delete: HandlerList,
}

impl WatchHandlers {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for newly seen workbenches
    pub fn on_add(&self, handler: Arc<dyn WorkbenchEventHandler>) {
        push(&self.on_add, handler);
    }

    /// Append a handler for updated workbenches
    pub fn on_update(&self, handler: Arc<dyn WorkbenchEventHandler>) {
        push(&self.on_update, handler);
    }

    /// Append a handler for deleted workbenches
    pub fn on_delete(&self, handler: Arc<dyn WorkbenchEventHandler>) {
        push(&self.on_delete, handler);
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Arc<dyn WorkbenchEventHandler>> {
        let list = match kind {
            EventKind::Add => &self.on_add,
            EventKind::Update => &self.on_update,
            EventKind::Delete => &self.on_delete,
        };
        list.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn push(list: &HandlerList, handler: Arc<dyn WorkbenchEventHandler>) {
    list.write()
        .unwrap_or_else(PoisonError::into_inner)
        .push(handler);
}

/// Turns raw watcher events into add/update/delete deliveries
///
/// A relist rebuilds the set of known objects, so objects deleted while the
/// watch was down are forgotten once the relist completes.
pub struct WatchDispatcher {
    handlers: Arc<WatchHandlers>,
    codec: CodecConfig,
    seen: HashSet<String>,
    relisted: Option<HashSet<String>>,
}

impl WatchDispatcher {
    /// Create a dispatcher that has seen nothing yet
    pub fn new(handlers: Arc<WatchHandlers>, codec: CodecConfig) -> Self {
        Self {
            handlers,
            codec,
            seen: HashSet::new(),
            relisted: None,
        }
    }

    /// Number of objects currently known
    pub fn known(&self) -> usize {
        self.seen.len()
    }

    /// Classify and deliver one watcher event
    pub async fn dispatch(&mut self, event: Event<DynamicObject>) {
        match event {
            Event::Apply(obj) => {
                let kind = self.observe(object_id(&obj));
                self.deliver(kind, obj).await;
            }
            Event::InitApply(obj) => {
                let id = object_id(&obj);
                if let Some(relisted) = &mut self.relisted {
                    relisted.insert(id.clone());
                }
                let kind = self.observe(id);
                self.deliver(kind, obj).await;
            }
            Event::Delete(obj) => {
                self.seen.remove(&object_id(&obj));
                self.deliver(EventKind::Delete, obj).await;
            }
            Event::Init => {
                debug!("workbench watch (re)listing");
                self.relisted = Some(HashSet::new());
            }
            Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    let dropped = self.seen.difference(&relisted).count();
                    self.seen = relisted;
                    debug!(known = self.seen.len(), dropped, "workbench watch list done");
                }
            }
        }
    }

    fn observe(&mut self, id: String) -> EventKind {
        if self.seen.insert(id) {
            EventKind::Add
        } else {
            EventKind::Update
        }
    }

    async fn deliver(&self, kind: EventKind, obj: DynamicObject) {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_default();

        let workbench = match decode(&self.codec, obj) {
            Ok(wb) => wb,
            Err(e) => {
                error!(
                    event = kind.as_str(),
                    namespace = %namespace,
                    workbench = %name,
                    error = %e,
                    "failed to decode workbench event"
                );
                return;
            }
        };

        debug!(event = kind.as_str(), namespace = %namespace, workbench = %name, "workbench event");
        for (index, handler) in self.handlers.snapshot(kind).iter().enumerate() {
            if let Err(e) = handler.handle(&workbench).await {
                error!(
                    event = kind.as_str(),
                    handler = index,
                    namespace = %namespace,
                    workbench = %name,
                    error = %e,
                    "workbench event handler failed"
                );
            }
        }
    }
}

fn object_id(obj: &DynamicObject) -> String {
    obj.metadata
        .uid
        .clone()
        .unwrap_or_else(|| format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any()))
}

fn decode(codec: &CodecConfig, obj: DynamicObject) -> Result<ClusterWorkbench, ClusterError> {
    let value = serde_json::to_value(obj).map_err(|e| ClusterError::serialization(WORKBENCH_KIND, e))?;
    let resource: Workbench =
        serde_json::from_value(value).map_err(|e| ClusterError::serialization(WORKBENCH_KIND, e))?;
    codec.from_cluster_workbench(&resource)
}

/// Watch Workbench resources in every namespace until cancelled
pub async fn run_workbench_watch(
    client: Client,
    resolver: Arc<dyn KindResolver>,
    handlers: Arc<WatchHandlers>,
    codec: CodecConfig,
    cancel: CancellationToken,
) -> Result<(), ClusterError> {
    let ar = resolver
        .resolve(WORKBENCH_KIND)
        .await
        .ok_or_else(|| ClusterError::KindNotFound {
            kind: WORKBENCH_KIND.to_string(),
        })?;

    let api: Api<DynamicObject> = Api::all_with(client, &ar);
    let mut stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut dispatcher = WatchDispatcher::new(handlers, CodecConfig::default());

    info!(api_version = %ar.api_version, "starting workbench watch");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => dispatcher.dispatch(event).await,
                Some(Err(e)) => warn!(error = %e, "workbench watch error"),
                None => {
                    warn!("workbench watch stream ended");
                    break;
                }
            },
        }
    }
    info!("workbench watch stopped");
    Ok(())
}
