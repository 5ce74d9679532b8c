//! Kubernetes Service watch feeding a [`RoutingTable`]
//!
//! Startup does one label-selected list; failing that is fatal because the
//! proxy would otherwise serve with an empty table. Afterwards a resuming
//! watch applies changes. Each relist (after a dropped watch) atomically
//! replaces the table so services deleted while disconnected disappear.
//! While the watch is down the last-known table keeps serving.

use crate::config::KubernetesConfig;
use crate::routing::{IdentityKind, RouteEvent, RoutingTable, ServiceInfo, ServiceKey};
use anyhow::Context;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Build a routing record from a Service, if it exposes a port
pub fn service_info(service: &Service, kind: IdentityKind) -> Option<ServiceInfo> {
    let name = service.metadata.name.as_deref()?;
    let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
    let port = service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .first()
        .and_then(|p| u16::try_from(p.port).ok())?;

    Some(ServiceInfo::from_labels(namespace, name, port, service.labels(), kind))
}

fn service_key(service: &Service) -> Option<ServiceKey> {
    let name = service.metadata.name.clone()?;
    let namespace = service.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    Some(ServiceKey::new(namespace, name))
}

/// Apply one watch event; returns whether the table changed.
///
/// `Init`..`InitDone` brackets a relist, collected in `relist` and swapped in
/// as a whole once complete.
fn apply_event(
    table: &RoutingTable,
    kind: IdentityKind,
    event: watcher::Event<Service>,
    relist: &mut Option<Vec<ServiceInfo>>,
) -> bool {
    match event {
        watcher::Event::Apply(service) => match service_info(&service, kind) {
            Some(info) => {
                let event = if table.get(&info.key()).is_some() {
                    RouteEvent::Update(info)
                } else {
                    RouteEvent::Add(info)
                };
                table.apply(event)
            }
            None => {
                // A service that lost its ports can no longer be routed to
                debug!(service = ?service.metadata.name, "Service without ports");
                service_key(&service)
                    .map(|key| table.apply(RouteEvent::Delete(key)))
                    .unwrap_or(false)
            }
        },
        watcher::Event::Delete(service) => service_key(&service)
            .map(|key| table.apply(RouteEvent::Delete(key)))
            .unwrap_or(false),
        watcher::Event::Init => {
            debug!("Service relist started");
            *relist = Some(Vec::new());
            false
        }
        watcher::Event::InitApply(service) => {
            if let Some(info) = service_info(&service, kind) {
                relist.get_or_insert_with(Vec::new).push(info);
            }
            false
        }
        watcher::Event::InitDone => match relist.take() {
            Some(infos) => {
                table.replace_all(infos);
                true
            }
            None => false,
        },
    }
}

/// Watches Services of one backend type
pub struct ServiceWatcher {
    api: Api<Service>,
    selector: String,
    kind: IdentityKind,
    table: Arc<RoutingTable>,
}

impl ServiceWatcher {
    pub fn new(
        client: Client,
        config: &KubernetesConfig,
        service_type: &str,
        kind: IdentityKind,
        table: Arc<RoutingTable>,
    ) -> Self {
        let api = match &config.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self {
            api,
            selector: config.label_selector(service_type),
            kind,
            table,
        }
    }

    /// Populate the table from a single list call
    pub async fn initial_sync(&self) -> anyhow::Result<usize> {
        let services = self
            .api
            .list(&ListParams::default().labels(&self.selector))
            .await
            .with_context(|| format!("failed to list services matching '{}'", self.selector))?;

        let infos: Vec<ServiceInfo> = services
            .items
            .iter()
            .filter_map(|svc| service_info(svc, self.kind))
            .collect();
        let count = infos.len();
        self.table.replace_all(infos);

        info!(selector = %self.selector, services = count, "Initial routing table loaded");
        Ok(count)
    }

    /// Follow the watch until shutdown, reconnecting with backoff on failure
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let config = watcher::Config::default().labels(&self.selector);
        let mut stream = watcher(self.api.clone(), config).default_backoff().boxed();
        let mut relist: Option<Vec<ServiceInfo>> = None;

        info!(selector = %self.selector, "Service watch started");

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        apply_event(&self.table, self.kind, event, &mut relist);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, selector = %self.selector, "Service watch failed, serving last-known routes");
                    }
                    None => {
                        warn!(selector = %self.selector, "Service watch stream ended");
                        break;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Service watch shutting down");
                        break;
                    }
                }
            }
        }
    }
}
