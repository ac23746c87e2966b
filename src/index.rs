use crate::{
    gateway::{Gateway, Server},
    policy::{PeerMethod, Policy},
    validation::Validated,
};
use ahash::AHashMap;
use anyhow::{anyhow, Result};
use futures::TryFutureExt;
use istio_config_k8s_api as api;
use kubert::client::api::ListParams;
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, future::Future, sync::Arc};
use tokio::time::{Duration, Instant};
use tracing::Instrument;

/// Holds every indexed `Gateway` and `Policy`, by namespace.
///
/// Resources are validated and compiled once, as they are applied, and are
/// shared read-only with every lookup.
#[derive(Clone, Debug, Default)]
pub struct Index {
    index: Arc<RwLock<LockedIndex>>,
}

#[derive(Debug)]
struct LockedIndex {
    namespaces: AHashMap<String, Namespace>,
    changed: Instant,
}

#[derive(Debug, Default)]
struct Namespace {
    gateways: AHashMap<String, Arc<Gateway>>,
    policies: AHashMap<String, Arc<Policy>>,
}

impl Index {
    pub fn spawn_index_tasks(&self, rt: &mut kubert::Runtime) -> impl Future<Output = Result<()>> {
        let gateways = self.index_resource::<api::Gateway>(rt);
        let policies = self.index_resource::<api::Policy>(rt);
        async move {
            tokio::try_join! {
                gateways, policies,
            }
            .map(|_| ())
        }
    }

    fn index_resource<R>(&self, rt: &mut kubert::Runtime) -> impl Future<Output = Result<()>>
    where
        R: kube::Resource + serde::de::DeserializeOwned + Clone + std::fmt::Debug + Send + 'static,
        R::DynamicType: Default,
        LockedIndex: kubert::index::IndexNamespacedResource<R>,
    {
        let kind = R::kind(&Default::default()).to_string();
        let watch = rt.watch_all::<R>(ListParams::default());
        let index = kubert::index::namespaced(self.index.clone(), watch)
            .instrument(tracing::info_span!("index", %kind));
        let join = tokio::spawn(index);
        tracing::info!("started {kind} indexing");
        join.map_err(move |err| anyhow!("index task for {kind}s failed: {err}"))
    }

    /// Returns the servers of the gateway `gateway_ns/gateway_name` to which a
    /// virtual service host in `candidate_ns` may bind.
    pub fn bind(
        &self,
        gateway_ns: &str,
        gateway_name: &str,
        candidate_ns: &str,
        host: &str,
    ) -> Vec<Server> {
        let index = self.index.read();
        let gateway = match index
            .namespaces
            .get(gateway_ns)
            .and_then(|ns| ns.gateways.get(gateway_name))
        {
            Some(gw) => gw.clone(),
            None => return Vec::new(),
        };
        drop(index);

        let servers = gateway
            .servers_for(candidate_ns, host)
            .cloned()
            .collect::<Vec<_>>();
        tracing::debug!(
            gateway.ns = %gateway_ns,
            gateway.name = %gateway_name,
            %candidate_ns,
            %host,
            servers = servers.len(),
            "bound host"
        );
        servers
    }

    /// Returns the policies in `ns` that select the given service port,
    /// ordered by name.
    pub fn policies_for(
        &self,
        ns: &str,
        service: &str,
        port: u16,
        port_name: Option<&str>,
    ) -> Vec<Arc<Policy>> {
        let index = self.index.read();
        let mut policies = index
            .namespaces
            .get(ns)
            .into_iter()
            .flat_map(|ns| ns.policies.values())
            .filter(|p| p.selects(service, port, port_name))
            .cloned()
            .collect::<Vec<_>>();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    /// Checks whether a request to `path` on the given service port must
    /// carry a valid origin JWT.
    pub fn jwt_required(
        &self,
        ns: &str,
        service: &str,
        port: u16,
        port_name: Option<&str>,
        path: &str,
    ) -> bool {
        self.policies_for(ns, service, port, port_name)
            .iter()
            .any(|p| p.origin_required(path))
    }

    pub fn dump_index(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        tracing::debug!(?every, "dumping index changes");
        let index = self.index.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            let mut last_changed = index.read().changed;
            loop {
                interval.tick().await;
                let index = index.read();
                if index.changed_since(last_changed) {
                    use comfy_table::{presets::UTF8_FULL, *};
                    let mut gateways = Table::new();
                    gateways
                        .load_preset(UTF8_FULL)
                        .set_content_arrangement(ContentArrangement::Dynamic)
                        .set_header(Row::from(vec![
                            "NAMESPACE", "GATEWAY", "PORT", "PROTOCOL", "HOSTS", "TLS",
                        ]));
                    let mut policies = Table::new();
                    policies
                        .load_preset(UTF8_FULL)
                        .set_content_arrangement(ContentArrangement::Dynamic)
                        .set_header(Row::from(vec![
                            "NAMESPACE",
                            "POLICY",
                            "TARGETS",
                            "PEERS",
                            "ORIGINS",
                            "BINDING",
                        ]));

                    for (ns_name, ns) in &index.namespaces {
                        for (name, gw) in &ns.gateways {
                            for srv in &gw.servers {
                                let hosts = srv
                                    .hosts
                                    .iter()
                                    .map(ToString::to_string)
                                    .collect::<Vec<_>>()
                                    .join("\n");
                                let tls = srv
                                    .tls
                                    .as_ref()
                                    .and_then(|tls| tls.mode)
                                    .map(|mode| mode.to_string())
                                    .unwrap_or_default();
                                gateways.add_row(Row::from(vec![
                                    Cell::new(ns_name),
                                    Cell::new(name),
                                    Cell::new(srv.port.number),
                                    Cell::new(srv.port.protocol),
                                    Cell::new(hosts),
                                    Cell::new(tls),
                                ]));
                            }
                        }

                        for (name, policy) in &ns.policies {
                            let targets = if policy.targets.is_empty() {
                                "*".to_string()
                            } else {
                                policy
                                    .targets
                                    .iter()
                                    .map(|t| t.service.as_str())
                                    .collect::<Vec<_>>()
                                    .join("\n")
                            };
                            let peers = policy
                                .peers
                                .iter()
                                .map(|peer| match peer {
                                    PeerMethod::Mtls(mode) => format!("mtls: {mode:?}"),
                                    PeerMethod::Jwt(_) => "jwt".to_string(),
                                })
                                .collect::<Vec<_>>()
                                .join("\n");
                            let origins = policy
                                .origins
                                .iter()
                                .map(|jwt| {
                                    format!(
                                        "{} ({} rules)",
                                        jwt.issuer.as_deref().unwrap_or("-"),
                                        jwt.trigger_rules.len()
                                    )
                                })
                                .collect::<Vec<_>>()
                                .join("\n");
                            policies.add_row(Row::from(vec![
                                Cell::new(ns_name),
                                Cell::new(name),
                                Cell::new(targets),
                                Cell::new(peers),
                                Cell::new(origins),
                                Cell::new(format!("{:?}", policy.principal_binding)),
                            ]));
                        }
                    }
                    println!("{gateways}\n{policies}");
                    last_changed = index.changed;
                }
            }
        })
    }
}

// === impl LockedIndex ===

impl Default for LockedIndex {
    fn default() -> Self {
        Self {
            namespaces: AHashMap::new(),
            changed: Instant::now(),
        }
    }
}

impl LockedIndex {
    fn changed_since(&self, since: Instant) -> bool {
        self.changed > since
    }

    fn apply_gateway(&mut self, gw: api::Gateway) {
        let Validated { value, errors } = match Gateway::from_resource(gw) {
            Ok(validated) => validated,
            Err(error) => {
                tracing::warn!(%error, "ignoring Gateway");
                return;
            }
        };
        let _span = tracing::info_span!("apply", ns = %value.namespace, name = %value.name)
            .entered();
        for error in errors {
            tracing::warn!(%error, "invalid Gateway configuration");
        }

        let ns = self.namespaces.entry(value.namespace.clone()).or_default();
        if update(&mut ns.gateways, value.name.clone(), value) {
            self.changed = Instant::now();
        }
    }

    fn apply_policy(&mut self, policy: api::Policy) {
        let Validated { value, errors } = match Policy::from_resource(policy) {
            Ok(validated) => validated,
            Err(error) => {
                tracing::warn!(%error, "ignoring Policy");
                return;
            }
        };
        let _span = tracing::info_span!("apply", ns = %value.namespace, name = %value.name)
            .entered();
        for error in errors {
            tracing::warn!(%error, "invalid Policy configuration");
        }

        let ns = self.namespaces.entry(value.namespace.clone()).or_default();
        if update(&mut ns.policies, value.name.clone(), value) {
            self.changed = Instant::now();
        }
    }

    fn ns_with_remove(&mut self, namespace: String, f: impl FnOnce(&mut Namespace) -> bool) {
        if let Entry::Occupied(mut ns) = self.namespaces.entry(namespace) {
            if f(ns.get_mut()) {
                if ns.get().gateways.is_empty() && ns.get().policies.is_empty() {
                    tracing::debug!("namespace has no more resources; removing it");
                    ns.remove();
                }
                self.changed = Instant::now();
            }
        } else {
            tracing::debug!("tried to delete a resource in a namespace that does not exist!");
        }
    }
}

/// Returns true if the index changed.
fn update<T: PartialEq + std::fmt::Debug>(
    resources: &mut AHashMap<String, Arc<T>>,
    name: String,
    resource: T,
) -> bool {
    match resources.entry(name) {
        Entry::Vacant(entry) => {
            tracing::debug!(?resource, "adding to index");
            entry.insert(Arc::new(resource));
        }
        Entry::Occupied(mut entry) => {
            if **entry.get() == resource {
                tracing::debug!("no changes");
                return false;
            }
            tracing::debug!(?resource, "updating");
            entry.insert(Arc::new(resource));
        }
    }
    true
}

impl kubert::index::IndexNamespacedResource<api::Gateway> for LockedIndex {
    fn apply(&mut self, gw: api::Gateway) {
        self.apply_gateway(gw)
    }

    #[tracing::instrument(name = "delete", skip(self), fields(%ns, %name))]
    fn delete(&mut self, ns: String, name: String) {
        self.ns_with_remove(ns, |ns| ns.gateways.remove(&name).is_some());
    }

    fn reset(&mut self, gws: Vec<api::Gateway>, removed: kubert::index::NamespacedRemoved) {
        let _span = tracing::info_span!("reset", kind = "Gateway").entered();
        for gw in gws.into_iter() {
            self.apply_gateway(gw);
        }
        for (ns, names) in removed.into_iter() {
            self.ns_with_remove(ns, |ns| {
                names
                    .iter()
                    .fold(false, |changed, name| ns.gateways.remove(name).is_some() || changed)
            });
        }
    }
}

impl kubert::index::IndexNamespacedResource<api::Policy> for LockedIndex {
    fn apply(&mut self, policy: api::Policy) {
        self.apply_policy(policy)
    }

    #[tracing::instrument(name = "delete", skip(self), fields(%ns, %name))]
    fn delete(&mut self, ns: String, name: String) {
        self.ns_with_remove(ns, |ns| ns.policies.remove(&name).is_some());
    }

    fn reset(&mut self, policies: Vec<api::Policy>, removed: kubert::index::NamespacedRemoved) {
        let _span = tracing::info_span!("reset", kind = "Policy").entered();
        for policy in policies.into_iter() {
            self.apply_policy(policy);
        }
        for (ns, names) in removed.into_iter() {
            self.ns_with_remove(ns, |ns| {
                names
                    .iter()
                    .fold(false, |changed, name| ns.policies.remove(name).is_some() || changed)
            });
        }
    }
}
