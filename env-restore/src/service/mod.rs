//! Live services: where a service's RPC endpoint listens and where restore
//! files are staged for it.

pub mod rpc;

use crate::access::{self, SharedAccess};
use crate::archive::ParentRef;
use crate::location::{Location, ServiceLocation};
use crate::utils::errors::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use tracing::debug;

/// Physical `host:port` a service answers RPCs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One logical service, possibly a single replica of a statefulset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub location: ServiceLocation,
    pub parent: Option<ParentRef>,
}

impl Service {
    pub fn new(name: impl Into<String>, location: ServiceLocation) -> Self {
        Self {
            name: name.into(),
            location,
            parent: None,
        }
    }

    pub fn from_spec(name: impl Into<String>, spec: &str) -> Result<Self> {
        Ok(Self::new(name, ServiceLocation::parse(spec)?))
    }

    /// Directory (or template) restore files are staged into.
    pub fn stage(&self) -> &Location {
        &self.location.stage
    }

    pub fn is_stateful_set(&self) -> bool {
        self.location.stage.is_stateful_set()
    }

    /// Per-replica service of a statefulset service.
    pub fn pod_service(&self, replica: usize) -> Result<Service> {
        let Location::StatefulSet { set, .. } = &self.location.stage else {
            return Err(Error::Configuration(format!(
                "service {} ({}) is not a statefulset",
                self.name, self.location
            )));
        };

        Ok(Service {
            name: self.name.clone(),
            location: self.location.pod_location(replica)?,
            parent: Some(ParentRef {
                name: self.name.clone(),
                set: set.name.clone(),
                replica,
            }),
        })
    }

    /// Where this service's RPCs go. Pods are addressed through cluster DNS;
    /// statefulset replicas through their headless service.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let host = match &self.location.stage {
            Location::Local { .. } => "127.0.0.1".to_string(),
            Location::Host { host, .. } => host.clone(),
            Location::Pod { pod, .. } => match &self.parent {
                Some(parent) => format!("{}.{}.{}", pod.name, parent.set, pod.namespace),
                None => format!("{}.{}", pod.name, pod.namespace),
            },
            Location::StatefulSet { .. } => {
                return Err(Error::Configuration(format!(
                    "service {} is a statefulset; expand it before addressing replicas",
                    self.name
                )))
            }
        };
        Ok(Endpoint {
            host,
            port: self.location.port,
        })
    }

    /// Concrete services behind this one: itself, or one per live replica.
    pub async fn expand(&self, remote: &SharedAccess) -> Result<Vec<Service>> {
        let Location::StatefulSet { set, .. } = &self.location.stage else {
            return Ok(vec![self.clone()]);
        };

        let replicas = access::require(remote, &self.location.stage)?
            .replica_count(set)
            .await?;
        if replicas == 0 {
            return Err(Error::lookup(
                &self.location.stage,
                "statefulset has no live replicas",
            ));
        }
        debug!("Expanded statefulset service {} into {} replicas", self.name, replicas);
        (0..replicas).map(|replica| self.pod_service(replica)).collect()
    }
}

/// The live services of one environment.
#[derive(Debug, Clone, Default)]
pub struct ServiceSet {
    services: Vec<Service>,
}

impl ServiceSet {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    /// Build from `name -> spec` pairs. Any malformed spec fails the whole set.
    pub fn from_specs(specs: &BTreeMap<String, String>) -> Result<Self> {
        let services = specs
            .iter()
            .map(|(name, spec)| Service::from_spec(name.clone(), spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(services))
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Only the named services. Every name must be present.
    pub fn restrict_to<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> Result<ServiceSet> {
        let wanted: HashSet<&str> = names.into_iter().collect();
        if let Some(missing) = wanted.iter().find(|name| self.service(name).is_none()) {
            return Err(Error::Configuration(format!(
                "no service named {missing:?} in the destination environment"
            )));
        }

        Ok(Self::new(
            self.services
                .iter()
                .filter(|s| wanted.contains(s.name.as_str()))
                .cloned()
                .collect(),
        ))
    }

    /// Replace statefulset services by their live replicas.
    pub async fn expand(&self, remote: &SharedAccess) -> Result<ServiceSet> {
        let mut services = Vec::with_capacity(self.services.len());
        for service in &self.services {
            services.extend(service.expand(remote).await?);
        }
        Ok(Self::new(services))
    }

    /// Distinct endpoints, in order of first appearance, with the first
    /// service that resolved to each.
    pub fn endpoints(&self) -> Result<Vec<(Endpoint, &Service)>> {
        let mut seen = HashSet::new();
        let mut endpoints = Vec::new();
        for service in &self.services {
            let endpoint = service.endpoint()?;
            if seen.insert(endpoint.clone()) {
                endpoints.push((endpoint, service));
            }
        }
        Ok(endpoints)
    }

    /// Run `action` once per distinct endpoint, sequentially, stopping at
    /// the first error. Several service names may share one process; it is
    /// only acted on once. Returns how many endpoints were visited.
    pub async fn do_once_per_endpoint<'s, F, Fut>(&'s self, mut action: F) -> Result<usize>
    where
        F: FnMut(Endpoint, &'s Service) -> Fut,
        Fut: Future<Output = Result<()>> + 's,
    {
        let endpoints = self.endpoints()?;
        for (endpoint, service) in &endpoints {
            debug!("Running per-endpoint action on {} for {}", endpoint, service.name);
            action(endpoint.clone(), service).await?;
        }
        Ok(endpoints.len())
    }
}
