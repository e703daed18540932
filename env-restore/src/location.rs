//! Location descriptors and the `|`-delimited spec mini-language.
//!
//! Archive specs:
//!
//! ```text
//! local|<path>
//! host|<host>|<path>
//! pod|<namespace>/<name>[/<container>]|<path>
//! statefulset|<namespace>/<name>[/<container>]|<path template with <pod>>
//! ```
//!
//! Service specs carry a port right after the target token:
//!
//! ```text
//! local|<port>|<stage path>
//! host|<host>|<port>|<stage path>
//! pod|<namespace>/<name>[/<container>]|<port>|<stage path>
//! statefulset|<namespace>/<name>[/<container>]|<port>|<stage path template>
//! ```

use crate::utils::errors::{Error, Result};
use std::fmt;
use std::path::PathBuf;

/// Placeholder replaced by the replica's pod name in StatefulSet templates.
pub const POD_PLACEHOLDER: &str = "<pod>";

const SEPARATOR: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Local,
    Host,
    Pod,
    StatefulSet,
}

impl Scheme {
    fn parse(token: &str, spec: &str) -> Result<Self> {
        match token {
            "local" => Ok(Scheme::Local),
            "host" => Ok(Scheme::Host),
            "pod" => Ok(Scheme::Pod),
            "statefulset" => Ok(Scheme::StatefulSet),
            other => Err(Error::validation(
                spec,
                format!("unknown scheme {other:?}, expected one of local, host, pod, statefulset"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "local",
            Scheme::Host => "host",
            Scheme::Pod => "pod",
            Scheme::StatefulSet => "statefulset",
        }
    }

    fn archive_shape(&self) -> &'static str {
        match self {
            Scheme::Local => "local|<path>",
            Scheme::Host => "host|<host>|<path>",
            Scheme::Pod => "pod|<namespace>/<name>[/<container>]|<path>",
            Scheme::StatefulSet => {
                "statefulset|<namespace>/<name>[/<container>]|<path template containing <pod>>"
            }
        }
    }

    fn service_shape(&self) -> &'static str {
        match self {
            Scheme::Local => "local|<port>|<stage path>",
            Scheme::Host => "host|<host>|<port>|<stage path>",
            Scheme::Pod => "pod|<namespace>/<name>[/<container>]|<port>|<stage path>",
            Scheme::StatefulSet => {
                "statefulset|<namespace>/<name>[/<container>]|<port>|<stage path template containing <pod>>"
            }
        }
    }

    /// Number of tokens of an archive spec, scheme token included.
    fn archive_tokens(&self) -> usize {
        match self {
            Scheme::Local => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Kubernetes pod or statefulset reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub container: Option<String>,
}

impl PodRef {
    fn parse(token: &str, spec: &str) -> Result<Self> {
        let parts: Vec<&str> = token.split('/').collect();
        if !(2..=3).contains(&parts.len()) || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::validation(
                spec,
                format!("expected <namespace>/<name>[/<container>], got {token:?}"),
            ));
        }

        Ok(Self {
            namespace: parts[0].to_string(),
            name: parts[1].to_string(),
            container: parts.get(2).map(|c| c.to_string()),
        })
    }

    /// Pod name of the given replica of a statefulset.
    pub fn replica_name(&self, replica: usize) -> String {
        format!("{}-{}", self.name, replica)
    }

    /// The pod backing `replica`, sharing namespace and container.
    pub fn replica(&self, replica: usize) -> PodRef {
        PodRef {
            namespace: self.namespace.clone(),
            name: self.replica_name(replica),
            container: self.container.clone(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)?;
        if let Some(container) = &self.container {
            write!(f, "/{container}")?;
        }
        Ok(())
    }
}

/// Where bytes live. Each variant only carries the fields of its scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Local { path: PathBuf },
    Host { host: String, path: String },
    Pod { pod: PodRef, path: String },
    StatefulSet { set: PodRef, path_template: String },
}

impl Location {
    /// Parse an archive spec.
    pub fn parse(spec: &str) -> Result<Self> {
        let tokens = tokenize(spec)?;
        let scheme = Scheme::parse(tokens[0], spec)?;
        let expected = scheme.archive_tokens();
        if tokens.len() != expected {
            return Err(Error::validation(
                spec,
                format!(
                    "expected {expected} tokens ({}), got {}",
                    scheme.archive_shape(),
                    tokens.len()
                ),
            ));
        }
        check_non_empty(&tokens, spec, scheme.archive_shape())?;
        Self::from_tokens(scheme, &tokens[1..], spec)
    }

    fn from_tokens(scheme: Scheme, rest: &[&str], spec: &str) -> Result<Self> {
        let location = match scheme {
            Scheme::Local => Location::Local {
                path: PathBuf::from(rest[0]),
            },
            Scheme::Host => Location::Host {
                host: rest[0].to_string(),
                path: rest[1].to_string(),
            },
            Scheme::Pod => Location::Pod {
                pod: PodRef::parse(rest[0], spec)?,
                path: rest[1].to_string(),
            },
            Scheme::StatefulSet => {
                let set = PodRef::parse(rest[0], spec)?;
                if !rest[1].contains(POD_PLACEHOLDER) {
                    return Err(Error::validation(
                        spec,
                        format!("statefulset path template must contain {POD_PLACEHOLDER}"),
                    ));
                }
                Location::StatefulSet {
                    set,
                    path_template: rest[1].to_string(),
                }
            }
        };
        Ok(location)
    }

    pub fn scheme(&self) -> Scheme {
        match self {
            Location::Local { .. } => Scheme::Local,
            Location::Host { .. } => Scheme::Host,
            Location::Pod { .. } => Scheme::Pod,
            Location::StatefulSet { .. } => Scheme::StatefulSet,
        }
    }

    pub fn is_stateful_set(&self) -> bool {
        matches!(self, Location::StatefulSet { .. })
    }

    /// Location of the replica's pod for a StatefulSet location.
    pub fn pod_location(&self, replica: usize) -> Result<Location> {
        match self {
            Location::StatefulSet { set, path_template } => {
                let pod = set.replica(replica);
                let path = path_template.replace(POD_PLACEHOLDER, &pod.name);
                Ok(Location::Pod { pod, path })
            }
            other => Err(Error::Configuration(format!(
                "{other} is not a statefulset and has no replicas"
            ))),
        }
    }

    /// Location of the entry `name` inside this directory-like location.
    pub fn join(&self, name: &str) -> Location {
        match self {
            Location::Local { path } => Location::Local {
                path: path.join(name),
            },
            Location::Host { host, path } => Location::Host {
                host: host.clone(),
                path: join_remote(path, name),
            },
            Location::Pod { pod, path } => Location::Pod {
                pod: pod.clone(),
                path: join_remote(path, name),
            },
            Location::StatefulSet { set, path_template } => Location::StatefulSet {
                set: set.clone(),
                path_template: join_remote(path_template, name),
            },
        }
    }

    /// Path component as a string, whatever the scheme.
    pub fn path_str(&self) -> String {
        match self {
            Location::Local { path } => path.to_string_lossy().to_string(),
            Location::Host { path, .. } | Location::Pod { path, .. } => path.clone(),
            Location::StatefulSet { path_template, .. } => path_template.clone(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local { path } => write!(f, "local|{}", path.display()),
            Location::Host { host, path } => write!(f, "host|{host}|{path}"),
            Location::Pod { pod, path } => write!(f, "pod|{pod}|{path}"),
            Location::StatefulSet { set, path_template } => {
                write!(f, "statefulset|{set}|{path_template}")
            }
        }
    }
}

/// A live service: the port its RPC endpoint listens on plus the staging
/// location restore files are copied to before the restore call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceLocation {
    pub port: u16,
    pub stage: Location,
}

impl ServiceLocation {
    /// Parse a service spec.
    pub fn parse(spec: &str) -> Result<Self> {
        let tokens = tokenize(spec)?;
        let scheme = Scheme::parse(tokens[0], spec)?;
        let expected = scheme.archive_tokens() + 1;
        if tokens.len() != expected {
            return Err(Error::validation(
                spec,
                format!(
                    "expected {expected} tokens ({}), got {}",
                    scheme.service_shape(),
                    tokens.len()
                ),
            ));
        }
        check_non_empty(&tokens, spec, scheme.service_shape())?;

        // Port sits right before the trailing path token.
        let port_index = expected - 2;
        let port = tokens[port_index]
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                Error::validation(spec, format!("invalid port {:?}", tokens[port_index]))
            })?;

        let mut rest: Vec<&str> = tokens[1..].to_vec();
        rest.remove(port_index - 1);
        let stage = Location::from_tokens(scheme, &rest, spec)?;

        Ok(Self { port, stage })
    }

    pub fn scheme(&self) -> Scheme {
        self.stage.scheme()
    }

    /// Per-replica service location for a StatefulSet service.
    pub fn pod_location(&self, replica: usize) -> Result<ServiceLocation> {
        Ok(ServiceLocation {
            port: self.port,
            stage: self.stage.pod_location(replica)?,
        })
    }
}

impl fmt::Display for ServiceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Location::Local { path } => write!(f, "local|{}|{}", self.port, path.display()),
            Location::Host { host, path } => write!(f, "host|{host}|{}|{path}", self.port),
            Location::Pod { pod, path } => write!(f, "pod|{pod}|{}|{path}", self.port),
            Location::StatefulSet { set, path_template } => {
                write!(f, "statefulset|{set}|{}|{path_template}", self.port)
            }
        }
    }
}

fn tokenize(spec: &str) -> Result<Vec<&str>> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(spec, "empty spec"));
    }
    Ok(trimmed.split(SEPARATOR).map(str::trim).collect())
}

fn check_non_empty(tokens: &[&str], spec: &str, shape: &str) -> Result<()> {
    if let Some(index) = tokens.iter().position(|t| t.is_empty()) {
        return Err(Error::validation(
            spec,
            format!("token {index} is empty, expected {shape}"),
        ));
    }
    Ok(())
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}
