use crate::types::ResourcePath;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Identifiers are shortened to this many characters in rewritten summaries.
const SHORT_ID_LEN: usize = 7;

/// A Pod sandbox declared by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodBinding {
    pub sandbox_id: String,
    pub namespace: String,
    pub name: String,
}

/// A container created inside a known sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerBinding {
    pub container_id: String,
    pub pod: PodBinding,
    pub container_name: String,
}

/// Learned mapping from an opaque runtime identifier to a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceBinding {
    Pod(PodBinding),
    Container(ContainerBinding),
}

impl ResourceBinding {
    pub fn pod(sandbox_id: &str, namespace: &str, name: &str) -> Self {
        ResourceBinding::Pod(PodBinding {
            sandbox_id: sandbox_id.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// A container binding always hangs off the Pod binding of its sandbox.
    pub fn container(container_id: &str, pod: &PodBinding, container_name: &str) -> Self {
        ResourceBinding::Container(ContainerBinding {
            container_id: container_id.to_string(),
            pod: pod.clone(),
            container_name: container_name.to_string(),
        })
    }

    pub fn identifier(&self) -> &str {
        match self {
            ResourceBinding::Pod(p) => &p.sandbox_id,
            ResourceBinding::Container(c) => &c.container_id,
        }
    }

    pub fn resource_path(&self) -> ResourcePath {
        match self {
            ResourceBinding::Pod(p) => ResourcePath::pod(&p.namespace, &p.name),
            ResourceBinding::Container(c) => {
                ResourcePath::container(&c.pod.namespace, &c.pod.name, &c.container_name)
            }
        }
    }

    pub fn readable_name(&self) -> String {
        match self {
            ResourceBinding::Pod(p) => format!("{}/{}", p.namespace, p.name),
            ResourceBinding::Container(c) => {
                format!("{}/{}/{}", c.pod.namespace, c.pod.name, c.container_name)
            }
        }
    }

    /// Replace every occurrence of the identifier with a short form naming the
    /// resource, then tag the summary with the readable name unless the
    /// rewritten text already carries it.
    pub fn rewrite_summary(&self, summary: &str) -> String {
        let readable = self.readable_name();
        let id = self.identifier();
        let rewritten = if id.is_empty() {
            summary.to_string()
        } else {
            let short: String = id.chars().take(SHORT_ID_LEN).collect();
            summary.replace(id, &format!("{}...({})", short, readable))
        };
        if rewritten.contains(&readable) {
            rewritten
        } else {
            format!("{}【{}】", rewritten, readable)
        }
    }
}

type ScopeBindings = Arc<RwLock<Vec<Arc<ResourceBinding>>>>;

/// Per-run registry of bindings, keyed by scope (the node name).
///
/// Each scope has its own lock so lookups on one node never wait for writers
/// on another. Bindings are only ever appended.
#[derive(Debug, Default)]
pub struct LogBinder {
    scopes: DashMap<String, ScopeBindings>,
}

impl LogBinder {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(&self, scope: &str) -> Option<ScopeBindings> {
        self.scopes.get(scope).map(|entry| entry.value().clone())
    }

    fn scope_or_insert(&self, scope: &str) -> ScopeBindings {
        if let Some(existing) = self.scope(scope) {
            return existing;
        }
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Register a binding. Returns false when a binding with the same
    /// resource path and identifier already exists in the scope.
    pub fn add_binding(&self, scope: &str, binding: ResourceBinding) -> bool {
        let bindings = self.scope_or_insert(scope);
        let mut guard = bindings.write();
        let path = binding.resource_path();
        let duplicate = guard
            .iter()
            .any(|b| b.identifier() == binding.identifier() && b.resource_path() == path);
        if duplicate {
            return false;
        }
        guard.push(Arc::new(binding));
        true
    }

    /// Every binding in `scope` whose identifier appears in `body`, oldest first.
    pub fn get_bound_resources(&self, scope: &str, body: &str) -> Vec<Arc<ResourceBinding>> {
        let Some(bindings) = self.scope(scope) else {
            return Vec::new();
        };
        let guard = bindings.read();
        guard
            .iter()
            .filter(|b| !b.identifier().is_empty() && body.contains(b.identifier()))
            .cloned()
            .collect()
    }

    /// Exact lookup of the Pod binding declared for a sandbox id.
    pub fn find_pod(&self, scope: &str, sandbox_id: &str) -> Option<PodBinding> {
        let bindings = self.scope(scope)?;
        let guard = bindings.read();
        guard.iter().find_map(|b| match b.as_ref() {
            ResourceBinding::Pod(p) if p.sandbox_id == sandbox_id => Some(p.clone()),
            _ => None,
        })
    }

    #[allow(dead_code)]
    pub fn len(&self, scope: &str) -> usize {
        self.scope(scope).map(|b| b.read().len()).unwrap_or(0)
    }
}
