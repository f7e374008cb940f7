//! In-memory [`ClusterClient`] used by tests and `labctl --dry-run`.
//!
//! Objects are stored as JSON so any `k8s-openapi` type round-trips through the
//! same code path. Creates conflict on duplicate names, patches follow JSON merge
//! patch, and selectors support `k=v`, `k==v`, `k!=v`, `k` and `!k`.

use super::{ClusterClient, ClusterError, ClusterObject};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::networking::v1::IngressClass;
use k8s_openapi::api::storage::v1::StorageClass;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

const NAMESPACE_KIND: &str = "Namespace";

/// API verb, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Patch,
    Delete,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "get"),
            Self::List => write!(f, "list"),
            Self::Create => write!(f, "create"),
            Self::Patch => write!(f, "patch"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    verb: Verb,
    kind: String,
    name: Option<String>,
    error: ClusterError,
}

type ObjectKey = (String, String, String);

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    storage_classes: Vec<StorageClass>,
    ingress_classes: Vec<IngressClass>,
    failures: Vec<InjectedFailure>,
    mutations: Vec<String>,
    resource_version: u64,
    simulate_rollout: bool,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn check(&self, verb: Verb, kind: &str, name: Option<&str>) -> Result<(), ClusterError> {
        let hit = self.failures.iter().find(|f| {
            f.verb == verb
                && f.kind == kind
                && match (&f.name, name) {
                    (None, _) => true,
                    (Some(expected), Some(actual)) => expected == actual,
                    (Some(_), None) => false,
                }
        });
        match hit {
            Some(failure) => Err(failure.error.clone()),
            None => Ok(()),
        }
    }
}

/// Shared in-memory control plane.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deployments become ready as soon as they are created or scaled.
    #[must_use]
    pub fn with_rollout_simulation(self) -> Self {
        self.lock().simulate_rollout = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-call.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every matching call fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, verb: Verb, kind: &str, error: ClusterError) {
        self.lock().failures.push(InjectedFailure {
            verb,
            kind: kind.to_string(),
            name: None,
            error,
        });
    }

    /// Like [`fail_on`](Self::fail_on) but only for one object name.
    pub fn fail_on_named(&self, verb: Verb, kind: &str, name: &str, error: ClusterError) {
        self.lock().failures.push(InjectedFailure {
            verb,
            kind: kind.to_string(),
            name: Some(name.to_string()),
            error,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Mutating calls in order, as `verb Kind/namespace/name`.
    #[must_use]
    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    /// Store an object directly, bypassing conflict checks and failure injection.
    pub fn insert<K: ClusterObject>(&self, namespace: &str, object: &K) -> Result<(), ClusterError> {
        let mut value = to_value(object)?;
        let name = object_name(&value)?;
        let mut state = self.lock();
        let version = state.next_version();
        stamp(&mut value, Some(namespace), &version);
        let simulate = state.simulate_rollout;
        normalize(&K::kind(&()), &mut value, simulate);
        state
            .objects
            .insert((K::kind(&()).to_string(), namespace.to_string(), name), value);
        Ok(())
    }

    /// Read an object without going through the async client.
    #[must_use]
    pub fn object<K: ClusterObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.lock();
        state
            .objects
            .get(&(K::kind(&()).to_string(), namespace.to_string(), name.to_string()))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Names of every stored object of kind `K` in `namespace`.
    #[must_use]
    pub fn names<K: ClusterObject>(&self, namespace: &str) -> Vec<String> {
        let kind = K::kind(&()).to_string();
        self.lock()
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Overwrite the observed status of a Deployment.
    pub fn set_deployment_status(&self, namespace: &str, name: &str, ready: i32, available: i32) {
        let mut state = self.lock();
        let key = ("Deployment".to_string(), namespace.to_string(), name.to_string());
        if let Some(value) = state.objects.get_mut(&key) {
            let replicas = desired_replicas(value);
            value["status"] = json!({
                "replicas": replicas,
                "readyReplicas": ready,
                "availableReplicas": available,
                "updatedReplicas": replicas,
            });
        }
    }

    pub fn add_storage_class(&self, name: &str, default: bool) {
        let mut annotations = BTreeMap::new();
        if default {
            annotations.insert(
                "storageclass.kubernetes.io/is-default-class".to_string(),
                "true".to_string(),
            );
        }
        let class: Result<StorageClass, _> = serde_json::from_value(json!({
            "apiVersion": "storage.k8s.io/v1",
            "kind": "StorageClass",
            "metadata": { "name": name, "annotations": annotations },
            "provisioner": "rancher.io/local-path",
        }));
        if let Ok(class) = class {
            self.lock().storage_classes.push(class);
        }
    }

    pub fn add_ingress_class(&self, name: &str) {
        let class: Result<IngressClass, _> = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "IngressClass",
            "metadata": { "name": name },
            "spec": { "controller": "k8s.io/ingress-nginx" },
        }));
        if let Ok(class) = class {
            self.lock().ingress_classes.push(class);
        }
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<K, ClusterError> {
        let kind = K::kind(&()).to_string();
        let state = self.lock();
        state.check(Verb::Get, &kind, Some(name))?;
        let value = state
            .objects
            .get(&(kind.clone(), namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found(&kind, name))?;
        from_value(value)
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<K>, ClusterError> {
        let kind = K::kind(&()).to_string();
        let requirements = parse_selector(selector.unwrap_or_default())?;
        let state = self.lock();
        state.check(Verb::List, &kind, None)?;
        state
            .objects
            .iter()
            .filter(|((k, ns, _), value)| {
                *k == kind && ns == namespace && matches_selector(value, &requirements)
            })
            .map(|(_, value)| from_value(value))
            .collect()
    }

    async fn create<K: ClusterObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let kind = K::kind(&()).to_string();
        let mut value = to_value(object)?;
        let name = object_name(&value)?;
        let mut state = self.lock();
        state.check(Verb::Create, &kind, Some(&name))?;
        let key = (kind.clone(), namespace.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(ClusterError::Conflict(format!(
                "{kind} \"{name}\" already exists"
            )));
        }
        let version = state.next_version();
        stamp(&mut value, Some(namespace), &version);
        let simulate = state.simulate_rollout;
        normalize(&kind, &mut value, simulate);
        state
            .mutations
            .push(format!("{} {kind}/{namespace}/{name}", Verb::Create));
        state.objects.insert(key, value.clone());
        from_value(&value)
    }

    async fn patch<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, ClusterError> {
        let kind = K::kind(&()).to_string();
        let mut state = self.lock();
        state.check(Verb::Patch, &kind, Some(name))?;
        let version = state.next_version();
        let simulate = state.simulate_rollout;
        let key = (kind.clone(), namespace.to_string(), name.to_string());
        let value = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| not_found(&kind, name))?;
        merge_patch(value, patch);
        value["metadata"]["resourceVersion"] = json!(version);
        normalize(&kind, value, simulate);
        let patched = value.clone();
        state
            .mutations
            .push(format!("{} {kind}/{namespace}/{name}", Verb::Patch));
        from_value(&patched)
    }

    async fn delete<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let kind = K::kind(&()).to_string();
        let mut state = self.lock();
        state.check(Verb::Delete, &kind, Some(name))?;
        let key = (kind.clone(), namespace.to_string(), name.to_string());
        if state.objects.remove(&key).is_none() {
            return Err(not_found(&kind, name));
        }
        state
            .mutations
            .push(format!("{} {kind}/{namespace}/{name}", Verb::Delete));
        Ok(())
    }

    async fn list_namespaces(
        &self,
        selector: Option<&str>,
    ) -> Result<Vec<Namespace>, ClusterError> {
        let requirements = parse_selector(selector.unwrap_or_default())?;
        let state = self.lock();
        state.check(Verb::List, NAMESPACE_KIND, None)?;
        state
            .objects
            .iter()
            .filter(|((k, _, _), value)| {
                k == NAMESPACE_KIND && matches_selector(value, &requirements)
            })
            .map(|(_, value)| from_value(value))
            .collect()
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        let mut value = to_value(namespace)?;
        let name = object_name(&value)?;
        let mut state = self.lock();
        state.check(Verb::Create, NAMESPACE_KIND, Some(&name))?;
        let key = (NAMESPACE_KIND.to_string(), String::new(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(ClusterError::Conflict(format!(
                "namespaces \"{name}\" already exists"
            )));
        }
        let version = state.next_version();
        stamp(&mut value, None, &version);
        state
            .mutations
            .push(format!("{} {NAMESPACE_KIND}/{name}", Verb::Create));
        state.objects.insert(key, value.clone());
        from_value(&value)
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.check(Verb::Delete, NAMESPACE_KIND, Some(name))?;
        let key = (NAMESPACE_KIND.to_string(), String::new(), name.to_string());
        if state.objects.remove(&key).is_none() {
            return Err(not_found(NAMESPACE_KIND, name));
        }
        state.objects.retain(|(_, ns, _), _| ns != name);
        state
            .mutations
            .push(format!("{} {NAMESPACE_KIND}/{name}", Verb::Delete));
        Ok(())
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>, ClusterError> {
        let state = self.lock();
        state.check(Verb::List, "StorageClass", None)?;
        Ok(state.storage_classes.clone())
    }

    async fn list_ingress_classes(&self) -> Result<Vec<IngressClass>, ClusterError> {
        let state = self.lock();
        state.check(Verb::List, "IngressClass", None)?;
        Ok(state.ingress_classes.clone())
    }
}

fn not_found(kind: &str, name: &str) -> ClusterError {
    ClusterError::NotFound(format!("{kind} \"{name}\" not found"))
}

fn to_value<K: serde::Serialize>(object: &K) -> Result<Value, ClusterError> {
    serde_json::to_value(object).map_err(|e| ClusterError::Decode(e.to_string()))
}

fn from_value<K: serde::de::DeserializeOwned>(value: &Value) -> Result<K, ClusterError> {
    serde_json::from_value(value.clone()).map_err(|e| ClusterError::Decode(e.to_string()))
}

fn object_name(value: &Value) -> Result<String, ClusterError> {
    value["metadata"]["name"]
        .as_str()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ClusterError::Invalid("metadata.name: Required value".to_string()))
}

fn stamp(value: &mut Value, namespace: Option<&str>, version: &str) {
    if let Some(namespace) = namespace {
        value["metadata"]["namespace"] = json!(namespace);
    }
    value["metadata"]["resourceVersion"] = json!(version);
    if value["metadata"]["uid"].is_null() {
        value["metadata"]["uid"] = json!(format!("uid-{version}"));
    }
    if value["metadata"]["creationTimestamp"].is_null() {
        value["metadata"]["creationTimestamp"] =
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
    }
}

/// Server-side defaulting the orchestrator relies on.
fn normalize(kind: &str, value: &mut Value, simulate_rollout: bool) {
    match kind {
        "Secret" => fold_string_data(value),
        "Deployment" if simulate_rollout => {
            let replicas = desired_replicas(value);
            value["status"] = json!({
                "replicas": replicas,
                "readyReplicas": replicas,
                "availableReplicas": replicas,
                "updatedReplicas": replicas,
            });
        }
        _ => {}
    }
}

fn desired_replicas(value: &Value) -> i64 {
    value["spec"]["replicas"].as_i64().unwrap_or(1)
}

/// The API server merges `stringData` into `data` and never returns it.
fn fold_string_data(value: &mut Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    let Some(Value::Object(string_data)) = object.remove("stringData") else {
        return;
    };
    let data = object
        .entry("data")
        .or_insert_with(|| Value::Object(Map::new()));
    if !data.is_object() {
        *data = Value::Object(Map::new());
    }
    if let Some(data) = data.as_object_mut() {
        for (key, raw) in string_data {
            let text = raw.as_str().unwrap_or_default();
            data.insert(key, json!(BASE64.encode(text.as_bytes())));
        }
    }
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Some(target) = target.as_object_mut() {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

fn parse_selector(selector: &str) -> Result<Vec<Requirement>, ClusterError> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                Ok(Requirement::NotEquals(key.trim().into(), value.trim().into()))
            } else if let Some((key, value)) = term.split_once("==") {
                Ok(Requirement::Equals(key.trim().into(), value.trim().into()))
            } else if let Some((key, value)) = term.split_once('=') {
                Ok(Requirement::Equals(key.trim().into(), value.trim().into()))
            } else if let Some(key) = term.strip_prefix('!') {
                Ok(Requirement::NotExists(key.trim().into()))
            } else if term.contains(char::is_whitespace) {
                Err(ClusterError::Invalid(format!(
                    "unable to parse requirement: {term}"
                )))
            } else {
                Ok(Requirement::Exists(term.into()))
            }
        })
        .collect()
}

fn matches_selector(value: &Value, requirements: &[Requirement]) -> bool {
    let labels = &value["metadata"]["labels"];
    requirements.iter().all(|requirement| match requirement {
        Requirement::Equals(key, expected) => labels[key].as_str() == Some(expected.as_str()),
        Requirement::NotEquals(key, expected) => labels[key].as_str() != Some(expected.as_str()),
        Requirement::Exists(key) => !labels[key].is_null(),
        Requirement::NotExists(key) => labels[key].is_null(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};

    fn config_map(name: &str, labels: Value) -> ConfigMap {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "labels": labels },
            "data": { "key": "value" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let cluster = InMemoryCluster::new();
        let cm = config_map("settings", json!({}));
        cluster.create("lab-u1", &cm).await.unwrap();
        let err = cluster.create("lab-u1", &cm).await.unwrap_err();
        assert!(err.is_conflict());
        // Same name in another namespace is a different object.
        cluster.create("lab-u2", &cm).await.unwrap();
    }

    #[tokio::test]
    async fn selectors_filter_by_labels() {
        let cluster = InMemoryCluster::new();
        cluster
            .create("ns", &config_map("a", json!({"stack-name": "blog", "tier": "web"})))
            .await
            .unwrap();
        cluster
            .create("ns", &config_map("b", json!({"stack-name": "blog"})))
            .await
            .unwrap();
        cluster
            .create("ns", &config_map("c", json!({"stack-name": "shop"})))
            .await
            .unwrap();

        let blog: Vec<ConfigMap> = cluster.list("ns", Some("stack-name=blog")).await.unwrap();
        assert_eq!(blog.len(), 2);
        let web: Vec<ConfigMap> = cluster
            .list("ns", Some("stack-name==blog,tier"))
            .await
            .unwrap();
        assert_eq!(web.len(), 1);
        let not_blog: Vec<ConfigMap> = cluster.list("ns", Some("stack-name!=blog")).await.unwrap();
        assert_eq!(not_blog.len(), 1);
        let untiered: Vec<ConfigMap> = cluster.list("ns", Some("!tier")).await.unwrap();
        assert_eq!(untiered.len(), 2);
    }

    #[tokio::test]
    async fn merge_patch_removes_null_keys() {
        let cluster = InMemoryCluster::new();
        cluster
            .create("ns", &config_map("a", json!({"keep": "1", "drop": "2"})))
            .await
            .unwrap();
        let patched: ConfigMap = cluster
            .patch(
                "ns",
                "a",
                &json!({"metadata": {"labels": {"drop": null, "new": "3"}}}),
            )
            .await
            .unwrap();
        let labels = patched.metadata.labels.unwrap();
        assert_eq!(labels.get("keep").map(String::as_str), Some("1"));
        assert_eq!(labels.get("new").map(String::as_str), Some("3"));
        assert!(!labels.contains_key("drop"));
    }

    #[tokio::test]
    async fn secrets_fold_string_data() {
        let cluster = InMemoryCluster::new();
        let secret: Secret = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "db" },
            "stringData": { "password": "hunter2" }
        }))
        .unwrap();
        let stored = cluster.create("ns", &secret).await.unwrap();
        assert!(stored.string_data.is_none());
        let data = stored.data.unwrap();
        assert_eq!(data.get("password").unwrap().0, b"hunter2".to_vec());
    }

    #[tokio::test]
    async fn injected_failures_target_verb_and_name() {
        let cluster = InMemoryCluster::new();
        cluster.fail_on_named(
            Verb::Create,
            "ConfigMap",
            "broken",
            ClusterError::Unavailable("connection refused".to_string()),
        );
        cluster.create("ns", &config_map("fine", json!({}))).await.unwrap();
        let err = cluster
            .create("ns", &config_map("broken", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 503);
        cluster.clear_failures();
        cluster.create("ns", &config_map("broken", json!({}))).await.unwrap();
        assert_eq!(cluster.mutations().len(), 2);
    }
}
