//! Label and annotation schema, and the one place labels are decoded.
//!
//! Stack membership, ownership and component role are all encoded as flat labels
//! on cluster objects. [`ObjectRef::from_meta`] turns them into typed fields so no
//! other module reads raw label strings.

use crate::identity::{Role, UserIdentity};
use crate::naming::ResourceNaming;
use crate::provision::{ComponentKind, WorkloadType};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use std::collections::BTreeMap;

/// Marks objects created by this system; value is the configured `managedBy`.
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_APP_TYPE: &str = "app-type";
pub const LABEL_USER_ID: &str = "user-id";
pub const LABEL_USER_ROLE: &str = "user-role";
/// Username of the owning user.
pub const LABEL_OWNER: &str = "owner";
pub const LABEL_STACK_NAME: &str = "stack-name";
pub const LABEL_COMPONENT: &str = "component";
/// Logical application name, also the pod selector key.
pub const LABEL_APP: &str = "app";

pub const ANNOTATION_PAUSED: &str = "lab-orchestrator/paused";
pub const ANNOTATION_SAVED_REPLICAS: &str = "lab-orchestrator/saved-replicas";
pub const ANNOTATION_PAUSED_BY: &str = "lab-orchestrator/paused-by";
pub const ANNOTATION_PAUSED_AT: &str = "lab-orchestrator/paused-at";

/// All lifecycle annotations; resume clears every one of them.
pub const LIFECYCLE_ANNOTATIONS: [&str; 4] = [
    ANNOTATION_PAUSED,
    ANNOTATION_SAVED_REPLICAS,
    ANNOTATION_PAUSED_BY,
    ANNOTATION_PAUSED_AT,
];

/// Typed view of an object's labels and lifecycle annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectRef {
    pub name: String,
    pub namespace: Option<String>,
    pub managed: bool,
    pub owner: Option<String>,
    pub user_id: Option<String>,
    pub user_role: Option<Role>,
    pub app_type: Option<WorkloadType>,
    pub stack_name: Option<String>,
    pub component: Option<ComponentKind>,
    pub app: Option<String>,
    pub paused: bool,
    pub saved_replicas: Option<i32>,
    pub paused_by: Option<String>,
    pub paused_at: Option<String>,
}

impl ObjectRef {
    #[must_use]
    pub fn from_meta(meta: &ObjectMeta, managed_by: &str) -> Self {
        let labels = meta.labels.as_ref();
        let label = |key: &str| {
            labels
                .and_then(|l| l.get(key))
                .filter(|v| !v.is_empty())
                .cloned()
        };
        let annotations = meta.annotations.as_ref();
        let annotation = |key: &str| annotations.and_then(|a| a.get(key)).cloned();

        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
            managed: label(LABEL_MANAGED_BY).as_deref() == Some(managed_by),
            owner: label(LABEL_OWNER),
            user_id: label(LABEL_USER_ID),
            user_role: label(LABEL_USER_ROLE).and_then(|r| r.parse().ok()),
            app_type: label(LABEL_APP_TYPE).and_then(|t| t.parse().ok()),
            stack_name: label(LABEL_STACK_NAME),
            component: label(LABEL_COMPONENT).and_then(|c| c.parse().ok()),
            app: label(LABEL_APP),
            paused: annotation(ANNOTATION_PAUSED).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            saved_replicas: annotation(ANNOTATION_SAVED_REPLICAS)
                .and_then(|v| v.trim().parse().ok()),
            paused_by: annotation(ANNOTATION_PAUSED_BY),
            paused_at: annotation(ANNOTATION_PAUSED_AT),
        }
    }

    /// Identity of the stack this object belongs to.
    #[must_use]
    pub fn stack_identity(&self) -> &str {
        self.stack_name.as_deref().unwrap_or(&self.name)
    }

    /// Key used to count distinct apps: `stack-name`, else `app`, else the name.
    ///
    /// Objects carrying no app-type label predate stack labels; their WordPress
    /// database was named `<app>-mariadb` and folds into `<app>`.
    #[must_use]
    pub fn logical_app_key(&self) -> String {
        if let Some(stack) = &self.stack_name {
            return stack.clone();
        }
        if let Some(app) = &self.app {
            return app.clone();
        }
        if self.app_type.is_none() {
            if let Some(base) = self.name.strip_suffix("-mariadb") {
                if !base.is_empty() {
                    return base.to_string();
                }
            }
        }
        self.name.clone()
    }

    /// Application named by the `stack-name` or `app` label, if either is set.
    #[must_use]
    pub fn claimed_app(&self) -> Option<&str> {
        self.stack_name.as_deref().or(self.app.as_deref())
    }

    /// Whether `user` owns this object. Ownership is recorded by username and
    /// user id; either matching is enough.
    #[must_use]
    pub fn is_owned_by(&self, user: &UserIdentity) -> bool {
        let by_owner = self
            .owner
            .as_deref()
            .is_some_and(|owner| owner == ResourceNaming::label_value(&user.username));
        let by_id = self
            .user_id
            .as_deref()
            .is_some_and(|id| id == ResourceNaming::label_value(&user.user_id));
        by_owner || by_id
    }
}

/// Builds the label set every object of one application carries.
#[derive(Debug, Clone)]
pub struct LabelSet<'a> {
    pub managed_by: &'a str,
    pub user: &'a UserIdentity,
    pub app_type: WorkloadType,
    pub app: &'a str,
    pub stack_name: Option<&'a str>,
}

impl LabelSet<'_> {
    /// Labels shared by every object of the application.
    #[must_use]
    pub fn common(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), self.managed_by.to_string());
        labels.insert(LABEL_APP_TYPE.to_string(), self.app_type.to_string());
        labels.insert(
            LABEL_USER_ID.to_string(),
            ResourceNaming::label_value(&self.user.user_id),
        );
        labels.insert(LABEL_USER_ROLE.to_string(), self.user.role.to_string());
        labels.insert(
            LABEL_OWNER.to_string(),
            ResourceNaming::label_value(&self.user.username),
        );
        labels.insert(LABEL_APP.to_string(), self.app.to_string());
        if let Some(stack) = self.stack_name {
            labels.insert(LABEL_STACK_NAME.to_string(), stack.to_string());
        }
        labels
    }

    /// Common labels plus the component label.
    #[must_use]
    pub fn for_component(&self, component: ComponentKind) -> BTreeMap<String, String> {
        let mut labels = self.common();
        labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
        labels
    }

    /// Pod selector for one component. Must stay stable across updates.
    #[must_use]
    pub fn selector(&self, component: ComponentKind) -> BTreeMap<String, String> {
        let mut selector = BTreeMap::new();
        selector.insert(LABEL_APP.to_string(), self.app.to_string());
        selector.insert(LABEL_COMPONENT.to_string(), component.to_string());
        selector
    }
}

/// Label selector string from `key=value` pairs.
#[must_use]
pub fn selector(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("lab-7".to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn decodes_labels_and_annotations() {
        let m = meta(
            "blog-mariadb",
            &[
                (LABEL_MANAGED_BY, "lab-orchestrator"),
                (LABEL_APP_TYPE, "wordpress"),
                (LABEL_USER_ID, "7"),
                (LABEL_USER_ROLE, "student"),
                (LABEL_OWNER, "alice"),
                (LABEL_STACK_NAME, "blog"),
                (LABEL_COMPONENT, "mariadb"),
            ],
            &[
                (ANNOTATION_PAUSED, "true"),
                (ANNOTATION_SAVED_REPLICAS, "2"),
                (ANNOTATION_PAUSED_BY, "alice"),
            ],
        );
        let r = ObjectRef::from_meta(&m, "lab-orchestrator");
        assert!(r.managed);
        assert_eq!(r.app_type, Some(WorkloadType::WordPress));
        assert_eq!(r.component, Some(ComponentKind::MariaDb));
        assert_eq!(r.user_role, Some(Role::Student));
        assert_eq!(r.stack_identity(), "blog");
        assert_eq!(r.logical_app_key(), "blog");
        assert!(r.paused);
        assert_eq!(r.saved_replicas, Some(2));
        assert_eq!(r.paused_by.as_deref(), Some("alice"));
        assert!(r.paused_at.is_none());

        let other_system = ObjectRef::from_meta(&m, "someone-else");
        assert!(!other_system.managed);
    }

    #[test]
    fn logical_app_key_fallbacks() {
        let by_app = ObjectRef::from_meta(&meta("web-1", &[(LABEL_APP, "web")], &[]), "x");
        assert_eq!(by_app.logical_app_key(), "web");

        let legacy = ObjectRef::from_meta(&meta("site-mariadb", &[], &[]), "x");
        assert_eq!(legacy.logical_app_key(), "site");

        // A typed custom app that happens to end in -mariadb keeps its own name.
        let typed = ObjectRef::from_meta(
            &meta("my-mariadb", &[(LABEL_APP_TYPE, "custom")], &[]),
            "x",
        );
        assert_eq!(typed.logical_app_key(), "my-mariadb");
    }

    #[test]
    fn claimed_app_prefers_stack_name() {
        let stacked = ObjectRef::from_meta(
            &meta("blog-mariadb", &[(LABEL_STACK_NAME, "blog"), (LABEL_APP, "blog")], &[]),
            "x",
        );
        assert_eq!(stacked.claimed_app(), Some("blog"));
        let custom = ObjectRef::from_meta(&meta("blog-mariadb", &[(LABEL_APP, "blog-mariadb")], &[]), "x");
        assert_eq!(custom.claimed_app(), Some("blog-mariadb"));
        let bare = ObjectRef::from_meta(&meta("blog-mariadb", &[], &[]), "x");
        assert_eq!(bare.claimed_app(), None);
    }

    #[test]
    fn ownership_by_username_or_id() {
        let r = ObjectRef::from_meta(
            &meta("x", &[(LABEL_OWNER, "alice"), (LABEL_USER_ID, "7")], &[]),
            "lab-orchestrator",
        );
        assert!(r.is_owned_by(&UserIdentity::new("7", "someone", Role::Student)));
        assert!(r.is_owned_by(&UserIdentity::new("8", "alice", Role::Student)));
        assert!(!r.is_owned_by(&UserIdentity::new("8", "bob", Role::Student)));
    }

    #[test]
    fn label_set_contents() {
        let user = UserIdentity::new("7", "alice@example.com", Role::Teacher);
        let set = LabelSet {
            managed_by: "lab-orchestrator",
            user: &user,
            app_type: WorkloadType::Lamp,
            app: "shop",
            stack_name: Some("shop"),
        };
        let labels = set.for_component(ComponentKind::Web);
        assert_eq!(labels[LABEL_OWNER], "alice-example.com");
        assert_eq!(labels[LABEL_STACK_NAME], "shop");
        assert_eq!(labels[LABEL_COMPONENT], "web");
        assert_eq!(labels[LABEL_USER_ROLE], "teacher");
        assert_eq!(set.selector(ComponentKind::Web).len(), 2);
        assert_eq!(
            selector(&[(LABEL_STACK_NAME, "shop"), (LABEL_USER_ID, "7")]),
            "stack-name=shop,user-id=7"
        );
    }
}
