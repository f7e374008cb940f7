use crate::error::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const MAX_LABEL_VALUE_LENGTH: usize = 63;
/// Leaves room for `-phpmyadmin-service` and friends under 63 characters.
pub const MAX_APP_NAME_LENGTH: usize = 40;
const MAX_USER_SUFFIX_LENGTH: usize = 16;
const HASH_LENGTH: usize = 8;

const SERVICE_SUFFIX: &str = "-service";
const INGRESS_SUFFIX: &str = "-ingress";
const PVC_SUFFIX: &str = "-pvc";
const DB_SECRET_SUFFIX: &str = "-db-secret";

lazy_static! {
    static ref DNS_LABEL: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
}

pub struct ResourceNaming;

impl ResourceNaming {
    /// Application names become object names and label values, so they must be
    /// DNS-1123 labels short enough for every derived suffix.
    pub fn validate_app_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Validation("application name is required".to_string()));
        }
        if name.len() > MAX_APP_NAME_LENGTH {
            return Err(Error::Validation(format!(
                "application name '{name}' is longer than {MAX_APP_NAME_LENGTH} characters"
            )));
        }
        if !DNS_LABEL.is_match(name) {
            return Err(Error::Validation(format!(
                "application name '{name}' must be lowercase alphanumeric characters or '-', \
                 starting and ending with an alphanumeric character"
            )));
        }
        Ok(())
    }

    /// Namespace owned by `user_id`: `<prefix><slug>`, hashed when too long.
    ///
    /// Ids that are not already a slug get a hash of the raw id appended, so
    /// `Alice@Example.com` and `alice-example-com` never share a namespace.
    pub fn namespace_for(prefix: &str, user_id: &str) -> String {
        let slug = Self::slugify(user_id, MAX_K8S_NAME_LENGTH);
        let name = if slug == user_id {
            format!("{prefix}{slug}")
        } else {
            let room = MAX_K8S_NAME_LENGTH.saturating_sub(prefix.len() + HASH_LENGTH + 1);
            Self::join_hashed(prefix, &slug, room, user_id)
        };
        Self::truncate_with_hash(&name, MAX_K8S_NAME_LENGTH)
    }

    /// Lowercase, map every non-alphanumeric run to one `-`, trim dashes, truncate.
    pub fn slugify(raw: &str, limit: usize) -> String {
        let mut slug = String::with_capacity(raw.len());
        for c in raw.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.ends_with('-') {
                slug.push('-');
            }
        }
        let trimmed: String = slug.trim_matches('-').chars().take(limit).collect();
        trimmed.trim_end_matches('-').to_string()
    }

    /// Per-user discriminator appended to hostnames.
    pub fn user_suffix(user_id: &str) -> String {
        let slug = Self::slugify(user_id, MAX_K8S_NAME_LENGTH);
        if slug == user_id && slug.len() <= MAX_USER_SUFFIX_LENGTH {
            slug
        } else {
            // Distinct ids can slug to the same prefix, so the hash keeps them apart.
            Self::join_hashed("", &slug, 7, user_id)
        }
    }

    /// Coerce a value into a valid label value.
    pub fn label_value(raw: &str) -> String {
        let mapped: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .take(MAX_LABEL_VALUE_LENGTH)
            .collect();
        mapped
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string()
    }

    pub fn component_name(stack: &str, component: &str) -> String {
        Self::with_suffix(stack, &format!("-{component}"))
    }

    pub fn service_name(base: &str) -> String {
        Self::with_suffix(base, SERVICE_SUFFIX)
    }

    pub fn ingress_name(base: &str) -> String {
        Self::with_suffix(base, INGRESS_SUFFIX)
    }

    pub fn pvc_name(base: &str) -> String {
        Self::with_suffix(base, PVC_SUFFIX)
    }

    pub fn db_secret_name(base: &str) -> String {
        Self::with_suffix(base, DB_SECRET_SUFFIX)
    }

    fn with_suffix(base: &str, suffix: &str) -> String {
        let max_base = MAX_K8S_NAME_LENGTH.saturating_sub(suffix.len());
        if base.len() <= max_base {
            format!("{base}{suffix}")
        } else {
            // Deterministic hash keeps long names unique after truncation.
            let hash = Self::hash_string(base);
            let keep = max_base.saturating_sub(hash.len() + 1);
            let head: String = base.chars().take(keep).collect();
            format!("{}-{hash}{suffix}", head.trim_end_matches('-'))
        }
    }

    /// `<prefix><head>-<hash of raw>`, with `head` cut to `room` characters.
    fn join_hashed(prefix: &str, slug: &str, room: usize, raw: &str) -> String {
        let hash = Self::hash_string(raw);
        let head: String = slug.chars().take(room).collect();
        let head = head.trim_end_matches('-');
        if head.is_empty() {
            format!("{prefix}{hash}")
        } else {
            format!("{prefix}{head}-{hash}")
        }
    }

    fn truncate_with_hash(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            return name.to_string();
        }
        let hash = Self::hash_string(name);
        let keep = limit.saturating_sub(hash.len() + 1);
        let head: String = name.chars().take(keep).collect();
        format!("{}-{hash}", head.trim_end_matches('-'))
    }

    fn hash_string(input: &str) -> String {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..HASH_LENGTH].to_string()
    }
}
