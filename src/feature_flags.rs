//! FeatureFlagsService: named toggles with percentage rollout and targeting.
//!
//! Flags live only in memory. At start-up they are seeded from the
//! `FEATURE_FLAGS` JSON blob, then the built-in defaults are added for any
//! name the blob did not define.

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::FlexConfig;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// 0-100. Users whose bucket is above this value are excluded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tenants: Option<Vec<String>>,
    /// Context key -> exact value required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Map<String, Value>>,
}

impl FeatureFlag {
    pub fn new(name: impl Into<String>, enabled: bool, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled,
            description: description.into(),
            rollout_percentage: None,
            target_users: None,
            target_tenants: None,
            conditions: None,
        }
    }

    pub fn with_rollout(mut self, percentage: f64) -> Self {
        self.rollout_percentage = Some(percentage);
        self
    }

    pub fn with_target_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_users = Some(users.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_target_tenants<I, S>(mut self, tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_tenants = Some(tenants.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_condition(mut self, key: impl Into<String>, value: Value) -> Self {
        self.conditions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Overlay every field present in `update`. The name never changes.
    pub fn merge(&mut self, update: FlagUpdate) {
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(pct) = update.rollout_percentage {
            self.rollout_percentage = Some(pct);
        }
        if let Some(users) = update.target_users {
            self.target_users = Some(users);
        }
        if let Some(tenants) = update.target_tenants {
            self.target_tenants = Some(tenants);
        }
        if let Some(conditions) = update.conditions {
            self.conditions = Some(conditions);
        }
    }
}

/// Partial flag used for shallow-merge updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlagUpdate {
    pub enabled: Option<bool>,
    pub description: Option<String>,
    pub rollout_percentage: Option<f64>,
    pub target_users: Option<Vec<String>>,
    pub target_tenants: Option<Vec<String>>,
    pub conditions: Option<Map<String, Value>>,
}

impl FlagUpdate {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }
}

/// Who is asking. Extra keys are available to flag conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlagContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl FlagContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Turn query-string attributes that read as booleans or numbers into
    /// those JSON types. Anything else stays a string.
    pub fn with_typed_attributes(mut self) -> Self {
        for value in self.attributes.values_mut() {
            let Value::String(raw) = value else { continue };
            if let Ok(parsed @ (Value::Bool(_) | Value::Number(_))) = serde_json::from_str::<Value>(raw) {
                *value = parsed;
            }
        }
        self
    }

    /// Resolve a condition key against this context.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        match key {
            "userId" => self.user_id.clone().map(Value::String),
            "tenantId" => self.tenant_id.clone().map(Value::String),
            other => self.attributes.get(other).cloned(),
        }
    }
}

/// Deterministic 0..=99 bucket for a user id.
///
/// Polynomial rolling hash (`h * 31 + c`) over UTF-16 code units in wrapping
/// 32-bit arithmetic, folded by absolute value modulo 100.
pub fn rollout_bucket(user_id: &str) -> u32 {
    let hash = user_id.encode_utf16().fold(0i32, |h, unit| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(i32::from(unit))
    });
    (i64::from(hash).abs() % 100) as u32
}

/// Strict equality, except that numbers compare by value so `3` matches `3.0`.
fn condition_matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => expected == actual,
    }
}

pub fn default_flags() -> Vec<FeatureFlag> {
    vec![
        FeatureFlag::new(
            "new-leaderboard-ui",
            true,
            "Redesigned leaderboard with live rank movement",
        ),
        FeatureFlag::new(
            "badge-notifications",
            true,
            "Notify users when a badge unlocks",
        ),
        FeatureFlag::new(
            "community-terminal",
            true,
            "Community terminal on the dashboard",
        ),
        FeatureFlag::new(
            "advanced-analytics",
            true,
            "Per-challenge analytics for submissions",
        )
        .with_rollout(50.0),
        FeatureFlag::new(
            "beta-challenges",
            false,
            "Challenges still under review",
        ),
    ]
}

/// Shape of the `FEATURE_FLAGS` blob: a list of flags, or an object keyed by
/// flag name whose values omit the name.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlagsBlob {
    List(Vec<FeatureFlag>),
    Keyed(BTreeMap<String, Value>),
}

#[derive(Debug, Default)]
pub struct FeatureFlagsService {
    flags: DashMap<String, FeatureFlag>,
}

impl FeatureFlagsService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from configuration, then overlay the built-in defaults.
    pub fn from_config(config: &FlexConfig) -> Arc<Self> {
        let service = Self::new();
        if let Some(blob) = &config.feature_flags {
            service.load_from_json(blob);
        }
        service.seed_defaults();
        info!("Loaded {} feature flags", service.flags.len());
        Arc::new(service)
    }

    /// Best-effort load. Returns the number of flags loaded; a malformed blob
    /// is logged and loads nothing.
    pub fn load_from_json(&self, blob: &str) -> usize {
        let parsed: FlagsBlob = match serde_json::from_str(blob) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Failed to parse FEATURE_FLAGS: {e}");
                return 0;
            }
        };

        let flags: Vec<FeatureFlag> = match parsed {
            FlagsBlob::List(list) => list,
            FlagsBlob::Keyed(map) => map
                .into_iter()
                .filter_map(|(name, mut value)| {
                    if let Value::Object(obj) = &mut value {
                        obj.entry("name").or_insert_with(|| Value::String(name.clone()));
                    }
                    match serde_json::from_value::<FeatureFlag>(value) {
                        Ok(flag) => Some(flag),
                        Err(e) => {
                            error!("Skipping feature flag `{name}` from FEATURE_FLAGS: {e}");
                            None
                        }
                    }
                })
                .collect(),
        };

        let count = flags.len();
        for flag in flags {
            self.flags.insert(flag.name.clone(), flag);
        }
        count
    }

    /// Add the built-in defaults that are not already present.
    pub fn seed_defaults(&self) {
        for flag in default_flags() {
            self.flags.entry(flag.name.clone()).or_insert(flag);
        }
    }

    pub fn is_enabled(&self, flag_name: &str, context: Option<&FlagContext>) -> bool {
        let Some(flag) = self.flags.get(flag_name) else {
            warn!("Feature flag `{flag_name}` not found");
            return false;
        };

        if !flag.enabled {
            return false;
        }

        let user_id = context.and_then(|c| c.user_id.as_deref());
        let tenant_id = context.and_then(|c| c.tenant_id.as_deref());

        if let (Some(pct), Some(user)) = (flag.rollout_percentage, user_id) {
            if f64::from(rollout_bucket(user)) > pct {
                return false;
            }
        }

        if let (Some(users), Some(user)) = (&flag.target_users, user_id) {
            if !users.iter().any(|u| u == user) {
                return false;
            }
        }

        if let (Some(tenants), Some(tenant)) = (&flag.target_tenants, tenant_id) {
            if !tenants.iter().any(|t| t == tenant) {
                return false;
            }
        }

        if let Some(conditions) = &flag.conditions {
            let matched = conditions.iter().all(|(key, expected)| {
                context
                    .and_then(|c| c.lookup(key))
                    .is_some_and(|actual| condition_matches(expected, &actual))
            });
            if !matched {
                debug!("Feature flag `{flag_name}` conditions not met");
                return false;
            }
        }

        true
    }

    pub fn add_flag(&self, flag: FeatureFlag) {
        info!("Feature flag `{}` added (enabled={})", flag.name, flag.enabled);
        self.flags.insert(flag.name.clone(), flag);
    }

    /// Shallow merge. Returns false, and changes nothing, if the flag is unknown.
    pub fn update_flag(&self, flag_name: &str, update: FlagUpdate) -> bool {
        match self.flags.get_mut(flag_name) {
            Some(mut flag) => {
                flag.merge(update);
                info!("Feature flag `{flag_name}` updated (enabled={})", flag.enabled);
                true
            }
            None => {
                warn!("Cannot update unknown feature flag `{flag_name}`");
                false
            }
        }
    }

    pub fn remove_flag(&self, flag_name: &str) -> bool {
        let removed = self.flags.remove(flag_name).is_some();
        if removed {
            info!("Feature flag `{flag_name}` removed");
        }
        removed
    }

    pub fn get_flag(&self, flag_name: &str) -> Option<FeatureFlag> {
        self.flags.get(flag_name).map(|f| f.value().clone())
    }

    /// All flags, sorted by name.
    pub fn get_all_flags(&self) -> Vec<FeatureFlag> {
        let mut all: Vec<FeatureFlag> = self.flags.iter().map(|kv| kv.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn service_with(flag: FeatureFlag) -> FeatureFlagsService {
        let svc = FeatureFlagsService::new();
        svc.add_flag(flag);
        svc
    }

    #[test]
    fn bucket_matches_rolling_hash() {
        assert_eq!(rollout_bucket(""), 0);
        assert_eq!(rollout_bucket("a"), 97);
        // 97 * 31 + 98 = 3105
        assert_eq!(rollout_bucket("ab"), 5);
        // 'A' is 65
        assert_eq!(rollout_bucket("AA"), (65 * 31 + 65) % 100);
    }

    #[test]
    fn bucket_handles_overflow_and_negative_hashes() {
        let long = "vulhub-user-".repeat(50);
        let first = rollout_bucket(&long);
        assert!(first < 100);
        assert_eq!(first, rollout_bucket(&long));
    }

    #[test]
    fn unknown_flag_is_disabled() {
        let svc = FeatureFlagsService::new();
        assert!(!svc.is_enabled("does-not-exist", None));
        assert!(!svc.is_enabled("does-not-exist", Some(&FlagContext::for_user("u1"))));
    }

    #[test]
    fn disabled_flag_short_circuits() {
        let svc = service_with(FeatureFlag::new("off", false, "").with_target_users(["u1"]));
        assert!(!svc.is_enabled("off", Some(&FlagContext::for_user("u1"))));
    }

    #[test]
    fn rollout_compares_bucket_strictly_greater() {
        // "a" lands in bucket 97
        let svc = service_with(FeatureFlag::new("r", true, "").with_rollout(96.0));
        assert!(!svc.is_enabled("r", Some(&FlagContext::for_user("a"))));

        svc.update_flag("r", FlagUpdate { rollout_percentage: Some(97.0), ..Default::default() });
        assert!(svc.is_enabled("r", Some(&FlagContext::for_user("a"))));
    }

    #[test]
    fn rollout_is_deterministic_per_user() {
        let svc = service_with(FeatureFlag::new("r", true, "").with_rollout(30.0));
        for user in ["alice", "bob", "carol", "dave", "user-42"] {
            let ctx = FlagContext::for_user(user);
            let first = svc.is_enabled("r", Some(&ctx));
            for _ in 0..10 {
                assert_eq!(svc.is_enabled("r", Some(&ctx)), first);
            }
            assert_eq!(first, f64::from(rollout_bucket(user)) <= 30.0);
        }
    }

    #[test]
    fn zero_rollout_only_admits_bucket_zero() {
        let svc = service_with(FeatureFlag::new("beta", true, "").with_rollout(0.0));
        // 'ab' -> bucket 5
        assert!(!svc.is_enabled("beta", Some(&FlagContext::for_user("ab"))));
        assert!(!svc.is_enabled("beta", Some(&FlagContext::for_user("a"))));
        for user in ["x", "y", "z", "player-1"] {
            let expected = rollout_bucket(user) == 0;
            assert_eq!(svc.is_enabled("beta", Some(&FlagContext::for_user(user))), expected);
        }
    }

    #[test]
    fn rollout_without_user_is_skipped() {
        let svc = service_with(FeatureFlag::new("r", true, "").with_rollout(0.0));
        assert!(svc.is_enabled("r", None));
        assert!(svc.is_enabled("r", Some(&FlagContext::default())));
    }

    #[test]
    fn target_users_gate() {
        let svc = service_with(FeatureFlag::new("t", true, "").with_target_users(["u1"]));
        assert!(svc.is_enabled("t", Some(&FlagContext::for_user("u1"))));
        assert!(!svc.is_enabled("t", Some(&FlagContext::for_user("u2"))));
    }

    #[test]
    fn target_tenants_gate() {
        let svc = service_with(FeatureFlag::new("t", true, "").with_target_tenants(["csus"]));
        let ok = FlagContext::for_user("u1").with_tenant("csus");
        let other = FlagContext::for_user("u1").with_tenant("ucla");
        assert!(svc.is_enabled("t", Some(&ok)));
        assert!(!svc.is_enabled("t", Some(&other)));
    }

    #[test]
    fn conditions_require_exact_values() {
        let svc = service_with(
            FeatureFlag::new("c", true, "")
                .with_condition("role", json!("admin"))
                .with_condition("tenantId", json!("csus")),
        );
        let ok = FlagContext::for_user("u1")
            .with_tenant("csus")
            .with_attribute("role", json!("admin"));
        let wrong_role = ok.clone().with_attribute("role", json!("student"));
        let missing = FlagContext::for_user("u1").with_tenant("csus");

        assert!(svc.is_enabled("c", Some(&ok)));
        assert!(!svc.is_enabled("c", Some(&wrong_role)));
        assert!(!svc.is_enabled("c", Some(&missing)));
        assert!(!svc.is_enabled("c", None));
    }

    #[test]
    fn numeric_conditions_compare_by_value() {
        let svc = service_with(FeatureFlag::new("lvl", true, "").with_condition("level", json!(3)));
        let float = FlagContext::for_user("u1").with_attribute("level", json!(3.0));
        let int = FlagContext::for_user("u1").with_attribute("level", json!(3));
        let other = FlagContext::for_user("u1").with_attribute("level", json!(3.5));
        let text = FlagContext::for_user("u1").with_attribute("level", json!("3"));

        assert!(svc.is_enabled("lvl", Some(&float)));
        assert!(svc.is_enabled("lvl", Some(&int)));
        assert!(!svc.is_enabled("lvl", Some(&other)));
        assert!(!svc.is_enabled("lvl", Some(&text)));
    }

    #[test]
    fn query_attributes_become_typed() {
        let ctx = FlagContext::for_user("007")
            .with_attribute("premium", json!("true"))
            .with_attribute("level", json!("3"))
            .with_attribute("plan", json!("pro"))
            .with_typed_attributes();
        assert_eq!(ctx.lookup("premium"), Some(json!(true)));
        assert_eq!(ctx.lookup("level"), Some(json!(3)));
        assert_eq!(ctx.lookup("plan"), Some(json!("pro")));
        // the typed fields are never coerced
        assert_eq!(ctx.lookup("userId"), Some(json!("007")));
    }

    #[test]
    fn unknown_flag_logs_a_warning() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || CaptureWriter(Arc::clone(&sink)))
            .finish();

        let svc = FeatureFlagsService::new();
        let enabled = tracing::subscriber::with_default(subscriber, || svc.is_enabled("ghost-flag", None));
        assert!(!enabled);

        let logs = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("ghost-flag"), "{logs}");
    }

    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CaptureWriter {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn update_is_shallow_merge_and_noop_when_missing() {
        let svc = service_with(
            FeatureFlag::new("m", true, "original").with_target_users(["u1"]),
        );
        assert!(svc.update_flag("m", FlagUpdate::enabled(false)));
        let flag = svc.get_flag("m").unwrap();
        assert!(!flag.enabled);
        assert_eq!(flag.description, "original");
        assert_eq!(flag.target_users, Some(vec!["u1".to_string()]));

        assert!(!svc.update_flag("ghost", FlagUpdate::enabled(true)));
        assert!(svc.get_flag("ghost").is_none());
    }

    #[test]
    fn remove_and_list() {
        let svc = FeatureFlagsService::new();
        svc.add_flag(FeatureFlag::new("b", true, ""));
        svc.add_flag(FeatureFlag::new("a", true, ""));
        let names: Vec<_> = svc.get_all_flags().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(svc.remove_flag("a"));
        assert!(!svc.remove_flag("a"));
        assert_eq!(svc.get_all_flags().len(), 1);
    }

    #[test]
    fn env_blob_list_and_keyed_forms() {
        let svc = FeatureFlagsService::new();
        let loaded = svc.load_from_json(
            r#"[{"name":"beta","enabled":true,"rolloutPercentage":0,"description":"b"}]"#,
        );
        assert_eq!(loaded, 1);
        assert_eq!(svc.get_flag("beta").unwrap().rollout_percentage, Some(0.0));

        let loaded = svc.load_from_json(
            r#"{"dark-mode":{"enabled":false},"labs":{"enabled":true,"targetTenants":["csus"]}}"#,
        );
        assert_eq!(loaded, 2);
        assert!(!svc.get_flag("dark-mode").unwrap().enabled);
        assert_eq!(
            svc.get_flag("labs").unwrap().target_tenants,
            Some(vec!["csus".to_string()])
        );
    }

    #[test]
    fn malformed_blob_still_gets_defaults() {
        let config = FlexConfig {
            feature_flags: Some("{not json".to_string()),
            ..FlexConfig::default()
        };
        let svc = FeatureFlagsService::from_config(&config);
        assert_eq!(svc.get_all_flags().len(), default_flags().len());
    }

    #[test]
    fn env_flags_win_over_defaults() {
        let config = FlexConfig {
            feature_flags: Some(
                r#"[{"name":"beta-challenges","enabled":true,"description":"open beta"}]"#.into(),
            ),
            ..FlexConfig::default()
        };
        let svc = FeatureFlagsService::from_config(&config);
        let beta = svc.get_flag("beta-challenges").unwrap();
        assert!(beta.enabled);
        assert_eq!(beta.description, "open beta");
        assert_eq!(svc.get_all_flags().len(), default_flags().len());
    }

    #[test]
    fn context_deserializes_extra_attributes() {
        let ctx: FlagContext =
            serde_json::from_value(json!({"userId": "u1", "plan": "pro"})).unwrap();
        assert_eq!(ctx.lookup("userId"), Some(json!("u1")));
        assert_eq!(ctx.lookup("plan"), Some(json!("pro")));
        assert_eq!(ctx.lookup("tenantId"), None);
    }
}
