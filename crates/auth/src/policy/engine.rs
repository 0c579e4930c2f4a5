use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use casbin::{CoreApi, Enforcer, MemoryAdapter, MgmtApi};
use thiserror::Error;
use tokio::sync::Mutex;

use super::model::PolicyModel;
use super::rule::PolicyRule;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid policy model: {0}")]
    InvalidModel(String),

    #[error("malformed policy rule: {0}")]
    MalformedRule(String),

    #[error("policy source failed: {0}")]
    Source(String),

    #[error("policy evaluation failed: {0}")]
    Evaluation(String),
}

/// Where a full reload pulls its rules from (the relational projection in production).
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn load_rules(&self) -> Result<Vec<PolicyRule>, EngineError>;
}

/// Immutable snapshot of the loaded rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleIndex {
    /// role -> {(path pattern, method pattern)}
    policies: HashMap<String, BTreeSet<(String, String)>>,
    /// member -> {role}
    groupings: HashMap<String, BTreeSet<String>>,
}

impl RuleIndex {
    pub fn from_rules<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = PolicyRule>,
    {
        let mut index = Self::default();
        for rule in rules {
            index.insert(rule);
        }
        index
    }

    fn insert(&mut self, rule: PolicyRule) -> bool {
        match rule {
            PolicyRule::Permission { role, path, method } => {
                self.policies.entry(role).or_default().insert((path, method))
            }
            PolicyRule::Grouping { member, role } => {
                self.groupings.entry(member).or_default().insert(role)
            }
        }
    }

    fn remove(&mut self, rule: &PolicyRule) -> bool {
        match rule {
            PolicyRule::Permission { role, path, method } => {
                remove_from(&mut self.policies, role, &(path.clone(), method.clone()))
            }
            PolicyRule::Grouping { member, role } => remove_from(&mut self.groupings, member, role),
        }
    }

    fn contains(&self, rule: &PolicyRule) -> bool {
        match rule {
            PolicyRule::Permission { role, path, method } => self
                .policies
                .get(role)
                .is_some_and(|set| set.contains(&(path.clone(), method.clone()))),
            PolicyRule::Grouping { member, role } => self
                .groupings
                .get(member)
                .is_some_and(|set| set.contains(role)),
        }
    }

    pub fn len(&self) -> usize {
        self.policies.values().map(BTreeSet::len).sum::<usize>()
            + self.groupings.values().map(BTreeSet::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rules in a stable order.
    pub fn rules(&self) -> Vec<PolicyRule> {
        let mut out: Vec<PolicyRule> = self
            .policies
            .iter()
            .flat_map(|(role, set)| {
                set.iter()
                    .map(move |(path, method)| PolicyRule::permission(role, path, method))
            })
            .chain(self.groupings.iter().flat_map(|(member, roles)| {
                roles.iter().map(move |role| PolicyRule::grouping(member, role))
            }))
            .collect();
        out.sort();
        out
    }

    /// `p` and `g` rows in the shape casbin's management API takes.
    fn casbin_rows(&self) -> (Vec<Vec<String>>, Vec<Vec<String>>) {
        let policies = self
            .policies
            .iter()
            .flat_map(|(role, set)| {
                set.iter()
                    .map(move |(path, method)| vec![role.clone(), path.clone(), method.clone()])
            })
            .collect();
        let groupings = self
            .groupings
            .iter()
            .flat_map(|(member, roles)| roles.iter().map(move |role| vec![member.clone(), role.clone()]))
            .collect();
        (policies, groupings)
    }
}

fn remove_from<V: Ord>(map: &mut HashMap<String, BTreeSet<V>>, key: &str, value: &V) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}

/// A rule index and the enforcer loaded from exactly those rules.
struct Published {
    index: Arc<RuleIndex>,
    enforcer: Enforcer,
}

async fn build_enforcer(model: &PolicyModel, index: RuleIndex) -> Result<Published, EngineError> {
    let mut enforcer = Enforcer::new(model.parse().await?, MemoryAdapter::default())
        .await
        .map_err(|err| EngineError::InvalidModel(err.to_string()))?;

    let (policies, groupings) = index.casbin_rows();
    if !policies.is_empty() {
        enforcer.add_policies(policies).await.map_err(rule_error)?;
    }
    if !groupings.is_empty() {
        enforcer.add_grouping_policies(groupings).await.map_err(rule_error)?;
    }
    enforcer.build_role_links().map_err(rule_error)?;

    Ok(Published {
        index: Arc::new(index),
        enforcer,
    })
}

fn rule_error(err: casbin::Error) -> EngineError {
    EngineError::MalformedRule(err.to_string())
}

#[derive(Debug, Default)]
struct WriterState {
    /// Ticket of the newest full load that has been published.
    applied_load: u64,
}

/// RBAC evaluator backed by a casbin [`Enforcer`].
///
/// Every write builds a fresh enforcer from a new [`RuleIndex`] and publishes
/// the pair with a single pointer swap, so readers never lock and never see a
/// half-loaded rule set. Writers are serialized by an internal mutex. A full
/// load that started earlier never replaces one that started later.
///
/// Role chains are followed by casbin's default role manager, which stops
/// after ten levels.
pub struct PolicyEngine {
    model: PolicyModel,
    current: ArcSwap<Published>,
    writer: Mutex<WriterState>,
    load_tickets: AtomicU64,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("rules", &self.rule_count())
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    pub async fn new(model: PolicyModel) -> Result<Self, EngineError> {
        Self::with_rules(model, Vec::new()).await
    }

    pub async fn with_rules<I>(model: PolicyModel, rules: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = PolicyRule>,
    {
        let published = build_enforcer(&model, RuleIndex::from_rules(rules)).await?;
        Ok(Self {
            model,
            current: ArcSwap::from_pointee(published),
            writer: Mutex::new(WriterState::default()),
            load_tickets: AtomicU64::new(0),
        })
    }

    pub fn model(&self) -> &PolicyModel {
        &self.model
    }

    /// Current rule snapshot. Stays valid (and unchanged) across later reloads.
    pub fn snapshot(&self) -> Arc<RuleIndex> {
        Arc::clone(&self.current.load().index)
    }

    /// Does `subject` (directly or through grouping rules) hold a permission
    /// matching `object` and `action`?
    pub fn enforce(&self, subject: &str, object: &str, action: &str) -> Result<bool, EngineError> {
        self.current
            .load()
            .enforcer
            .enforce((subject, object, action))
            .map_err(|err| EngineError::Evaluation(err.to_string()))
    }

    /// Replace the whole rule set with what `source` currently holds.
    ///
    /// Returns the number of rules now loaded. On error the previous rule set
    /// stays in place.
    pub async fn load_policy(&self, source: &dyn PolicySource) -> Result<usize, EngineError> {
        let ticket = self.load_tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let rules = source.load_rules().await?;
        let index = RuleIndex::from_rules(rules);
        let count = index.len();
        let published = build_enforcer(&self.model, index).await?;

        let mut writer = self.writer.lock().await;
        if ticket > writer.applied_load {
            writer.applied_load = ticket;
            self.current.store(Arc::new(published));
            tracing::debug!(rules = count, ticket, "policy reloaded");
        } else {
            tracing::debug!(ticket, applied = writer.applied_load, "stale policy load discarded");
        }
        Ok(count)
    }

    pub async fn add_policy(
        &self,
        role: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
    ) -> Result<bool, EngineError> {
        self.add_rule(PolicyRule::permission(role, path, method)).await
    }

    pub async fn remove_policy(&self, role: &str, path: &str, method: &str) -> Result<bool, EngineError> {
        self.remove_rule(&PolicyRule::permission(role, path, method)).await
    }

    pub async fn add_grouping(
        &self,
        member: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<bool, EngineError> {
        self.add_rule(PolicyRule::grouping(member, role)).await
    }

    pub async fn remove_grouping(&self, member: &str, role: &str) -> Result<bool, EngineError> {
        self.remove_rule(&PolicyRule::grouping(member, role)).await
    }

    async fn add_rule(&self, rule: PolicyRule) -> Result<bool, EngineError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        if current.contains(&rule) {
            return Ok(false);
        }
        let mut next = RuleIndex::clone(&current);
        next.insert(rule);
        self.current.store(Arc::new(build_enforcer(&self.model, next).await?));
        Ok(true)
    }

    async fn remove_rule(&self, rule: &PolicyRule) -> Result<bool, EngineError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        if !current.contains(rule) {
            return Ok(false);
        }
        let mut next = RuleIndex::clone(&current);
        next.remove(rule);
        self.current.store(Arc::new(build_enforcer(&self.model, next).await?));
        Ok(true)
    }

    /// `(path, method)` pairs attached directly to `role`.
    pub fn policies_for(&self, role: &str) -> Vec<(String, String)> {
        self.snapshot()
            .policies
            .get(role)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Roles `member` is grouped into directly.
    pub fn roles_for_user(&self, member: &str) -> Vec<String> {
        self.snapshot()
            .groupings
            .get(member)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn users_for_role(&self, role: &str) -> Vec<String> {
        let index = self.snapshot();
        let mut users: Vec<String> = index
            .groupings
            .iter()
            .filter(|(_, roles)| roles.contains(role))
            .map(|(member, _)| member.clone())
            .collect();
        users.sort();
        users
    }

    pub fn rule_count(&self) -> usize {
        self.current.load().index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;

    struct StaticSource(Vec<PolicyRule>);

    #[async_trait]
    impl PolicySource for StaticSource {
        async fn load_rules(&self) -> Result<Vec<PolicyRule>, EngineError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl PolicySource for BrokenSource {
        async fn load_rules(&self) -> Result<Vec<PolicyRule>, EngineError> {
            Err(EngineError::Source("connection refused".into()))
        }
    }

    async fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicyModel::default()).await.unwrap()
    }

    #[tokio::test]
    async fn editor_scenario() {
        let e = engine().await;
        e.add_policy("editor", "/docs/*", "GET").await.unwrap();
        e.add_policy("editor", "/docs", "POST").await.unwrap();

        assert!(e.enforce("editor", "/docs/123", "GET").unwrap());
        assert!(!e.enforce("editor", "/docs/123", "DELETE").unwrap());
        assert!(e.enforce("editor", "/docs", "POST").unwrap());
        assert!(!e.enforce("viewer", "/docs/123", "GET").unwrap());
    }

    #[tokio::test]
    async fn method_wildcard_and_param_segments() {
        let e = engine().await;
        e.add_policy("admin", "/*", "*").await.unwrap();
        e.add_policy("support", "/users/:id", "GET").await.unwrap();

        assert!(e.enforce("admin", "/anything/at/all", "PATCH").unwrap());
        assert!(e.enforce("support", "/users/7", "GET").unwrap());
        assert!(!e.enforce("support", "/users/7/roles", "GET").unwrap());
    }

    #[tokio::test]
    async fn path_wildcards_follow_key_match2() {
        let e = engine().await;
        e.add_policy("files", "/files/*.txt", "GET").await.unwrap();
        e.add_policy("docs", "/docs/*", "GET").await.unwrap();

        assert!(e.enforce("files", "/files/report.txt", "GET").unwrap());
        // `/*` expands to `/.*`, so the wildcard spans segments.
        assert!(e.enforce("files", "/files/sub/report.txt", "GET").unwrap());
        assert!(!e.enforce("files", "/files/report.pdf", "GET").unwrap());

        assert!(e.enforce("docs", "/docs/a/b/c", "GET").unwrap());
        assert!(!e.enforce("docs", "/docs", "GET").unwrap());
        assert!(!e.enforce("docs", "/docsx/1", "GET").unwrap());
    }

    #[tokio::test]
    async fn add_and_remove_are_idempotent() {
        let e = engine().await;
        assert!(e.add_policy("editor", "/docs", "GET").await.unwrap());
        assert!(!e.add_policy("editor", "/docs", "GET").await.unwrap());
        assert_eq!(e.rule_count(), 1);

        assert!(e.remove_policy("editor", "/docs", "GET").await.unwrap());
        assert!(!e.remove_policy("editor", "/docs", "GET").await.unwrap());
        assert_eq!(e.rule_count(), 0);
        assert!(!e.enforce("editor", "/docs", "GET").unwrap());

        assert!(e.add_grouping("user:42", "editor").await.unwrap());
        assert!(!e.add_grouping("user:42", "editor").await.unwrap());
        assert!(e.remove_grouping("user:42", "editor").await.unwrap());
        assert!(!e.remove_grouping("user:42", "editor").await.unwrap());
    }

    #[tokio::test]
    async fn grouping_chains_resolve_transitively() {
        let e = engine().await;
        e.add_policy("reader", "/docs/*", "GET").await.unwrap();
        e.add_grouping("editor", "reader").await.unwrap();
        e.add_grouping("user:42", "editor").await.unwrap();

        assert!(e.enforce("user:42", "/docs/1", "GET").unwrap());
        assert!(e.enforce("editor", "/docs/1", "GET").unwrap());
        assert!(!e.enforce("reader", "/docs", "GET").unwrap());
        assert_eq!(e.roles_for_user("user:42"), vec!["editor".to_string()]);
        assert_eq!(e.users_for_role("reader"), vec!["editor".to_string()]);
    }

    #[tokio::test]
    async fn grouping_cycles_terminate() {
        let e = engine().await;
        e.add_grouping("a", "b").await.unwrap();
        e.add_grouping("b", "a").await.unwrap();
        assert!(!e.enforce("a", "/x", "GET").unwrap());
    }

    #[tokio::test]
    async fn load_policy_replaces_everything() {
        let e = engine().await;
        e.add_policy("stale", "/old", "GET").await.unwrap();

        let source = StaticSource(vec![
            PolicyRule::permission("editor", "/docs/*", "GET"),
            PolicyRule::grouping("user:42", "editor"),
        ]);
        let loaded = e.load_policy(&source).await.unwrap();

        assert_eq!(loaded, 2);
        assert!(!e.enforce("stale", "/old", "GET").unwrap());
        assert!(e.enforce("editor", "/docs/1", "GET").unwrap());
        assert!(e.enforce("user:42", "/docs/1", "GET").unwrap());
        assert_eq!(e.policies_for("editor"), vec![("/docs/*".to_string(), "GET".to_string())]);
    }

    #[tokio::test]
    async fn failed_load_keeps_previous_rules() {
        let e = engine().await;
        e.add_policy("editor", "/docs", "GET").await.unwrap();

        let err = e.load_policy(&BrokenSource).await.unwrap_err();
        assert!(matches!(err, EngineError::Source(_)));
        assert!(e.enforce("editor", "/docs", "GET").unwrap());
    }

    #[tokio::test]
    async fn invalid_model_is_rejected_at_construction() {
        let model = PolicyModel::from_conf("[request_definition]\nr = sub, obj, act\n");
        assert!(matches!(
            PolicyEngine::new(model).await,
            Err(EngineError::InvalidModel(_))
        ));
    }

    #[tokio::test]
    async fn snapshots_taken_before_reload_are_untouched() {
        let e = engine().await;
        let old: Vec<PolicyRule> = (0..50)
            .map(|i| PolicyRule::permission("old", format!("/o/{i}"), "GET"))
            .collect();
        e.load_policy(&StaticSource(old.clone())).await.unwrap();

        let before = e.snapshot();
        let new: Vec<PolicyRule> = (0..80)
            .map(|i| PolicyRule::permission("new", format!("/n/{i}"), "GET"))
            .collect();
        e.load_policy(&StaticSource(new.clone())).await.unwrap();

        let mut old_sorted = old;
        old_sorted.sort();
        assert_eq!(before.rules(), old_sorted);
        assert_eq!(e.snapshot().len(), 80);
        assert!(!e.enforce("old", "/o/1", "GET").unwrap());
    }

    #[test]
    fn concurrent_readers_see_whole_rule_sets() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let e = Arc::new(runtime.block_on(engine()));
        let set_a: Vec<PolicyRule> = (0..20)
            .map(|i| PolicyRule::permission("a", format!("/a/{i}"), "GET"))
            .collect();
        let set_b: Vec<PolicyRule> = (0..30)
            .map(|i| PolicyRule::permission("b", format!("/b/{i}"), "GET"))
            .collect();

        runtime.block_on(e.load_policy(&StaticSource(set_a.clone()))).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let e = Arc::clone(&e);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let len = e.snapshot().len();
                        assert!(len == 20 || len == 30, "observed partial index of {len} rules");
                        let a = e.enforce("a", "/a/19", "GET").unwrap();
                        let b = e.enforce("b", "/b/29", "GET").unwrap();
                        assert!(a != b, "enforcer mixed two rule sets");
                    }
                })
            })
            .collect();

        for round in 0..100 {
            let rules = if round % 2 == 0 { &set_b } else { &set_a };
            runtime.block_on(e.load_policy(&StaticSource(rules.clone()))).unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    fn engine_with(rules: Vec<PolicyRule>) -> PolicyEngine {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime
            .block_on(PolicyEngine::with_rules(PolicyModel::default(), rules))
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn literal_paths_match_themselves(segs in proptest::collection::vec("[a-z0-9]{1,8}", 0..6)) {
            let path = format!("/{}", segs.join("/"));
            let e = engine_with(vec![PolicyRule::permission("r", &path, "GET")]);
            prop_assert!(e.enforce("r", &path, "GET").unwrap());
        }

        #[test]
        fn prefix_wildcard_covers_any_suffix(
            prefix in "[a-z]{1,8}",
            suffix in proptest::collection::vec("[a-z0-9]{0,6}", 1..4),
            method in "[A-Z]{3,7}",
        ) {
            let e = engine_with(vec![PolicyRule::permission("r", format!("/{prefix}/*"), "*")]);
            let value = format!("/{prefix}/{}", suffix.join("/"));
            prop_assert!(e.enforce("r", &value, &method).unwrap());
        }
    }
}
