//! Schema-driven payload transformation.
//!
//! For every (destination, trigger) pair an operator may configure a field
//! mapping and actor enrichment. The first payload seen for a pair is
//! captured as an example so the operator has something to map against.
//!
//! Field mappings work on dot paths: the payload is flattened into
//! `a.b.0.c` style paths, explicit `source -> target` moves are applied and
//! the remaining paths are optionally copied through before the nested
//! structure is rebuilt.

use std::{collections::HashMap, sync::Arc};

use hookrelay_core::{
    models::{ActorRecord, DestinationId, FieldMapping},
    time::Clock,
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    error::{DeliveryError, Result},
    storage::SchemaStore,
};

/// Containers nested deeper than this are kept whole at their path.
pub const MAX_FLATTEN_DEPTH: usize = 10;

/// Result of transforming one payload for one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    /// Payload to send.
    pub transformed: Value,
    /// Payload before transformation, present only when it changed.
    pub original: Option<Value>,
    /// Whether enrichment or a field mapping was applied.
    pub mapping_applied: bool,
}

impl TransformOutcome {
    fn unchanged(payload: &Value) -> Self {
        Self { transformed: payload.clone(), original: None, mapping_applied: false }
    }
}

/// Host object passed to a trigger, such as a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntity {
    /// Host type name, reported as `__type`.
    pub type_name: String,
    /// Host identifier, if the entity has one.
    pub id: Option<i64>,
    /// Actor view of the entity, when it represents one.
    pub actor: Option<ActorRecord>,
}

impl HostEntity {
    /// Entity that represents an actor.
    pub fn actor(type_name: impl Into<String>, actor: ActorRecord) -> Self {
        Self { type_name: type_name.into(), id: Some(actor.id), actor: Some(actor) }
    }
}

/// One argument a trigger fired with.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerArg {
    /// Scalar, array or map. Serialized as is.
    Value(Value),
    /// Host object. Serialized as `{"__type", "id"}`.
    Entity(HostEntity),
}

impl TriggerArg {
    /// JSON form used in the canonical payload.
    pub fn normalize(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Entity(entity) => {
                let mut object = Map::new();
                object.insert("__type".to_string(), Value::String(entity.type_name.clone()));
                object.insert("id".to_string(), entity.id.map_or(Value::Null, Value::from));
                Value::Object(object)
            },
        }
    }

    /// Positive integer carried by this argument, if any. Numeric strings
    /// count.
    fn positive_id(&self) -> Option<i64> {
        let id = match self {
            Self::Value(Value::Number(n)) => n.as_i64(),
            Self::Value(Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        }?;
        (id > 0).then_some(id)
    }
}

impl From<Value> for TriggerArg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Normalizes trigger arguments for the canonical payload.
pub fn normalize_args(args: &[TriggerArg]) -> Value {
    Value::Array(args.iter().map(TriggerArg::normalize).collect())
}

/// Host lookups for actor enrichment.
#[async_trait::async_trait]
pub trait ActorDirectory: Send + Sync + std::fmt::Debug {
    /// Actor with the given host ID.
    async fn find_by_id(&self, id: i64) -> Option<ActorRecord>;

    /// Actor the host considers current, if any.
    async fn current(&self) -> Option<ActorRecord>;
}

/// Fixed set of actors. Suitable for tests and hosts without a user system.
#[derive(Debug, Clone, Default)]
pub struct InMemoryActorDirectory {
    actors: HashMap<i64, ActorRecord>,
    current: Option<i64>,
}

impl InMemoryActorDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an actor.
    #[must_use]
    pub fn with_actor(mut self, actor: ActorRecord) -> Self {
        self.actors.insert(actor.id, actor);
        self
    }

    /// Sets the current actor.
    #[must_use]
    pub fn with_current(mut self, id: i64) -> Self {
        self.current = Some(id);
        self
    }
}

#[async_trait::async_trait]
impl ActorDirectory for InMemoryActorDirectory {
    async fn find_by_id(&self, id: i64) -> Option<ActorRecord> {
        self.actors.get(&id).cloned()
    }

    async fn current(&self) -> Option<ActorRecord> {
        self.current.filter(|id| *id != 0).and_then(|id| self.actors.get(&id).cloned())
    }
}

/// Where a trigger's actor comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStrategy {
    /// First positive numeric argument is the actor's ID.
    ArgumentId,
    /// First entity argument carrying an actor.
    ArgumentObject,
    /// Host's current actor.
    CurrentActor,
}

/// Trigger to actor strategy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorStrategies {
    strategies: HashMap<String, ActorStrategy>,
}

impl Default for ActorStrategies {
    fn default() -> Self {
        let id_triggers = ["user_register", "profile_update", "delete_user", "set_user_role"];
        let object_triggers = ["wp_login", "password_reset"];
        let current_triggers = ["wp_logout"];

        let strategies = id_triggers
            .into_iter()
            .map(|t| (t, ActorStrategy::ArgumentId))
            .chain(object_triggers.into_iter().map(|t| (t, ActorStrategy::ArgumentObject)))
            .chain(current_triggers.into_iter().map(|t| (t, ActorStrategy::CurrentActor)))
            .map(|(trigger, strategy)| (trigger.to_string(), strategy))
            .collect();

        Self { strategies }
    }
}

impl ActorStrategies {
    /// Table with no entries.
    pub fn empty() -> Self {
        Self { strategies: HashMap::new() }
    }

    /// Adds or replaces the strategy for `trigger`.
    #[must_use]
    pub fn with(mut self, trigger: impl Into<String>, strategy: ActorStrategy) -> Self {
        self.strategies.insert(trigger.into(), strategy);
        self
    }

    /// Strategy for `trigger`, if it supports enrichment.
    pub fn strategy_for(&self, trigger: &str) -> Option<ActorStrategy> {
        self.strategies.get(trigger).copied()
    }

    /// Whether `trigger` supports enrichment.
    pub fn supports(&self, trigger: &str) -> bool {
        self.strategies.contains_key(trigger)
    }

    /// Every trigger that supports enrichment, sorted.
    pub fn triggers(&self) -> Vec<&str> {
        let mut triggers: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        triggers.sort_unstable();
        triggers
    }
}

/// Applies per-destination schemas to dispatched payloads.
#[derive(Clone)]
pub struct PayloadTransformer {
    schemas: Arc<dyn SchemaStore>,
    actors: Arc<dyn ActorDirectory>,
    strategies: ActorStrategies,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PayloadTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadTransformer")
            .field("actors", &self.actors)
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}

impl PayloadTransformer {
    /// Creates a transformer.
    pub fn new(
        schemas: Arc<dyn SchemaStore>,
        actors: Arc<dyn ActorDirectory>,
        strategies: ActorStrategies,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { schemas, actors, strategies, clock }
    }

    /// Enrichment table in use.
    pub fn strategies(&self) -> &ActorStrategies {
        &self.strategies
    }

    /// Transforms `payload` for one destination.
    ///
    /// Without a schema the payload is captured as the pair's example and
    /// returned unchanged. Otherwise actor enrichment and the field mapping
    /// are applied when configured.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the schema lookup or the
    /// example capture fails.
    pub async fn transform(
        &self,
        destination_id: DestinationId,
        trigger: &str,
        payload: &Value,
        args: &[TriggerArg],
    ) -> Result<TransformOutcome> {
        let Some(schema) = self.schemas.find_schema(destination_id, trigger).await? else {
            self.capture_example(destination_id, trigger, payload).await?;
            return Ok(TransformOutcome::unchanged(payload));
        };

        if schema.example_payload.is_none() {
            self.capture_example(destination_id, trigger, payload).await?;
        }

        let mut transformed = payload.clone();
        let mut mapping_applied = false;

        if schema.include_user_data {
            if let Some(actor) = self.resolve_actor(trigger, args).await {
                if let Value::Object(object) = &mut transformed {
                    let user = serde_json::to_value(actor)
                        .map_err(|e| DeliveryError::encoding(e.to_string()))?;
                    object.insert("user".to_string(), user);
                    mapping_applied = true;
                }
            }
        }

        if let Some(mapping) = schema.mapping() {
            transformed = apply_mapping(&transformed, mapping);
            mapping_applied = true;
        }

        Ok(TransformOutcome {
            original: mapping_applied.then(|| payload.clone()),
            transformed,
            mapping_applied,
        })
    }

    async fn capture_example(
        &self,
        destination_id: DestinationId,
        trigger: &str,
        payload: &Value,
    ) -> Result<()> {
        let captured = self
            .schemas
            .capture_example(destination_id, trigger, payload.clone(), self.clock.now_utc())
            .await?;
        if captured {
            debug!(destination_id = %destination_id, trigger, "example payload captured");
        }
        Ok(())
    }

    /// Finds the actor for `trigger` using its configured strategy.
    pub async fn resolve_actor(&self, trigger: &str, args: &[TriggerArg]) -> Option<ActorRecord> {
        match self.strategies.strategy_for(trigger)? {
            ActorStrategy::ArgumentId => {
                let id = args.iter().find_map(TriggerArg::positive_id)?;
                self.actors.find_by_id(id).await
            },
            ActorStrategy::ArgumentObject => args.iter().find_map(|arg| match arg {
                TriggerArg::Entity(HostEntity { actor: Some(actor), .. }) => Some(actor.clone()),
                _ => None,
            }),
            ActorStrategy::CurrentActor => {
                self.actors.current().await.filter(|actor| actor.id != 0)
            },
        }
    }
}

/// Flattens containers into `(dot path, leaf)` pairs in document order.
///
/// Empty objects and arrays are leaves. Containers deeper than
/// `MAX_FLATTEN_DEPTH` are kept whole. A scalar at the root yields no pairs.
pub fn flatten(value: &Value) -> Vec<(String, Value)> {
    let mut pairs = Vec::new();
    flatten_into(value, "", 0, &mut pairs);
    pairs
}

fn flatten_into(value: &Value, prefix: &str, depth: usize, pairs: &mut Vec<(String, Value)>) {
    if depth > MAX_FLATTEN_DEPTH {
        pairs.push((prefix.to_string(), value.clone()));
        return;
    }

    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };

    let mut visit = |path: String, child: &Value| {
        if is_non_empty_container(child) {
            flatten_into(child, &path, depth + 1, pairs);
        } else {
            pairs.push((path, child.clone()));
        }
    };

    match value {
        Value::Object(object) => {
            for (key, child) in object {
                visit(join(key), child);
            }
        },
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                visit(join(&index.to_string()), child);
            }
        },
        _ => {},
    }
}

fn is_non_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(object) => !object.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    }
}

fn array_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Value at a dot path. Numeric segments index arrays and also match
/// object keys.
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Array(items) => array_index(segment).and_then(|index| items.get(index)),
        Value::Object(object) => object.get(segment),
        _ => None,
    })
}

/// Writes `value` at a dot path, creating intermediate objects.
///
/// Every segment, numeric or not, is an object key. Scalars in the way are
/// replaced and arrays in the way become objects keyed by index. A
/// non-object root is replaced by an empty object.
pub fn set_by_path(root: &mut Value, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = root;

    while let Some(segment) = segments.next() {
        let object = as_object(current);
        if segments.peek().is_none() {
            object.insert(segment.to_string(), value);
            return;
        }
        current = object.entry(segment.to_string()).or_insert(Value::Null);
    }
}

fn as_object(value: &mut Value) -> &mut Map<String, Value> {
    if let Value::Array(items) = value {
        let items = std::mem::take(items);
        *value = Value::Object(
            items.into_iter().enumerate().map(|(i, item)| (i.to_string(), item)).collect(),
        );
    }
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(object) => object,
        _ => unreachable!("value normalized to an object above"),
    }
}

/// Turns every non-empty object whose keys are exactly `"0".."n-1"` into an
/// array, bottom-up. Sparse or offset numeric keys stay object keys.
pub fn collapse_index_maps(value: &mut Value) {
    match value {
        Value::Array(items) => items.iter_mut().for_each(collapse_index_maps),
        Value::Object(object) => {
            object.values_mut().for_each(collapse_index_maps);
            if let Some(items) = dense_items(object) {
                *value = Value::Array(items);
            }
        },
        _ => {},
    }
}

fn dense_items(object: &mut Map<String, Value>) -> Option<Vec<Value>> {
    let len = object.len();
    if len == 0 || !(0..len).all(|i| object.contains_key(&i.to_string())) {
        return None;
    }
    (0..len).map(|i| object.remove(&i.to_string())).collect()
}

/// Applies a field mapping to `payload` and returns the rebuilt object.
///
/// Rules with an empty source or target are ignored, as are rules whose
/// source is absent or null. When `include_unmapped` is set, every
/// flattened path that is neither a mapped source nor excluded is copied
/// to the same path. Both checks match the exact path or any path below
/// it, so a mapped source consumes its whole subtree and a moved object is
/// not copied back under its old name.
///
/// The result is built from objects only; afterwards any object below the
/// root whose keys are exactly `0..n` becomes an array.
pub fn apply_mapping(payload: &Value, mapping: &FieldMapping) -> Value {
    let mut result = Value::Object(Map::new());
    let mut consumed: Vec<&str> = Vec::new();

    for rule in &mapping.mappings {
        if rule.source.is_empty() || rule.target.is_empty() {
            continue;
        }
        consumed.push(&rule.source);

        match get_by_path(payload, &rule.source) {
            Some(Value::Null) | None => {},
            Some(value) => set_by_path(&mut result, &rule.target, value.clone()),
        }
    }

    if mapping.include_unmapped {
        for (path, value) in flatten(payload) {
            let covered = |prefix: &str| path == prefix || is_below(&path, prefix);
            if consumed.iter().any(|source| covered(source)) {
                continue;
            }
            if mapping.excluded.iter().any(|excluded| covered(excluded)) {
                continue;
            }
            set_by_path(&mut result, &path, value);
        }
    }

    if let Value::Object(object) = &mut result {
        object.values_mut().for_each(collapse_index_maps);
    }
    result
}

fn is_below(path: &str, prefix: &str) -> bool {
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'.'
}

#[cfg(test)]
mod tests {
    use hookrelay_core::models::MappingRule;
    use serde_json::json;

    use super::*;

    #[test]
    fn flatten_produces_dot_paths_with_indices() {
        let payload = json!({"a": {"b": 1, "c": [true, {"d": null}]}, "e": [], "f": {}});

        let pairs = flatten(&payload);

        assert!(pairs.contains(&("a.b".to_string(), json!(1))));
        assert!(pairs.contains(&("a.c.0".to_string(), json!(true))));
        assert!(pairs.contains(&("a.c.1.d".to_string(), Value::Null)));
        assert!(pairs.contains(&("e".to_string(), json!([]))));
        assert!(pairs.contains(&("f".to_string(), json!({}))));
        assert_eq!(pairs.len(), 5);
    }

    #[test]
    fn get_by_path_reads_arrays_and_objects() {
        let payload = json!({"items": [{"id": 7}], "map": {"0": "zero"}});

        assert_eq!(get_by_path(&payload, "items.0.id"), Some(&json!(7)));
        assert_eq!(get_by_path(&payload, "map.0"), Some(&json!("zero")));
        assert_eq!(get_by_path(&payload, "items"), Some(&json!([{"id": 7}])));
        assert_eq!(get_by_path(&payload, "items.1"), None);
        assert_eq!(get_by_path(&payload, "items.0.id.deeper"), None);
    }

    #[test]
    fn set_by_path_writes_numeric_segments_as_keys() {
        let mut root = json!({});

        set_by_path(&mut root, "list.1.name", json!("second"));
        set_by_path(&mut root, "meta.owner", json!("ops"));

        assert_eq!(root, json!({"list": {"1": {"name": "second"}}, "meta": {"owner": "ops"}}));
    }

    #[test]
    fn set_by_path_replaces_scalars_in_the_way() {
        let mut root = json!({"a": 5});

        set_by_path(&mut root, "a.b", json!(1));

        assert_eq!(root, json!({"a": {"b": 1}}));
    }

    #[test]
    fn set_by_path_keys_existing_arrays_by_index() {
        let mut root = json!({"a": ["x"]});

        set_by_path(&mut root, "a.name", json!("y"));

        assert_eq!(root, json!({"a": {"0": "x", "name": "y"}}));
    }

    #[test]
    fn only_dense_index_maps_collapse_to_arrays() {
        let mut value = json!({
            "dense": {"1": "b", "0": "a"},
            "sparse": {"5": "x"},
            "offset": {"1": "a", "2": "b"},
            "padded": {"00": "a"},
            "nested": {"0": {"0": true}},
            "empty": {}
        });

        collapse_index_maps(&mut value);

        assert_eq!(
            value,
            json!({
                "dense": ["a", "b"],
                "sparse": {"5": "x"},
                "offset": {"1": "a", "2": "b"},
                "padded": {"00": "a"},
                "nested": [[true]],
                "empty": {}
            })
        );
    }

    #[test]
    fn sparse_numeric_keys_survive_pass_through() {
        let payload = json!({"meta": {"5": "x"}, "k": 1});
        let mapping =
            FieldMapping { excluded: vec!["nope".to_string()], ..FieldMapping::default() };

        assert_eq!(apply_mapping(&payload, &mapping), payload);
    }

    #[test]
    fn arrays_survive_pass_through_and_partial_exclusion() {
        let payload = json!({"args": ["a", "b", "c"], "tags": [1, 2]});
        let mapping =
            FieldMapping { excluded: vec!["args.0".to_string()], ..FieldMapping::default() };

        assert_eq!(apply_mapping(&payload, &FieldMapping::default()), payload);
        assert_eq!(
            apply_mapping(&payload, &mapping),
            json!({"args": {"1": "b", "2": "c"}, "tags": [1, 2]})
        );
    }

    #[test]
    fn mapping_moves_fields_and_keeps_the_rest() {
        let payload = json!({"hook": "wp_login", "args": ["alice"], "site": {"url": "https://x"}});
        let mapping = FieldMapping {
            mappings: vec![MappingRule::new("args.0", "username")],
            excluded: vec!["site".to_string()],
            include_unmapped: true,
        };

        let result = apply_mapping(&payload, &mapping);

        assert_eq!(result, json!({"username": "alice", "hook": "wp_login"}));
    }

    #[test]
    fn mapping_without_unmapped_keeps_only_targets() {
        let payload = json!({"a": 1, "b": {"c": 2}});
        let mapping = FieldMapping {
            mappings: vec![MappingRule::new("b", "moved"), MappingRule::new("missing", "x")],
            excluded: vec![],
            include_unmapped: false,
        };

        assert_eq!(apply_mapping(&payload, &mapping), json!({"moved": {"c": 2}}));
    }

    #[test]
    fn mapped_subtree_is_not_copied_again() {
        let payload = json!({"user": {"id": 1, "name": "a"}, "keep": true});
        let mapping = FieldMapping {
            mappings: vec![MappingRule::new("user", "actor")],
            ..FieldMapping::default()
        };

        assert_eq!(
            apply_mapping(&payload, &mapping),
            json!({"actor": {"id": 1, "name": "a"}, "keep": true})
        );
    }

    #[test]
    fn exclusion_matches_prefix_on_segment_boundary_only() {
        let payload = json!({"site": {"url": "u"}, "siteName": "n"});
        let mapping =
            FieldMapping { excluded: vec!["site".to_string()], ..FieldMapping::default() };

        assert_eq!(apply_mapping(&payload, &mapping), json!({"siteName": "n"}));
    }

    #[test]
    fn rules_with_empty_paths_are_ignored() {
        let payload = json!({"a": 1});
        let mapping = FieldMapping {
            mappings: vec![MappingRule::new("", "x"), MappingRule::new("a", "")],
            ..FieldMapping::default()
        };

        assert_eq!(apply_mapping(&payload, &mapping), json!({"a": 1}));
    }

    #[test]
    fn deep_subtrees_are_kept_whole() {
        let mut payload = json!("leaf");
        for _ in 0..15 {
            payload = json!({ "n": payload });
        }

        let pairs = flatten(&payload);

        assert_eq!(pairs.len(), 1);
        let (path, value) = &pairs[0];
        assert_eq!(path.split('.').count(), MAX_FLATTEN_DEPTH + 1);
        assert!(value.is_object());
        assert_eq!(apply_mapping(&payload, &FieldMapping::default()), payload);
    }

    #[test]
    fn entities_normalize_to_type_and_id() {
        let args = vec![
            TriggerArg::Value(json!(42)),
            TriggerArg::Value(json!({"k": "v"})),
            TriggerArg::Entity(HostEntity { type_name: "WP_Post".into(), id: None, actor: None }),
        ];

        assert_eq!(
            normalize_args(&args),
            json!([42, {"k": "v"}, {"__type": "WP_Post", "id": null}])
        );
    }

    #[test]
    fn default_strategy_table_covers_user_triggers() {
        let strategies = ActorStrategies::default();

        assert_eq!(strategies.strategy_for("user_register"), Some(ActorStrategy::ArgumentId));
        assert_eq!(strategies.strategy_for("wp_login"), Some(ActorStrategy::ArgumentObject));
        assert_eq!(strategies.strategy_for("wp_logout"), Some(ActorStrategy::CurrentActor));
        assert!(!strategies.supports("save_post"));
        assert_eq!(strategies.triggers().len(), 7);
    }
}
