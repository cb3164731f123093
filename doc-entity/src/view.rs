use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    Error,
    codec::{DISCRIMINATOR, Document},
    filter::parse_count,
    registered_models,
    utils::capitalize,
};

pub const CONNECTOR_DESIGN_DOCUMENT: &str = "connector";
pub const BY_MODEL_NAME_VIEW: &str = "byModelName";
pub const QUERY_DESIGN_DOCUMENT: &str = "query";

/// Whether a view may answer from an index that lags behind recent writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stale {
    #[default]
    #[serde(rename = "false")]
    False,
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "update_after")]
    UpdateAfter,
}

impl Stale {
    pub(crate) fn parse(value: &Value) -> Result<Stale, Error> {
        match value {
            Value::Bool(false) => Ok(Stale::False),
            Value::Bool(true) => Ok(Stale::Ok),
            Value::Number(n) => match n.as_u64() {
                Some(1) => Ok(Stale::False),
                Some(2) => Ok(Stale::Ok),
                Some(3) => Ok(Stale::UpdateAfter),
                _ => Err(Error::invalid("stale", format!("unknown mode {}", n))),
            },
            Value::String(s) => match s.as_str() {
                "false" | "before" => Ok(Stale::False),
                "ok" | "none" => Ok(Stale::Ok),
                "update_after" | "after" => Ok(Stale::UpdateAfter),
                _ => Err(Error::invalid("stale", format!("unknown mode {:?}", s))),
            },
            other => Err(Error::invalid("stale", format!("unknown mode {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stale::False => "false",
            Stale::Ok => "ok",
            Stale::UpdateAfter => "update_after",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ViewOrder {
    #[default]
    Ascending,
    Descending,
}

impl ViewOrder {
    fn parse(value: &Value) -> Result<ViewOrder, Error> {
        match value {
            Value::Number(n) if n.as_u64() == Some(1) => Ok(ViewOrder::Ascending),
            Value::Number(n) if n.as_u64() == Some(2) => Ok(ViewOrder::Descending),
            Value::String(s) if s.eq_ignore_ascii_case("asc") || s.eq_ignore_ascii_case("ascending") => {
                Ok(ViewOrder::Ascending)
            }
            Value::String(s) if s.eq_ignore_ascii_case("desc") || s.eq_ignore_ascii_case("descending") => {
                Ok(ViewOrder::Descending)
            }
            other => Err(Error::invalid("order", format!("unknown order {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnError {
    Continue,
    #[default]
    Stop,
}

impl OnError {
    fn parse(value: &Value) -> Result<OnError, Error> {
        match value {
            Value::Number(n) if n.as_u64() == Some(1) => Ok(OnError::Continue),
            Value::Number(n) if n.as_u64() == Some(2) => Ok(OnError::Stop),
            Value::String(s) if s == "continue" => Ok(OnError::Continue),
            Value::String(s) if s == "stop" => Ok(OnError::Stop),
            other => Err(Error::invalid("on_error", format!("unknown mode {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub start: Option<Value>,
    pub end: Option<Value>,
    /// Unset means the server default, inclusive.
    pub inclusive_end: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewQuery {
    pub design_document: String,
    pub view: String,
    pub stale: Stale,
    pub order: ViewOrder,
    pub on_error: OnError,
    pub group: Option<bool>,
    pub group_level: Option<u64>,
    pub key: Option<Value>,
    pub keys: Option<Vec<Value>>,
    pub include_docs: bool,
    pub full_set: Option<bool>,
    pub limit: Option<usize>,
    pub range: Option<KeyRange>,
    pub id_range: Option<IdRange>,
    pub custom: BTreeMap<String, Value>,
}

impl ViewQuery {
    pub fn from(design_document: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            design_document: design_document.into(),
            view: view.into(),
            stale: Stale::default(),
            order: ViewOrder::default(),
            on_error: OnError::default(),
            group: None,
            group_level: None,
            key: None,
            keys: None,
            include_docs: false,
            full_set: None,
            limit: None,
            range: None,
            id_range: None,
            custom: BTreeMap::new(),
        }
    }

    /// Builds a query from a loose options object. `options` is only read;
    /// callers may hand the same object to several builds.
    pub fn build(
        design_document: &str,
        view: &str,
        options: Option<&Map<String, Value>>,
        default_stale: Stale,
    ) -> Result<ViewQuery, Error> {
        let mut query = ViewQuery::from(design_document, view).stale(default_stale);
        let Some(options) = options else {
            return Ok(query);
        };
        for (name, value) in options {
            if value.is_null() {
                continue;
            }
            query = match name.as_str() {
                "stale" => query.stale(Stale::parse(value)?),
                "order" => query.order(ViewOrder::parse(value)?),
                "group" => query.group(expect_bool(name, value)?),
                "group_level" => query.group_level(expect_u64(name, value)?),
                "key" => query.key(value.clone()),
                "keys" => match value {
                    Value::Array(keys) => query.keys(keys.clone()),
                    _ => return Err(Error::invalid(name.as_str(), "expected an array")),
                },
                "include_docs" => query.include_docs(expect_bool(name, value)?),
                "full_set" => query.full_set(expect_bool(name, value)?),
                "on_error" => query.on_error(OnError::parse(value)?),
                "limit" => match parse_count(name, value)? {
                    Some(limit) => query.limit(limit),
                    None => query,
                },
                "range" => {
                    let args = expect_args(name, value, 3)?;
                    let inclusive_end = match args.get(2) {
                        None | Some(Value::Null) => None,
                        Some(flag) => Some(expect_bool(name, flag)?),
                    };
                    query.range(arg(args, 0), arg(args, 1), inclusive_end)
                }
                "id_range" => {
                    let args = expect_args(name, value, 2)?;
                    query.id_range(
                        arg(args, 0).map(|v| id_arg(name, v)).transpose()?,
                        arg(args, 1).map(|v| id_arg(name, v)).transpose()?,
                    )
                }
                _ => query.custom(name.clone(), value.clone()),
            };
        }
        Ok(query)
    }

    pub fn stale(mut self, stale: Stale) -> Self {
        self.stale = stale;
        self
    }

    pub fn order(mut self, order: ViewOrder) -> Self {
        self.order = order;
        self
    }

    pub fn group(mut self, group: bool) -> Self {
        self.group = Some(group);
        self
    }

    pub fn group_level(mut self, level: u64) -> Self {
        self.group_level = Some(level);
        self
    }

    pub fn key(mut self, key: Value) -> Self {
        self.key = Some(key);
        self
    }

    pub fn keys(mut self, keys: Vec<Value>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn include_docs(mut self, include_docs: bool) -> Self {
        self.include_docs = include_docs;
        self
    }

    pub fn full_set(mut self, full_set: bool) -> Self {
        self.full_set = Some(full_set);
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn range(
        mut self,
        start: Option<Value>,
        end: Option<Value>,
        inclusive_end: Option<bool>,
    ) -> Self {
        self.range = Some(KeyRange {
            start,
            end,
            inclusive_end,
        });
        self
    }

    pub fn id_range(mut self, start: Option<String>, end: Option<String>) -> Self {
        self.id_range = Some(IdRange { start, end });
        self
    }

    pub fn custom(mut self, name: impl Into<String>, value: Value) -> Self {
        self.custom.insert(name.into(), value);
        self
    }

    pub fn skip(&self) -> usize {
        self.custom
            .get("skip")
            .and_then(|v| parse_count("skip", v).ok().flatten())
            .unwrap_or(0)
    }

    /// The query string parameters of the view REST endpoint.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("stale".to_string(), self.stale.as_str().to_string()),
            (
                "descending".to_string(),
                (self.order == ViewOrder::Descending).to_string(),
            ),
            (
                "on_error".to_string(),
                match self.on_error {
                    OnError::Continue => "continue",
                    OnError::Stop => "stop",
                }
                .to_string(),
            ),
        ];
        if let Some(group) = self.group {
            params.push(("group".into(), group.to_string()));
        }
        if let Some(level) = self.group_level {
            params.push(("group_level".into(), level.to_string()));
        }
        if let Some(key) = &self.key {
            params.push(("key".into(), key.to_string()));
        }
        if let Some(keys) = &self.keys {
            params.push(("keys".into(), Value::Array(keys.clone()).to_string()));
        }
        if self.include_docs {
            params.push(("include_docs".into(), "true".into()));
        }
        if let Some(full_set) = self.full_set {
            params.push(("full_set".into(), full_set.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        if let Some(range) = &self.range {
            if let Some(start) = &range.start {
                params.push(("startkey".into(), start.to_string()));
            }
            if let Some(end) = &range.end {
                params.push(("endkey".into(), end.to_string()));
            }
            if let Some(inclusive_end) = range.inclusive_end {
                params.push(("inclusive_end".into(), inclusive_end.to_string()));
            }
        }
        if let Some(id_range) = &self.id_range {
            if let Some(start) = &id_range.start {
                params.push(("startkey_docid".into(), start.clone()));
            }
            if let Some(end) = &id_range.end {
                params.push(("endkey_docid".into(), end.clone()));
            }
        }
        for (name, value) in &self.custom {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.push((name.clone(), value));
        }
        params
    }
}

fn expect_bool(name: &str, value: &Value) -> Result<bool, Error> {
    value
        .as_bool()
        .ok_or_else(|| Error::invalid(name, format!("{} is not a boolean", value)))
}

fn expect_u64(name: &str, value: &Value) -> Result<u64, Error> {
    value
        .as_u64()
        .ok_or_else(|| Error::invalid(name, format!("{} is not a non-negative integer", value)))
}

fn expect_args<'a>(name: &str, value: &'a Value, max: usize) -> Result<&'a [Value], Error> {
    match value {
        Value::Array(args) if args.len() <= max => Ok(args.as_slice()),
        _ => Err(Error::invalid(
            name,
            format!("expected an array of at most {} arguments", max),
        )),
    }
}

fn arg(args: &[Value], index: usize) -> Option<Value> {
    args.get(index).filter(|v| !v.is_null()).cloned()
}

fn id_arg(name: &str, value: Value) -> Result<String, Error> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(Error::invalid(name, format!("{} is not a document id", other))),
    }
}

pub fn sorted_fields<S: AsRef<str>>(fields: &[S]) -> Vec<String> {
    let set: BTreeSet<String> = fields.iter().map(|f| f.as_ref().to_string()).collect();
    set.into_iter().collect()
}

/// `["name", "age"]` becomes `byAgeAndName`.
pub fn view_name<S: AsRef<str>>(fields: &[S]) -> String {
    let names: Vec<String> = sorted_fields(fields).iter().map(|f| capitalize(f)).collect();
    format!("by{}", names.join("And"))
}

/// The view name and key that find documents of `model` whose fields equal
/// the given values.
pub fn compose_key(model: &str, values: &[(&str, &Value)]) -> (String, Value) {
    let mut values = values.to_vec();
    values.sort_by(|a, b| a.0.cmp(b.0));
    values.dedup_by(|a, b| a.0 == b.0);
    let names: Vec<&str> = values.iter().map(|(name, _)| *name).collect();
    let mut key = vec![Value::String(model.to_string())];
    key.extend(values.iter().map(|(_, value)| (*value).clone()));
    (view_name(&names), Value::Array(key))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Emit {
    /// `doc._type`
    ModelName,
    /// `[doc._type, doc.f1, doc.f2, ...]`
    Fields { fields: Vec<String> },
}

impl Emit {
    pub fn key(&self, document: &Document) -> Option<Value> {
        let model = document.get(DISCRIMINATOR).filter(|v| v.is_string())?;
        match self {
            Emit::ModelName => Some(model.clone()),
            Emit::Fields { fields } => {
                let mut key = vec![model.clone()];
                key.extend(
                    fields
                        .iter()
                        .map(|f| document.get(f).cloned().unwrap_or(Value::Null)),
                );
                Some(Value::Array(key))
            }
        }
    }

    fn map_source(&self) -> String {
        let emitted = match self {
            Emit::ModelName => "doc._type".to_string(),
            Emit::Fields { fields } => {
                let mut parts = vec!["doc._type".to_string()];
                parts.extend(fields.iter().map(|f| format!("doc[{}]", json!(f))));
                format!("[{}]", parts.join(", "))
            }
        };
        format!(
            "function(doc, meta) {{\n  if (doc._type) {{\n    emit({}, null);\n  }}\n}}",
            emitted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
    /// Present on views generated here; hand-written views carry only `map`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emit: Option<Emit>,
}

impl ViewDefinition {
    pub fn generated(emit: Emit) -> Self {
        Self {
            map: emit.map_source(),
            reduce: None,
            emit: Some(emit),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesignDocument {
    #[serde(default)]
    pub views: BTreeMap<String, ViewDefinition>,
}

/// `connector.byModelName`, the view behind unconstrained finds.
pub fn default_design_documents() -> BTreeMap<String, DesignDocument> {
    let mut connector = DesignDocument::default();
    connector.views.insert(
        BY_MODEL_NAME_VIEW.to_string(),
        ViewDefinition::generated(Emit::ModelName),
    );
    BTreeMap::from([(CONNECTOR_DESIGN_DOCUMENT.to_string(), connector)])
}

/// Field-sets declared for compound views, per model.
///
/// Sets come from two places: `#[derive(Model)]` declarations collected at
/// link time and [`ViewRegistry::register`] calls at schema-setup time.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    field_sets: RwLock<BTreeMap<String, BTreeSet<Vec<String>>>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that `model` is queried by equality on `fields`; returns the
    /// view name that will serve it.
    pub fn register<S: AsRef<str>>(&self, model: &str, fields: &[S]) -> String {
        let fields = sorted_fields(fields);
        let name = view_name(&fields);
        self.field_sets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(model.to_string())
            .or_default()
            .insert(fields);
        name
    }

    pub fn contains<S: AsRef<str>>(&self, model: &str, fields: &[S]) -> bool {
        let fields = sorted_fields(fields);
        self.field_sets(Some(std::slice::from_ref(&model)))
            .contains(&fields)
    }

    pub fn field_sets(&self, models: Option<&[&str]>) -> BTreeSet<Vec<String>> {
        let wanted = |model: &str| models.is_none_or(|models| models.contains(&model));
        let mut sets = BTreeSet::new();
        for (model, declared) in self
            .field_sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            if wanted(model) {
                sets.extend(declared.iter().cloned());
            }
        }
        for meta in registered_models() {
            if wanted(meta.model_name) {
                sets.extend(
                    (meta.view_field_sets)()
                        .iter()
                        .filter(|fields| !fields.is_empty())
                        .map(|fields| sorted_fields(fields)),
                );
            }
        }
        sets
    }

    pub fn design_document(&self, models: Option<&[&str]>) -> DesignDocument {
        let mut document = DesignDocument::default();
        for fields in self.field_sets(models) {
            document.views.insert(
                view_name(&fields),
                ViewDefinition::generated(Emit::Fields { fields }),
            );
        }
        document
    }
}
