// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Associative memory records and the scoring math behind recall.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::entity::new_id;
use crate::domain::Properties;
use crate::error::{FabricError, Result};

/// Memory categories, following the classic episodic/semantic split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Working,
    Procedural,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Working => "working",
            MemoryType::Procedural => "procedural",
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "episodic" => Ok(MemoryType::Episodic),
            "semantic" => Ok(MemoryType::Semantic),
            "working" => Ok(MemoryType::Working),
            "procedural" => Ok(MemoryType::Procedural),
            other => Err(FabricError::validation(format!("unknown memory type: {other}"))),
        }
    }
}

/// A single memory record. After creation only `last_accessed`,
/// `access_count`, and `importance` (through decay) change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: Value,
    pub context: Properties,
    pub memory_type: MemoryType,
    pub timestamp: DateTime<Utc>,
    pub importance: f64,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub embedding: Option<Vec<f32>>,
}

impl MemoryRecord {
    pub fn new(
        content: Value,
        context: Properties,
        memory_type: MemoryType,
        importance: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            content,
            context,
            memory_type,
            timestamp: now,
            importance,
            last_accessed: now,
            access_count: 0,
            embedding: None,
        }
    }

    /// Record an access.
    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }

    /// Importance after exponential time decay, `lambda` per day of age.
    /// Applied lazily on read; the stored importance is untouched.
    pub fn importance_now(&self, now: DateTime<Utc>, lambda: f64) -> f64 {
        let age_days = (now - self.timestamp).num_seconds().max(0) as f64 / 86_400.0;
        self.importance * (-lambda * age_days).exp()
    }

    /// Canonical text projection used to compute the embedding.
    pub fn canonical_text(&self) -> String {
        canonical_text(&self.content, &self.context)
    }

    pub fn to_properties(&self) -> Result<Properties> {
        let mut props = Properties::new();
        props.insert("id".into(), Value::String(self.id.clone()));
        props.insert(
            "content".into(),
            Value::String(serde_json::to_string(&self.content)?),
        );
        props.insert(
            "context".into(),
            Value::String(serde_json::to_string(&self.context)?),
        );
        props.insert(
            "memory_type".into(),
            Value::String(self.memory_type.as_str().to_string()),
        );
        props.insert("timestamp".into(), Value::String(self.timestamp.to_rfc3339()));
        props.insert("importance".into(), json_number(self.importance));
        props.insert(
            "last_accessed".into(),
            Value::String(self.last_accessed.to_rfc3339()),
        );
        props.insert("access_count".into(), Value::from(self.access_count));
        if let Some(embedding) = &self.embedding {
            props.insert(
                "embedding".into(),
                Value::String(serde_json::to_string(embedding)?),
            );
        }
        props.insert("created_at".into(), Value::String(self.timestamp.to_rfc3339()));
        props.insert(
            "updated_at".into(),
            Value::String(self.last_accessed.to_rfc3339()),
        );
        Ok(props)
    }

    pub fn from_properties(props: &Properties) -> Result<Self> {
        let str_field = |key: &str| -> Result<&str> {
            props
                .get(key)
                .and_then(Value::as_str)
                .ok_or_else(|| FabricError::Internal(format!("memory node missing {key}")))
        };
        let datetime = |raw: &str| -> Result<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| FabricError::Internal(format!("bad memory timestamp: {e}")))
        };
        let embedding = match props.get("embedding").and_then(Value::as_str) {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        Ok(Self {
            id: str_field("id")?.to_string(),
            content: serde_json::from_str(str_field("content")?)?,
            context: serde_json::from_str(str_field("context")?)?,
            memory_type: str_field("memory_type")?.parse()?,
            timestamp: datetime(str_field("timestamp")?)?,
            importance: props
                .get("importance")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            last_accessed: datetime(str_field("last_accessed")?)?,
            access_count: props
                .get("access_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            embedding,
        })
    }
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0))
}

/// Canonical text projection of `(content, context)`, with context keys in
/// sorted order so the projection is stable.
pub fn canonical_text(content: &Value, context: &Properties) -> String {
    let mut parts = vec![content.to_string()];
    let mut keys: Vec<&String> = context.keys().collect();
    keys.sort();
    for key in keys {
        parts.push(format!("{key}={}", context[key]));
    }
    parts.join(" ")
}

/// Context match over tag maps, normalized to [0, 1].
///
/// Per query key: 1 point for key presence, plus 1 point for value equality
/// or 0.5 for partial string containment; an absent key scores 0. The total
/// is divided by two points per query key, so an exact match scores 1.0.
pub fn context_match(query: &Properties, context: &Properties) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let mut points = 0.0;
    for (key, wanted) in query {
        let Some(found) = context.get(key) else {
            continue;
        };
        points += 1.0;
        if found == wanted {
            points += 1.0;
        } else if partially_contains(wanted, found) {
            points += 0.5;
        }
    }
    points / (2.0 * query.len() as f64)
}

fn partially_contains(wanted: &Value, found: &Value) -> bool {
    match (wanted.as_str(), found.as_str()) {
        (Some(w), Some(f)) if !w.is_empty() && !f.is_empty() => f.contains(w) || w.contains(f),
        _ => false,
    }
}

/// Cosine similarity in [-1, 1]. Mismatched or empty vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine similarity rescaled to [0, 1] for use as a score component.
pub fn semantic_similarity(a: &[f32], b: &[f32]) -> f64 {
    (cosine_similarity(a, b) + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_context_match_exact() {
        let query = ctx(&[("project", "P1")]);
        let exact = ctx(&[("project", "P1"), ("topic", "auth")]);
        assert!((context_match(&query, &exact) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_context_match_absent_key() {
        let query = ctx(&[("project", "P1")]);
        let other = ctx(&[("topic", "auth")]);
        assert_eq!(context_match(&query, &other), 0.0);
    }

    #[test]
    fn test_context_match_partial_containment() {
        let query = ctx(&[("topic", "auth")]);
        let partial = ctx(&[("topic", "authentication")]);
        let score = context_match(&query, &partial);
        assert!(score > 0.5 && score < 1.0, "got {score}");
    }

    #[test]
    fn test_context_match_presence_without_value() {
        let query = ctx(&[("project", "P1")]);
        let mismatched = ctx(&[("project", "ZZ")]);
        let score = context_match(&query, &mismatched);
        assert!((score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_importance_decay() {
        let mut memory = MemoryRecord::new(json!("x"), Properties::new(), MemoryType::Episodic, 0.8);
        memory.timestamp = Utc::now() - chrono::Duration::days(10);
        let decayed = memory.importance_now(Utc::now(), 0.1);
        assert!(decayed < 0.8);
        assert!((decayed - 0.8 * (-1.0f64).exp()).abs() < 1e-3);
    }

    #[test]
    fn test_memory_round_trip() {
        let mut memory = MemoryRecord::new(
            json!({"note": "rotate keys"}),
            ctx(&[("project", "P1")]),
            MemoryType::Semantic,
            0.7,
        );
        memory.embedding = Some(vec![0.25, 0.5]);
        memory.touch();

        let props = memory.to_properties().unwrap();
        let back = MemoryRecord::from_properties(&props).unwrap();

        assert_eq!(back.id, memory.id);
        assert_eq!(back.memory_type, MemoryType::Semantic);
        assert_eq!(back.access_count, 1);
        assert_eq!(back.embedding, Some(vec![0.25, 0.5]));
        assert_eq!(back.content, json!({"note": "rotate keys"}));
    }

    #[test]
    fn test_canonical_text_is_stable() {
        let mut a = Properties::new();
        a.insert("b".into(), json!("2"));
        a.insert("a".into(), json!("1"));
        let mut b = Properties::new();
        b.insert("a".into(), json!("1"));
        b.insert("b".into(), json!("2"));
        assert_eq!(
            canonical_text(&json!("x"), &a),
            canonical_text(&json!("x"), &b)
        );
    }
}
