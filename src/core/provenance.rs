//! Append-only provenance log.
//!
//! Records are persisted one object per record under
//! `sessions/{session_id}/provenance/{sequence:020}.json` with
//! `put_if_absent`, so a written record can never be replaced. An in-memory
//! copy of each session's log serves queries.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use uuid::Uuid;

use crate::adapters::StoragePort;
use crate::domain::{
    Annotation, Entity, FieldValue, NewRecord, ProvAgent, ProvenanceRecord, RecordKind,
    RelationKind, SessionId,
};

/// Serialization target for `export`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty-printed JSON array
    Json,

    /// One JSON record per line
    Jsonl,

    /// PROV-O in Turtle
    Turtle,
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jsonl" => Ok(Self::Jsonl),
            "turtle" | "ttl" => Ok(Self::Turtle),
            other => bail!("Unknown provenance format '{}' (expected json, jsonl or turtle)", other),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Jsonl => write!(f, "jsonl"),
            Self::Turtle => write!(f, "turtle"),
        }
    }
}

/// Pattern for `query`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ProvenanceQuery {
    pub kind: Option<RecordKind>,
    pub step_name: Option<String>,

    /// Records mentioning this node
    pub node: Option<String>,

    /// Records containing a relation of this kind
    pub relation: Option<RelationKind>,
}

impl ProvenanceQuery {
    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn relation(mut self, relation: RelationKind) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn matches(&self, record: &ProvenanceRecord) -> bool {
        self.kind.map_or(true, |k| record.kind == k)
            && self
                .step_name
                .as_deref()
                .map_or(true, |s| record.step_name.as_deref() == Some(s))
            && self.node.as_deref().map_or(true, |n| record.mentions(n))
            && self
                .relation
                .map_or(true, |r| record.relations.iter().any(|rel| rel.kind == r))
    }
}

/// How a field conflict was settled
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// One candidate had strictly the highest confidence
    Chosen(FieldValue),

    /// Top candidates tie; a person has to decide
    HumanRequired,
}

/// Outcome of recording a conflict
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub record_id: Uuid,

    /// Entity holding the resolution
    pub resolution_entity: String,

    pub resolution: Resolution,
}

/// Pick the candidate with the highest confidence. Ties at the top need a
/// human decision.
pub fn resolve_by_confidence(candidates: &[FieldValue]) -> Resolution {
    let Some(best) = candidates
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    else {
        return Resolution::HumanRequired;
    };

    let tied = candidates
        .iter()
        .filter(|c| c.confidence == best.confidence && c.value != best.value)
        .count();

    if tied > 0 {
        Resolution::HumanRequired
    } else {
        Resolution::Chosen(best.clone())
    }
}

#[derive(Debug, Default)]
struct SessionLog {
    loaded: bool,
    records: Vec<ProvenanceRecord>,
}

/// Append-only provenance recorder
pub struct ProvenanceTracker {
    storage: Arc<dyn StoragePort>,
    logs: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<SessionLog>>>>,
}

impl ProvenanceTracker {
    pub fn new(storage: Arc<dyn StoragePort>) -> Self {
        Self {
            storage,
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn prefix(session_id: SessionId) -> String {
        format!("sessions/{}/provenance/", session_id)
    }

    fn key(session_id: SessionId, sequence: u64) -> String {
        format!("{}{:020}.json", Self::prefix(session_id), sequence)
    }

    /// Lock a session's log, loading it from storage on first use
    async fn log(&self, session_id: SessionId) -> Result<OwnedMutexGuard<SessionLog>> {
        let cell = self
            .logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id)
            .or_default()
            .clone();

        let mut log = cell.lock_owned().await;
        if !log.loaded {
            log.records = self.load(session_id).await?;
            log.loaded = true;
        }
        Ok(log)
    }

    /// Read a session's records from storage, in sequence order
    pub async fn load(&self, session_id: SessionId) -> Result<Vec<ProvenanceRecord>> {
        let keys = self.storage.list(&Self::prefix(session_id)).await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            let bytes = self.storage.get(&key).await?;
            let record: ProvenanceRecord = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse provenance record: {}", key))?;
            records.push(record);
        }

        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Append a record. Returns its id.
    pub async fn record(&self, session_id: SessionId, record: NewRecord) -> Result<Uuid> {
        let mut log = self.log(session_id).await?;

        let sequence = log.records.len() as u64;
        let record = record.into_record(session_id, sequence);
        let bytes = serde_json::to_vec(&record).context("Failed to serialize provenance record")?;

        let key = Self::key(session_id, sequence);
        if !self.storage.put_if_absent(&key, bytes).await? {
            bail!(
                "Provenance record {} of session {} was written by another process",
                sequence,
                session_id
            );
        }

        debug!(
            session_id = %session_id,
            sequence,
            kind = ?record.kind,
            step = ?record.step_name,
            "Provenance recorded"
        );

        let id = record.id;
        log.records.push(record);
        Ok(id)
    }

    /// All records of a session
    pub async fn records(&self, session_id: SessionId) -> Result<Vec<ProvenanceRecord>> {
        Ok(self.log(session_id).await?.records.clone())
    }

    /// Records matching a pattern, in sequence order
    pub async fn query(
        &self,
        session_id: SessionId,
        query: &ProvenanceQuery,
    ) -> Result<Vec<ProvenanceRecord>> {
        Ok(self
            .log(session_id)
            .await?
            .records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    /// Every record on the path explaining how `node` came to be.
    ///
    /// Follows relations from subject to object transitively, so an output
    /// entity leads to the activity that generated it, the entities that
    /// activity used, earlier attempts it retried, and so on.
    pub async fn reasoning_chain(
        &self,
        session_id: SessionId,
        node: &str,
    ) -> Result<Vec<ProvenanceRecord>> {
        let log = self.log(session_id).await?;

        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue = VecDeque::from([node.to_string()]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for relation in log.records.iter().flat_map(|r| &r.relations) {
                if relation.subject == current && !visited.contains(&relation.object) {
                    queue.push_back(relation.object.clone());
                }
            }
        }

        Ok(log
            .records
            .iter()
            .filter(|r| {
                r.entities.iter().any(|e| visited.contains(&e.id))
                    || r.relations.iter().any(|rel| visited.contains(&rel.subject))
            })
            .cloned()
            .collect())
    }

    /// Record two or more disagreeing candidates and how they were settled
    pub async fn record_conflict(
        &self,
        session_id: SessionId,
        step_name: &str,
        field: &str,
        candidates: &[FieldValue],
    ) -> Result<ConflictRecord> {
        let resolution = resolve_by_confidence(candidates);
        let resolution_entity = format!("entity:field:{}:resolution:{}", field, Uuid::new_v4());

        let (method, chosen, confidence) = match &resolution {
            Resolution::Chosen(value) => (
                "highest_confidence",
                value.value.clone(),
                Some(value.confidence),
            ),
            Resolution::HumanRequired => ("human_required", serde_json::Value::Null, None),
        };

        let mut record = NewRecord::new(RecordKind::ConflictResolution)
            .for_step(step_name)
            .with_agent(ProvAgent::orchestrator())
            .with_entity(
                Entity::new(&resolution_entity, format!("resolution of {}", field))
                    .with_value(serde_json::json!({ "field": field, "value": chosen })),
            );

        for candidate in candidates {
            record = record
                .with_entity(
                    Entity::new(&candidate.entity_id, format!("{} candidate", field))
                        .with_value(candidate.value.clone()),
                )
                .relate(&resolution_entity, RelationKind::WasDerivedFrom, &candidate.entity_id);
        }

        let record = record.with_annotation(Annotation {
            confidence,
            evidence: candidates
                .iter()
                .map(|c| format!("{} proposed by {} ({:.2})", c.value, c.source_step, c.confidence))
                .collect(),
            method: Some(method.to_string()),
            note: None,
        });

        let record_id = self.record(session_id, record).await?;
        Ok(ConflictRecord {
            record_id,
            resolution_entity,
            resolution,
        })
    }

    /// Record a person's decision superseding a pending resolution.
    /// Returns the entity holding the decided value.
    pub async fn record_human_decision(
        &self,
        session_id: SessionId,
        step_name: &str,
        field: &str,
        pending_resolution: &str,
        value: serde_json::Value,
    ) -> Result<String> {
        let decision = format!("entity:field:{}:decision:{}", field, Uuid::new_v4());

        let record = NewRecord::new(RecordKind::ConflictResolution)
            .for_step(step_name)
            .with_agent(ProvAgent::person())
            .with_entity(
                Entity::new(&decision, format!("decision on {}", field))
                    .with_value(serde_json::json!({ "field": field, "value": value })),
            )
            .relate(&decision, RelationKind::WasDerivedFrom, pending_resolution)
            .with_annotation(Annotation {
                method: Some("human_decision".to_string()),
                confidence: Some(1.0),
                ..Default::default()
            });

        self.record(session_id, record).await?;
        Ok(decision)
    }

    /// Serialize a session's log
    pub async fn export(&self, session_id: SessionId, format: ExportFormat) -> Result<String> {
        let log = self.log(session_id).await?;

        match format {
            ExportFormat::Json => {
                serde_json::to_string_pretty(&log.records).context("Failed to export provenance")
            }
            ExportFormat::Jsonl => {
                let mut out = String::new();
                for record in &log.records {
                    out.push_str(
                        &serde_json::to_string(record).context("Failed to export provenance")?,
                    );
                    out.push('\n');
                }
                Ok(out)
            }
            ExportFormat::Turtle => Ok(to_turtle(session_id, &log.records)),
        }
    }

    /// Drop the cached log of a deleted session
    pub fn forget(&self, session_id: SessionId) {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
    }
}

fn iri(session_id: SessionId, node: &str) -> String {
    let mut out = format!("<urn:convflow:{}:", session_id);
    for byte in node.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b':' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out.push('>');
    out
}

fn literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn kind_name(kind: RecordKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn datetime(ts: &chrono::DateTime<chrono::Utc>) -> String {
    format!("\"{}\"^^xsd:dateTime", ts.to_rfc3339())
}

/// Render records as PROV-O Turtle
fn to_turtle(session_id: SessionId, records: &[ProvenanceRecord]) -> String {
    let mut out = String::from(
        "@prefix prov: <http://www.w3.org/ns/prov#> .\n\
         @prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .\n\
         @prefix xsd: <http://www.w3.org/2001/XMLSchema#> .\n\
         @prefix cf: <urn:convflow:vocab#> .\n",
    );

    let mut declared: BTreeSet<String> = BTreeSet::new();

    for record in records {
        out.push('\n');
        out.push_str(&format!(
            "{} a cf:Record ;\n    cf:kind {} ;\n    cf:sequence {} ;\n    prov:generatedAtTime {}",
            iri(session_id, &record.node_id()),
            literal(&kind_name(record.kind)),
            record.sequence,
            datetime(&record.recorded_at),
        ));
        if let Some(step) = &record.step_name {
            out.push_str(&format!(" ;\n    cf:step {}", literal(step)));
        }
        if let Some(annotation) = &record.annotation {
            if let Some(confidence) = annotation.confidence {
                out.push_str(&format!(" ;\n    cf:confidence \"{}\"^^xsd:double", confidence));
            }
            if let Some(method) = &annotation.method {
                out.push_str(&format!(" ;\n    cf:method {}", literal(method)));
            }
            for evidence in &annotation.evidence {
                out.push_str(&format!(" ;\n    cf:evidence {}", literal(evidence)));
            }
            if let Some(note) = &annotation.note {
                out.push_str(&format!(" ;\n    rdfs:comment {}", literal(note)));
            }
        }
        out.push_str(" .\n");

        for entity in &record.entities {
            if declared.insert(entity.id.clone()) {
                out.push_str(&format!(
                    "{} a prov:Entity ;\n    rdfs:label {}",
                    iri(session_id, &entity.id),
                    literal(&entity.label)
                ));
                if let Some(value) = &entity.value {
                    out.push_str(&format!(" ;\n    prov:value {}", literal(&value.to_string())));
                }
                out.push_str(" .\n");
            }
        }

        if let Some(activity) = &record.activity {
            if declared.insert(activity.id.clone()) {
                out.push_str(&format!(
                    "{} a prov:Activity ;\n    rdfs:label {} ;\n    prov:startedAtTime {}",
                    iri(session_id, &activity.id),
                    literal(&activity.label),
                    datetime(&activity.started_at)
                ));
                if let Some(ended) = &activity.ended_at {
                    out.push_str(&format!(" ;\n    prov:endedAtTime {}", datetime(ended)));
                }
                if let Some(attempt) = activity.attempt {
                    out.push_str(&format!(" ;\n    cf:attempt {}", attempt));
                }
                if let Some(status) = &activity.status {
                    out.push_str(&format!(" ;\n    cf:status {}", literal(status)));
                }
                out.push_str(" .\n");
            }
        }

        if let Some(agent) = &record.agent {
            if declared.insert(agent.id.clone()) {
                let class = match agent.kind {
                    crate::domain::AgentKind::Software => "prov:SoftwareAgent",
                    crate::domain::AgentKind::Person => "prov:Person",
                    crate::domain::AgentKind::Orchestrator => "prov:SoftwareAgent",
                };
                out.push_str(&format!(
                    "{} a prov:Agent, {} ;\n    rdfs:label {} .\n",
                    iri(session_id, &agent.id),
                    class,
                    literal(&agent.label)
                ));
            }
        }

        for relation in &record.relations {
            out.push_str(&format!(
                "{} {} {} .\n",
                iri(session_id, &relation.subject),
                relation.kind.prov_term(),
                iri(session_id, &relation.object)
            ));
        }
    }

    out
}
