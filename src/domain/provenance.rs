//! Provenance records.
//!
//! Every decision the orchestrator makes is recorded as an immutable record
//! of entities (data), activities (invocations) and agents (who acted),
//! connected by PROV-style relations. Records are append-only: corrections
//! are new records linked to the old ones with `wasDerivedFrom`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::SessionId;

/// A single append-only provenance record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub id: Uuid,
    pub session_id: SessionId,

    /// Position in the session's log (0-based, gap-free)
    pub sequence: u64,

    pub recorded_at: DateTime<Utc>,

    pub kind: RecordKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<ProvAgent>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<Relation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
}

impl ProvenanceRecord {
    /// Record id in node form (for relations that point at a record)
    pub fn node_id(&self) -> String {
        format!("record:{}", self.id)
    }

    /// Check if the record mentions a node as entity, activity, agent or
    /// relation endpoint
    pub fn mentions(&self, node: &str) -> bool {
        self.entities.iter().any(|e| e.id == node)
            || self.activity.as_ref().is_some_and(|a| a.id == node)
            || self.agent.as_ref().is_some_and(|a| a.id == node)
            || self
                .relations
                .iter()
                .any(|r| r.subject == node || r.object == node)
    }
}

/// A record before it has been assigned an id and position in the log
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub kind: RecordKind,
    pub step_name: Option<String>,
    pub entities: Vec<Entity>,
    pub activity: Option<Activity>,
    pub agent: Option<ProvAgent>,
    pub relations: Vec<Relation>,
    pub annotation: Option<Annotation>,
}

impl NewRecord {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            step_name: None,
            entities: Vec::new(),
            activity: None,
            agent: None,
            relations: Vec::new(),
            annotation: None,
        }
    }

    pub fn for_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_activity(mut self, activity: Activity) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn with_agent(mut self, agent: ProvAgent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn relate(
        mut self,
        subject: impl Into<String>,
        kind: RelationKind,
        object: impl Into<String>,
    ) -> Self {
        self.relations.push(Relation {
            subject: subject.into(),
            kind,
            object: object.into(),
        });
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotation = Some(annotation);
        self
    }

    /// Stamp the record with identity and position
    pub fn into_record(self, session_id: SessionId, sequence: u64) -> ProvenanceRecord {
        ProvenanceRecord {
            id: Uuid::new_v4(),
            session_id,
            sequence,
            recorded_at: Utc::now(),
            kind: self.kind,
            step_name: self.step_name,
            entities: self.entities,
            activity: self.activity,
            agent: self.agent,
            relations: self.relations,
            annotation: self.annotation,
        }
    }
}

/// What the record documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Session lifecycle (submitted, suspended, resumed, failed, ...)
    Session,

    /// An agent invocation attempt
    Invocation,

    /// A compensating action
    Compensation,

    /// Choice between conflicting proposals
    ConflictResolution,

    /// Final ensemble validation
    Validation,

    /// Result that arrived after the session stopped and was discarded
    CancelledAfterCompletion,
}

/// Data produced or consumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub label: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// Something that happened over a period of time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub label: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Who or what performed an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvAgent {
    pub id: String,
    pub label: String,
    pub kind: AgentKind,
}

impl ProvAgent {
    /// An external agent instance
    pub fn software(instance: &str) -> Self {
        Self {
            id: format!("agent:{}", instance),
            label: instance.to_string(),
            kind: AgentKind::Software,
        }
    }

    /// A person answering a question
    pub fn person() -> Self {
        Self {
            id: "agent:human".to_string(),
            label: "human operator".to_string(),
            kind: AgentKind::Person,
        }
    }

    /// The orchestrator itself
    pub fn orchestrator() -> Self {
        Self {
            id: "agent:orchestrator".to_string(),
            label: "convflow orchestrator".to_string(),
            kind: AgentKind::Orchestrator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Software,
    Person,
    Orchestrator,
}

/// A typed edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub subject: String,
    pub kind: RelationKind,
    pub object: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    /// activity used entity
    Used,

    /// entity wasGeneratedBy activity
    WasGeneratedBy,

    /// activity wasAssociatedWith agent
    WasAssociatedWith,

    /// entity wasDerivedFrom entity
    WasDerivedFrom,

    /// activity retryOf previous attempt activity
    RetryOf,
}

impl RelationKind {
    /// PROV-O property name (`retryOf` lives in the local namespace)
    pub fn prov_term(&self) -> &'static str {
        match self {
            Self::Used => "prov:used",
            Self::WasGeneratedBy => "prov:wasGeneratedBy",
            Self::WasAssociatedWith => "prov:wasAssociatedWith",
            Self::WasDerivedFrom => "prov:wasDerivedFrom",
            Self::RetryOf => "cf:retryOf",
        }
    }
}

/// Confidence and evidence attached to a record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,

    /// How a decision was made (e.g. `highest_confidence`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Annotation {
    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_kind_names() {
        let json = serde_json::to_string(&RelationKind::WasGeneratedBy).unwrap();
        assert_eq!(json, "\"wasGeneratedBy\"");
        let json = serde_json::to_string(&RelationKind::RetryOf).unwrap();
        assert_eq!(json, "\"retryOf\"");
    }

    #[test]
    fn test_record_builder() {
        let session_id = SessionId::new();
        let record = NewRecord::new(RecordKind::Invocation)
            .for_step("convert")
            .with_entity(Entity::new("entity:out", "convert output"))
            .with_agent(ProvAgent::software("converter-1"))
            .relate("entity:out", RelationKind::WasGeneratedBy, "activity:1")
            .into_record(session_id, 7);

        assert_eq!(record.sequence, 7);
        assert_eq!(record.session_id, session_id);
        assert!(record.mentions("entity:out"));
        assert!(record.mentions("activity:1"));
        assert!(record.mentions("agent:converter-1"));
        assert!(!record.mentions("entity:other"));
    }

    #[test]
    fn test_record_serialization_skips_empty() {
        let record = NewRecord::new(RecordKind::Session)
            .with_annotation(Annotation::note("submitted"))
            .into_record(SessionId::new(), 0);

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("relations"));
        assert!(!json.contains("step_name"));

        let parsed: ProvenanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
