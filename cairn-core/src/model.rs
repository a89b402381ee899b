//! Repo records: Revision, Commit and Root blocks, plus the entity inputs
//! a caller hands to a commit and the bundles that travel between nodes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cid::Cid;
use crate::codec::{fields, Value};
use crate::error::Result;
use crate::ids::Uid;

/// One immutable version of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub id: String,
    pub entity_uid: Uid,
    pub entity_type: String,
    pub content_cid: Cid,
    pub prev_revision_id: Option<String>,
    pub revision_uris: Vec<String>,
    pub entity_uris: Vec<String>,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
    pub is_deleted: bool,
}

fn text_list(items: &[String]) -> Value {
    Value::List(items.iter().map(|s| Value::Text(s.clone())).collect())
}

impl Revision {
    pub fn to_value(&self) -> Value {
        Value::from_pairs([
            ("id", Value::from(self.id.as_str())),
            ("entityUid", Value::from(self.entity_uid.as_str())),
            ("entityType", Value::from(self.entity_type.as_str())),
            ("contentCid", Value::Link(self.content_cid)),
            ("prevRevisionId", Value::from(self.prev_revision_id.clone())),
            ("revisionUris", text_list(&self.revision_uris)),
            ("entityUris", text_list(&self.entity_uris)),
            ("dateCreated", Value::timestamp(self.date_created)),
            ("dateModified", Value::timestamp(self.date_modified)),
            ("isDeleted", Value::Bool(self.is_deleted)),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let map = fields::map(value, "revision")?;
        Ok(Self {
            id: fields::text(map, "id")?,
            entity_uid: Uid::parse(&fields::text(map, "entityUid")?)?,
            entity_type: fields::text(map, "entityType")?,
            content_cid: fields::link(map, "contentCid")?,
            prev_revision_id: fields::opt_text(map, "prevRevisionId")?,
            revision_uris: fields::texts(map, "revisionUris")?,
            entity_uris: fields::texts(map, "entityUris")?,
            date_created: fields::timestamp(map, "dateCreated")?,
            date_modified: fields::timestamp(map, "dateModified")?,
            is_deleted: fields::boolean(map, "isDeleted")?,
        })
    }
}

/// A batch of revisions linked to the previous root
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub repo_did: String,
    pub agent_did: String,
    pub parent: Option<Cid>,
    pub revisions: Vec<Cid>,
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    pub fn to_value(&self) -> Value {
        Value::from_pairs([
            ("repoDid", Value::from(self.repo_did.as_str())),
            ("agentDid", Value::from(self.agent_did.as_str())),
            ("parent", Value::from(self.parent)),
            ("revisions", Value::List(self.revisions.iter().copied().map(Value::Link).collect())),
            ("timestamp", Value::timestamp(self.timestamp)),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let map = fields::map(value, "commit")?;
        Ok(Self {
            repo_did: fields::text(map, "repoDid")?,
            agent_did: fields::text(map, "agentDid")?,
            parent: fields::opt_link(map, "parent")?,
            revisions: fields::links(map, "revisions")?,
            timestamp: fields::timestamp(map, "timestamp")?,
        })
    }
}

/// The signed pointer to a commit
#[derive(Debug, Clone, PartialEq)]
pub struct Root {
    pub commit: Cid,
    pub sig: Vec<u8>,
    pub cap: String,
    pub agent_did: String,
}

impl Root {
    pub fn to_value(&self) -> Value {
        Value::from_pairs([
            ("commit", Value::Link(self.commit)),
            ("sig", Value::Bytes(self.sig.clone())),
            ("cap", Value::from(self.cap.as_str())),
            ("agentDid", Value::from(self.agent_did.as_str())),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let map = fields::map(value, "root")?;
        Ok(Self {
            commit: fields::link(map, "commit")?,
            sig: fields::bytes(map, "sig")?,
            cap: fields::text(map, "cap")?,
            agent_did: fields::text(map, "agentDid")?,
        })
    }
}

/// Target of a relation field: a URI before resolution, a uid after
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationValue {
    One(String),
    Many(Vec<String>),
}

impl RelationValue {
    pub fn targets(&self) -> Vec<&str> {
        match self {
            RelationValue::One(t) => vec![t.as_str()],
            RelationValue::Many(ts) => ts.iter().map(String::as_str).collect(),
        }
    }
}

/// Key of the map written in place of a relation that could not be resolved.
pub const EXTERNAL_URI_KEY: &str = "externalUri";

/// Placeholder for a relation to an entity this node does not know
pub fn external_ref(uri: &str) -> Value {
    Value::from_pairs([(EXTERNAL_URI_KEY, Value::from(uri))])
}

/// The URI held by an external reference placeholder, if `value` is one
pub fn as_external_ref(value: &Value) -> Option<&str> {
    let map = value.as_map()?;
    if map.len() != 1 {
        return None;
    }
    map.get(EXTERNAL_URI_KEY)?.as_str()
}

/// What a caller asks to store for one entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityInput {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub uid: Option<Uid>,
    pub uris: Vec<String>,
    pub revision_uris: Vec<String>,
    pub content: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, RelationValue>,
    pub deleted: bool,
}

impl EntityInput {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uris.push(uri.into());
        self
    }

    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.content.insert(key.into(), value.into());
        self
    }

    pub fn with_relation(mut self, field: impl Into<String>, uri: impl Into<String>) -> Self {
        self.relations.insert(field.into(), RelationValue::One(uri.into()));
        self
    }

    pub fn with_relations(mut self, field: impl Into<String>, uris: Vec<String>) -> Self {
        self.relations.insert(field.into(), RelationValue::Many(uris));
        self
    }

    pub fn tombstone(entity_type: impl Into<String>, uid: Uid) -> Self {
        Self {
            entity_type: entity_type.into(),
            uid: Some(uid),
            deleted: true,
            ..Default::default()
        }
    }

    /// Label used in error messages
    pub fn describe(&self) -> String {
        match (&self.uid, self.uris.first()) {
            (Some(uid), _) => uid.to_string(),
            (None, Some(uri)) => uri.clone(),
            (None, None) => format!("<new {}>", self.entity_type),
        }
    }
}

/// Current state of an entity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub uid: Uid,
    pub entity_type: String,
    pub content: BTreeMap<String, Value>,
    pub revision: Revision,
}

/// A revision block and its content block as carried in a bundle
#[derive(Debug, Clone)]
pub struct BundleRevision {
    pub cid: Cid,
    pub revision: Revision,
    pub bytes: Bytes,
    pub content: Bytes,
}

/// Root, commit and revisions with content, in transit
#[derive(Debug, Clone)]
pub struct Bundle {
    pub root_cid: Cid,
    pub root: Root,
    pub root_bytes: Bytes,
    pub commit_cid: Cid,
    pub commit: Commit,
    pub commit_bytes: Bytes,
    pub revisions: Vec<BundleRevision>,
}

impl Bundle {
    /// Blocks in stream order: root, commit, then each revision followed by its content
    pub fn blocks(&self) -> Vec<(Cid, Bytes)> {
        let mut out = Vec::with_capacity(2 + self.revisions.len() * 2);
        out.push((self.root_cid, self.root_bytes.clone()));
        out.push((self.commit_cid, self.commit_bytes.clone()));
        for rev in &self.revisions {
            out.push((rev.cid, rev.bytes.clone()));
            out.push((rev.revision.content_cid, rev.content.clone()));
        }
        out
    }

    pub fn byte_len(&self) -> u64 {
        self.blocks().iter().map(|(_, b)| b.len() as u64).sum()
    }
}
