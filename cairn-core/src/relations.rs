//! Relation finder
//!
//! Entities produced by a crawl refer to each other by foreign URI. The
//! finder gives every entity of a batch its uid, resolves each relation
//! target against the batch, then the index, then the datasource (fetched
//! entities join the batch), and finally orders the batch so referenced
//! entities come before the entities that refer to them.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::codec::Value;
use crate::config::ResolutionMode;
use crate::error::{Error, Result};
use crate::ids::Uid;
use crate::index::{ProvisionalRef, UriKind};
use crate::model::{external_ref, EntityInput, RelationValue};
use crate::repo::Repo;

/// What a datasource returned for one URI
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// The entity behind the URI, possibly with entities it brought along
    Found(Vec<EntityInput>),
    NotFound,
}

/// Fetches foreign entities by URI
#[async_trait]
pub trait Datasource: Send + Sync {
    async fn fetch_by_uri(&self, uri: &str) -> Result<FetchResult>;
}

/// A datasource that knows nothing
pub struct NoDatasource;

#[async_trait]
impl Datasource for NoDatasource {
    async fn fetch_by_uri(&self, _uri: &str) -> Result<FetchResult> {
        Ok(FetchResult::NotFound)
    }
}

/// Outcome of resolving one URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Uid),
    Missing,
}

/// A resolved batch, ready to commit in order
#[derive(Debug, Clone, Default)]
pub struct ResolvedBatch {
    /// Referenced entities first; every input carries its uid
    pub entities: Vec<EntityInput>,
    /// URIs nothing could resolve
    pub missing: Vec<String>,
    /// Relations stored as external references (lenient mode)
    pub provisional: Vec<ProvisionalRef>,
}

fn label(input: &EntityInput) -> String {
    input.uris.first().cloned().unwrap_or_else(|| input.describe())
}

/// Resolves relation URIs for a batch of entity inputs
pub struct RelationFinder<'a> {
    repo: &'a Repo,
    datasource: &'a dyn Datasource,
    mode: ResolutionMode,
    concurrency: usize,
    entities: Vec<EntityInput>,
    by_uid: HashMap<Uid, usize>,
    /// URIs declared by batch entities
    batch_uris: HashMap<String, usize>,
    uri_map: HashMap<String, Uid>,
    pending: BTreeSet<String>,
    missing: BTreeSet<String>,
    fetched: HashSet<String>,
}

impl<'a> RelationFinder<'a> {
    pub fn new(repo: &'a Repo, datasource: &'a dyn Datasource) -> Self {
        let config = &repo.context().config;
        Self {
            repo,
            datasource,
            mode: config.resolution_mode,
            concurrency: config.fetch_concurrency.max(1),
            entities: Vec::new(),
            by_uid: HashMap::new(),
            batch_uris: HashMap::new(),
            uri_map: HashMap::new(),
            pending: BTreeSet::new(),
            missing: BTreeSet::new(),
            fetched: HashSet::new(),
        }
    }

    pub fn with_mode(mut self, mode: ResolutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// How `uri` resolved so far
    pub fn resolution(&self, uri: &str) -> Resolution {
        match self.uri_map.get(uri) {
            Some(uid) => Resolution::Resolved(uid.clone()),
            None => Resolution::Missing,
        }
    }

    /// Add entities to the batch, assigning uids
    ///
    /// An input declaring a URI some batch entity already declared is
    /// dropped, as is a second input for the same uid.
    pub async fn push(&mut self, inputs: Vec<EntityInput>) -> Result<()> {
        let lookup: Vec<String> = inputs
            .iter()
            .filter(|i| i.uid.is_none())
            .flat_map(|i| i.uris.iter().cloned())
            .collect();
        let repo = self.repo;
        let mut existing: HashMap<String, Uid> = HashMap::new();
        if !lookup.is_empty() {
            let mut matches = repo.index().find_by_uris(repo.did(), &lookup).await?;
            matches.sort_by_key(|m| m.kind != UriKind::Entity);
            for m in matches {
                existing.entry(m.uri).or_insert(m.entity_uid);
            }
        }

        let ids = &repo.context().ids;
        for mut input in inputs {
            if input.uris.iter().any(|u| self.batch_uris.contains_key(u)) {
                debug!("Skipping duplicate entity {}", label(&input));
                continue;
            }
            let uid = match (&input.uid, input.uris.iter().find_map(|u| existing.get(u))) {
                (Some(uid), _) => uid.clone(),
                (None, Some(uid)) => uid.clone(),
                (None, None) => match input.uris.first() {
                    Some(uri) => Uid::from_uri(ids, uri),
                    None => Uid::generate(ids),
                },
            };
            if self.by_uid.contains_key(&uid) {
                debug!("Skipping second input for entity {}", uid);
                continue;
            }
            input.uid = Some(uid.clone());

            let idx = self.entities.len();
            for uri in &input.uris {
                self.batch_uris.insert(uri.clone(), idx);
                self.uri_map.insert(uri.clone(), uid.clone());
                self.pending.remove(uri);
            }
            for relation in input.relations.values() {
                for target in relation.targets() {
                    if Uid::parse(target).is_err() && !self.uri_map.contains_key(target) {
                        self.pending.insert(target.to_string());
                    }
                }
            }
            self.by_uid.insert(uid, idx);
            self.entities.push(input);
        }
        Ok(())
    }

    /// Run the resolve loop until no URI is pending
    pub async fn resolve(&mut self) -> Result<()> {
        let mut round = 0;
        while !self.pending.is_empty() {
            round += 1;
            let batch: Vec<String> = self.pending.iter().cloned().collect();
            let matches = self.repo.index().find_by_uris(self.repo.did(), &batch).await?;
            for m in matches {
                self.uri_map.entry(m.uri).or_insert(m.entity_uid);
            }
            let uri_map = &self.uri_map;
            self.pending.retain(|u| !uri_map.contains_key(u));

            let (refetch, to_fetch): (Vec<String>, Vec<String>) =
                self.pending.iter().cloned().partition(|u| self.fetched.contains(u));
            for uri in refetch {
                // fetched already and still unknown: the source did not declare it
                self.pending.remove(&uri);
                self.missing.insert(uri);
            }
            debug!(
                "Resolve round {}: {} resolved, {} to fetch, {} missing",
                round,
                self.uri_map.len(),
                to_fetch.len(),
                self.missing.len()
            );
            if to_fetch.is_empty() {
                continue;
            }

            let datasource = self.datasource;
            let mut results: Vec<(String, Result<FetchResult>)> = stream::iter(to_fetch)
                .map(|uri| async move {
                    let result = datasource.fetch_by_uri(&uri).await;
                    (uri, result)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
            results.sort_by(|a, b| a.0.cmp(&b.0));

            let mut found = Vec::new();
            for (uri, result) in results {
                self.fetched.insert(uri.clone());
                match result? {
                    FetchResult::Found(inputs) => found.extend(inputs),
                    FetchResult::NotFound => {
                        self.pending.remove(&uri);
                        self.missing.insert(uri);
                    }
                }
            }
            self.push(found).await?;
        }
        Ok(())
    }

    /// Rewrite relations to uids and order the batch
    pub fn finish(mut self) -> Result<ResolvedBatch> {
        let mut provisional = Vec::new();
        let mut edges = Vec::new();
        for idx in 0..self.entities.len() {
            let refs = self.rewrite_relations(idx, &mut provisional)?;
            for target in refs {
                if let Some(&referenced) = self.by_uid.get(&target) {
                    edges.push((referenced, idx));
                }
            }
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..self.entities.len()).map(|i| graph.add_node(i)).collect();
        for (from, to) in edges {
            graph.update_edge(nodes[from], nodes[to], ());
        }
        let order = match toposort(&graph, None) {
            Ok(order) => order,
            Err(cycle) => {
                let node = cycle.node_id();
                let partner = tarjan_scc(&graph)
                    .into_iter()
                    .find(|scc| scc.contains(&node))
                    .and_then(|scc| scc.into_iter().find(|n| *n != node))
                    .unwrap_or(node);
                return Err(Error::CircularRelation {
                    from: label(&self.entities[graph[node]]),
                    to: label(&self.entities[graph[partner]]),
                });
            }
        };

        let mut slots: Vec<Option<EntityInput>> = self.entities.into_iter().map(Some).collect();
        let entities = order
            .into_iter()
            .filter_map(|n| slots[graph[n]].take())
            .collect::<Vec<_>>();
        info!(
            "Resolved {} entities ({} missing URIs, {} provisional relations)",
            entities.len(),
            self.missing.len(),
            provisional.len()
        );
        Ok(ResolvedBatch {
            entities,
            missing: self.missing.into_iter().collect(),
            provisional,
        })
    }

    /// Replace relation URIs with uids; returns the uids referenced
    ///
    /// In lenient mode a field with an unresolved target moves into content,
    /// holding uids and external references side by side.
    fn rewrite_relations(&mut self, idx: usize, provisional: &mut Vec<ProvisionalRef>) -> Result<Vec<Uid>> {
        let input = &mut self.entities[idx];
        let entity_label = label(input);
        let Some(entity_uid) = input.uid.clone() else {
            return Err(Error::EntityNotFound(entity_label));
        };
        let mut referenced = Vec::new();
        let mut external: Vec<(String, Value)> = Vec::new();

        for (field, relation) in input.relations.iter_mut() {
            let many = matches!(relation, RelationValue::Many(_));
            let mut placeholders = Vec::new();
            let mut uids = Vec::new();
            let mut values = Vec::new();
            for target in relation.targets() {
                let uid = match Uid::parse(target) {
                    Ok(uid) => Some(uid),
                    Err(_) => self.uri_map.get(target).cloned(),
                };
                match uid {
                    Some(uid) => {
                        values.push(Value::from(uid.as_str()));
                        uids.push(uid.to_string());
                        referenced.push(uid);
                    }
                    None if self.mode == ResolutionMode::Strict => {
                        return Err(Error::RelationUnresolved {
                            uri: target.to_string(),
                            entity: entity_label,
                        });
                    }
                    None => {
                        placeholders.push(target.to_string());
                        values.push(external_ref(target));
                    }
                }
            }

            if placeholders.is_empty() {
                *relation = if many {
                    RelationValue::Many(uids)
                } else {
                    RelationValue::One(uids.into_iter().next().unwrap_or_default())
                };
                continue;
            }
            for uri in placeholders {
                provisional.push(ProvisionalRef {
                    entity_uid: entity_uid.clone(),
                    field: field.clone(),
                    uri,
                });
            }
            let value = if many {
                Value::List(values)
            } else {
                values.pop().unwrap_or(Value::Null)
            };
            external.push((field.clone(), value));
        }

        for (field, value) in external {
            input.relations.remove(&field);
            input.content.insert(field, value);
        }
        Ok(referenced)
    }
}

/// Push, resolve and finish in one call
pub async fn resolve_batch(
    repo: &Repo,
    datasource: &dyn Datasource,
    inputs: Vec<EntityInput>,
) -> Result<ResolvedBatch> {
    let mut finder = RelationFinder::new(repo, datasource);
    finder.push(inputs).await?;
    finder.resolve().await?;
    finder.finish()
}
