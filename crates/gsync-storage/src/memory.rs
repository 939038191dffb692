//! In-memory [`Store`] used by tests and dry runs.
//!
//! Mirrors the Postgres behaviour that matters to reconciliation: inserting
//! an existing (owner, year) point fails, updating a missing one is a no-op.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use gsync_core::{
    CitationGraph, Department, GraphOwner, NewPublication, PatchValue, PublicationField,
    PublicationId, PublicationPatch, Role, StaffStatistics, StaffSummary, StatisticsPatch,
    StoredPublication, StoredState, Subject, SubjectId, TimeSeriesOp,
};
use tracing::error;

use crate::{ReadStore, Store, StoreError};

#[derive(Default)]
struct MemoryState {
    subjects: Vec<Subject>,
    departments: Vec<Department>,
    roles: Vec<Role>,
    /// (department_id, role_id) per subject.
    affiliations: HashMap<SubjectId, (Option<i64>, Option<i64>)>,
    publications: BTreeMap<PublicationId, StoredPublication>,
    links: BTreeMap<(SubjectId, PublicationId), Option<i32>>,
    staff_graphs: HashMap<SubjectId, CitationGraph>,
    publication_graphs: HashMap<PublicationId, CitationGraph>,
    statistics: HashMap<SubjectId, StaffStatistics>,
    next_publication_id: PublicationId,
    writes: usize,
    fail_writes: bool,
    unavailable: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_subject(&self, subject: Subject) {
        let mut state = self.lock();
        state.subjects.push(subject);
        state.subjects.sort_by_key(|s| s.id);
    }

    pub fn add_department(&self, department_id: i64, name: &str) {
        self.lock().departments.push(Department {
            department_id,
            department_name: name.to_string(),
        });
    }

    pub fn add_role(&self, role_id: i64, name: &str) {
        self.lock().roles.push(Role {
            role_id,
            role_name: name.to_string(),
        });
    }

    pub fn set_affiliation(&self, subject_id: SubjectId, department_id: i64, role_id: i64) {
        self.lock()
            .affiliations
            .insert(subject_id, (Some(department_id), Some(role_id)));
    }

    /// Seeds a stored publication linked to `subject_id`; the given id is kept.
    pub fn seed_publication(&self, subject_id: SubjectId, publication: StoredPublication) {
        let mut state = self.lock();
        state.next_publication_id = state.next_publication_id.max(publication.id);
        state
            .links
            .insert((subject_id, publication.id), publication.author_order);
        state.publications.insert(publication.id, publication);
    }

    pub fn seed_statistics(&self, subject_id: SubjectId, statistics: StaffStatistics) {
        self.lock().statistics.insert(subject_id, statistics);
    }

    pub fn seed_graph(&self, owner: GraphOwner, graph: CitationGraph) {
        let mut state = self.lock();
        match owner {
            GraphOwner::Staff(id) => state.staff_graphs.insert(id, graph),
            GraphOwner::Publication(id) => state.publication_graphs.insert(id, graph),
        };
    }

    pub fn statistics(&self, subject_id: SubjectId) -> Option<StaffStatistics> {
        self.lock().statistics.get(&subject_id).copied()
    }

    pub fn graph(&self, owner: GraphOwner) -> CitationGraph {
        let state = self.lock();
        let graph = match owner {
            GraphOwner::Staff(id) => state.staff_graphs.get(&id),
            GraphOwner::Publication(id) => state.publication_graphs.get(&id),
        };
        graph.cloned().unwrap_or_default()
    }

    pub fn publications(&self, subject_id: SubjectId) -> Vec<StoredPublication> {
        let state = self.lock();
        publications_for(&state, subject_id)
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Makes every write fail with a persistence error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Makes every call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }
}

fn publications_for(state: &MemoryState, subject_id: SubjectId) -> Vec<StoredPublication> {
    state
        .links
        .iter()
        .filter(|((staff_id, _), _)| *staff_id == subject_id)
        .filter_map(|((_, publication_id), author_order)| {
            state.publications.get(publication_id).map(|p| StoredPublication {
                author_order: *author_order,
                ..p.clone()
            })
        })
        .collect()
}

fn summaries_where(
    state: &MemoryState,
    keep: impl Fn(&Subject, Option<i64>, Option<i64>) -> bool,
) -> Vec<StaffSummary> {
    state
        .subjects
        .iter()
        .filter_map(|subject| {
            let (department_id, role_id) = state
                .affiliations
                .get(&subject.id)
                .copied()
                .unwrap_or((None, None));
            keep(subject, department_id, role_id).then(|| StaffSummary {
                staff_id: subject.id,
                name: subject.name.clone(),
                scholar_id: Some(subject.scholar_id.clone()),
                department_id,
                role_id,
                publication_count: state
                    .links
                    .keys()
                    .filter(|(staff_id, _)| *staff_id == subject.id)
                    .count() as i64,
                statistics: state.statistics.get(&subject.id).copied(),
            })
        })
        .collect()
}

fn check_read(state: &MemoryState) -> Result<(), StoreError> {
    if state.unavailable {
        return Err(StoreError::Unavailable("memory store switched off".into()));
    }
    Ok(())
}

fn check_write(state: &MemoryState, operation: &'static str) -> Result<(), StoreError> {
    check_read(state)?;
    if state.fail_writes {
        return Err(StoreError::persistence(operation, "write rejected"));
    }
    Ok(())
}

fn text(field: PublicationField, value: &PatchValue) -> Result<Option<String>, StoreError> {
    match value {
        PatchValue::Text(v) => Ok(v.clone()),
        other => Err(StoreError::persistence(
            "patch publication",
            format!("{field:?} cannot hold {other:?}"),
        )),
    }
}

fn int(field: PublicationField, value: &PatchValue) -> Result<i64, StoreError> {
    match value {
        PatchValue::Int(v) => Ok(*v),
        other => Err(StoreError::persistence(
            "patch publication",
            format!("{field:?} cannot hold {other:?}"),
        )),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn subjects(&self) -> Result<Vec<Subject>, StoreError> {
        let state = self.lock();
        check_read(&state)?;
        Ok(state.subjects.clone())
    }

    async fn current_state(&self, subject_id: SubjectId) -> Result<StoredState, StoreError> {
        let state = self.lock();
        check_read(&state)?;
        Ok(StoredState {
            statistics: state.statistics.get(&subject_id).copied(),
            citation_graph: state.staff_graphs.get(&subject_id).cloned().unwrap_or_default(),
            publications: publications_for(&state, subject_id),
        })
    }

    async fn publication_graph(
        &self,
        publication_id: PublicationId,
    ) -> Result<CitationGraph, StoreError> {
        let state = self.lock();
        check_read(&state)?;
        Ok(state
            .publication_graphs
            .get(&publication_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_publication(
        &self,
        subject_id: SubjectId,
        publication: &NewPublication,
    ) -> Result<PublicationId, StoreError> {
        let mut state = self.lock();
        check_write(&state, "insert publication")?;
        state.next_publication_id += 1;
        let id = state.next_publication_id;
        state.publications.insert(
            id,
            StoredPublication {
                id,
                title: publication.title.clone(),
                year: publication.year,
                url: publication.url.clone(),
                citations: publication.citations,
                scholar_publication_id: publication.scholar_publication_id.clone(),
                authors: None,
                journal: None,
                publisher: None,
                publication_date: None,
                author_order: None,
            },
        );
        state.links.insert((subject_id, id), None);
        state.writes += 1;
        Ok(id)
    }

    async fn patch_publication(
        &self,
        subject_id: SubjectId,
        publication_id: PublicationId,
        patch: &PublicationPatch,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        check_write(&state, "patch publication")?;
        let mut updated = state
            .publications
            .get(&publication_id)
            .cloned()
            .ok_or_else(|| StoreError::persistence("patch publication", "unknown publication"))?;
        let mut author_order = None;

        for (field, value) in patch.iter() {
            match field {
                PublicationField::Title => updated.title = text(*field, value)?.unwrap_or_default(),
                PublicationField::Authors => updated.authors = text(*field, value)?,
                PublicationField::Journal => updated.journal = text(*field, value)?,
                PublicationField::Publisher => updated.publisher = text(*field, value)?,
                PublicationField::Citations => updated.citations = int(*field, value)?,
                PublicationField::PublicationDate => match value {
                    PatchValue::Date(d) => updated.publication_date = *d,
                    other => {
                        return Err(StoreError::persistence(
                            "patch publication",
                            format!("publication_date cannot hold {other:?}"),
                        ))
                    }
                },
                PublicationField::AuthorOrder => {
                    let order = int(*field, value)?;
                    author_order = Some(i32::try_from(order).map_err(|_| {
                        StoreError::persistence("patch publication", "author_order out of range")
                    })?);
                }
            }
        }

        state.publications.insert(publication_id, updated);
        if let Some(order) = author_order {
            state.links.insert((subject_id, publication_id), Some(order));
        }
        state.writes += 1;
        Ok(())
    }

    async fn insert_statistics(
        &self,
        subject_id: SubjectId,
        statistics: &StaffStatistics,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        check_write(&state, "insert staff_statistics")?;
        if state.statistics.contains_key(&subject_id) {
            return Err(StoreError::persistence(
                "insert staff_statistics",
                "duplicate key",
            ));
        }
        state.statistics.insert(subject_id, *statistics);
        state.writes += 1;
        Ok(())
    }

    async fn patch_statistics(
        &self,
        subject_id: SubjectId,
        patch: &StatisticsPatch,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        check_write(&state, "patch staff_statistics")?;
        let Some(mut stats) = state.statistics.get(&subject_id).copied() else {
            return Ok(());
        };
        for (field, value) in patch.iter() {
            let PatchValue::Int(v) = value else {
                return Err(StoreError::persistence(
                    "patch staff_statistics",
                    format!("{field:?} cannot hold {value:?}"),
                ));
            };
            stats.set(*field, *v);
        }
        state.statistics.insert(subject_id, stats);
        state.writes += 1;
        Ok(())
    }

    async fn apply_time_series_ops(
        &self,
        owner: GraphOwner,
        ops: &[TimeSeriesOp],
    ) -> Result<usize, StoreError> {
        let mut state = self.lock();
        check_read(&state)?;
        let fail_writes = state.fail_writes;
        let graph = match owner {
            GraphOwner::Staff(id) => state.staff_graphs.entry(id).or_default(),
            GraphOwner::Publication(id) => state.publication_graphs.entry(id).or_default(),
        };

        let mut applied = 0;
        for op in ops {
            if fail_writes {
                error!(?owner, ?op, "time series write skipped: write rejected");
                continue;
            }
            match *op {
                TimeSeriesOp::Insert { year, citations } => {
                    if graph.contains_year(year) {
                        error!(?owner, year, "time series write skipped: duplicate key");
                        continue;
                    }
                    graph.insert(year, citations);
                }
                TimeSeriesOp::Update { year, citations } => {
                    if graph.contains_year(year) {
                        graph.insert(year, citations);
                    }
                }
                TimeSeriesOp::Delete { year } => {
                    graph.remove(year);
                }
            }
            applied += 1;
        }
        state.writes += applied;
        Ok(applied)
    }
}

#[async_trait]
impl ReadStore for MemoryStore {
    async fn departments(&self) -> Result<Vec<Department>, StoreError> {
        let state = self.lock();
        check_read(&state)?;
        let mut departments = state.departments.clone();
        departments.sort_by_key(|d| d.department_id);
        Ok(departments)
    }

    async fn roles(&self) -> Result<Vec<Role>, StoreError> {
        let state = self.lock();
        check_read(&state)?;
        let mut roles = state.roles.clone();
        roles.sort_by_key(|r| r.role_id);
        Ok(roles)
    }

    async fn staff_by_affiliation(
        &self,
        departments: &[i64],
        roles: &[i64],
    ) -> Result<Vec<StaffSummary>, StoreError> {
        let state = self.lock();
        check_read(&state)?;
        Ok(summaries_where(&state, |_, department, role| {
            department.is_some_and(|d| departments.contains(&d))
                && role.is_some_and(|r| roles.contains(&r))
        }))
    }

    async fn staff_by_ids(&self, ids: &[SubjectId]) -> Result<Vec<StaffSummary>, StoreError> {
        let state = self.lock();
        check_read(&state)?;
        let wanted: HashSet<SubjectId> = ids.iter().copied().collect();
        Ok(summaries_where(&state, |subject, _, _| wanted.contains(&subject.id)))
    }

    async fn staff_citation_graph(
        &self,
        staff_id: SubjectId,
    ) -> Result<CitationGraph, StoreError> {
        let state = self.lock();
        check_read(&state)?;
        Ok(state.staff_graphs.get(&staff_id).cloned().unwrap_or_default())
    }

    async fn staff_publications(
        &self,
        staff_id: SubjectId,
    ) -> Result<Vec<StoredPublication>, StoreError> {
        let state = self.lock();
        check_read(&state)?;
        Ok(publications_for(&state, staff_id))
    }
}
