use anyhow::Context;
use async_trait::async_trait;
use gsync_core::{
    CitationGraph, CitationYearPoint, Department, GraphOwner, Role, StaffSummary, NewPublication, PatchField, PatchValue, PublicationField,
    PublicationId, PublicationPatch, SparsePatch, StaffStatistics, StatisticsPatch, StatsField,
    StoredPublication, StoredState, Subject, SubjectId, TimeSeriesOp,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, error};

use crate::{ReadStore, Store, StoreError};

fn classify(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(format!("{operation}: {err}")),
        other => StoreError::persistence(operation, other.to_string()),
    }
}

/// Postgres-backed [`Store`] over the schema in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running gsync migrations")
    }

    async fn load_graph(
        &self,
        operation: &'static str,
        sql: &'static str,
        owner_id: i64,
    ) -> Result<CitationGraph, StoreError> {
        let rows = sqlx::query(sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(operation, e))?;
        let points = rows
            .iter()
            .map(|row| -> Result<CitationYearPoint, sqlx::Error> {
                Ok(CitationYearPoint {
                    year: row.try_get("year")?,
                    citations: row.try_get("citations")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| classify(operation, e))?;
        Ok(CitationGraph::from_points(points))
    }

    async fn load_publications(
        &self,
        subject_id: SubjectId,
    ) -> Result<Vec<StoredPublication>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.publication_id,
                   p.publication_title,
                   p.publication_year,
                   p.publication_url,
                   p.citations,
                   p.publication_scholar_id,
                   p.authors,
                   p.journal,
                   p.publisher,
                   p.publication_date,
                   s.author_order
              FROM publications_staff s
              JOIN publications p ON p.publication_id = s.publication_id
             WHERE s.staff_id = $1
             ORDER BY p.publication_id
            "#,
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify("load publications", e))?;
        rows.iter()
            .map(stored_publication)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| classify("decode publications", e))
    }

    async fn apply_one(&self, owner: GraphOwner, op: &TimeSeriesOp) -> Result<(), StoreError> {
        let (table, key, owner_id) = match owner {
            GraphOwner::Staff(id) => ("staff_citations_per_year", "staff_id", id),
            GraphOwner::Publication(id) => ("publication_citations_per_year", "publication_id", id),
        };
        let result = match *op {
            TimeSeriesOp::Insert { year, citations } => {
                sqlx::query(&format!(
                    "INSERT INTO {table} ({key}, year, citations) VALUES ($1, $2, $3)"
                ))
                .bind(owner_id)
                .bind(year)
                .bind(citations)
                .execute(&self.pool)
                .await
            }
            TimeSeriesOp::Update { year, citations } => {
                sqlx::query(&format!(
                    "UPDATE {table} SET citations = $1 WHERE {key} = $2 AND year = $3"
                ))
                .bind(citations)
                .bind(owner_id)
                .bind(year)
                .execute(&self.pool)
                .await
            }
            TimeSeriesOp::Delete { year } => {
                sqlx::query(&format!("DELETE FROM {table} WHERE {key} = $1 AND year = $2"))
                    .bind(owner_id)
                    .bind(year)
                    .execute(&self.pool)
                    .await
            }
        };
        result.map(|_| ()).map_err(|e| classify("apply_time_series_op", e))
    }
}

/// Appends `col = $n, col = $m, ...` for every entry of the patch.
fn push_assignments<'a, F: PatchField>(
    builder: &mut QueryBuilder<'a, Postgres>,
    patch: &SparsePatch<F>,
) {
    let mut assignments = builder.separated(", ");
    for (field, value) in patch.iter() {
        assignments.push(format!("{} = ", field.column()));
        match value {
            PatchValue::Int(v) => assignments.push_bind_unseparated(*v),
            PatchValue::Text(v) => assignments.push_bind_unseparated(v.clone()),
            PatchValue::Date(v) => assignments.push_bind_unseparated(*v),
        };
    }
}

/// `UPDATE publications` for the non-link fields, `UPDATE publications_staff`
/// for the author order. Either side is `None` when it has nothing to set.
fn publication_patch_queries(
    subject_id: SubjectId,
    publication_id: PublicationId,
    patch: &PublicationPatch,
) -> (
    Option<QueryBuilder<'static, Postgres>>,
    Option<QueryBuilder<'static, Postgres>>,
) {
    let (link, fields) = patch
        .clone()
        .partition(|f| f == PublicationField::AuthorOrder);

    let publication = (!fields.is_empty()).then(|| {
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE publications SET ");
        push_assignments(&mut builder, &fields);
        builder.push(" WHERE publication_id = ");
        builder.push_bind(publication_id);
        builder
    });
    let author_order = (!link.is_empty()).then(|| {
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE publications_staff SET ");
        push_assignments(&mut builder, &link);
        builder.push(" WHERE staff_id = ");
        builder.push_bind(subject_id);
        builder.push(" AND publication_id = ");
        builder.push_bind(publication_id);
        builder
    });
    (publication, author_order)
}

fn statistics_insert_query(
    subject_id: SubjectId,
    statistics: &StaffStatistics,
) -> QueryBuilder<'static, Postgres> {
    let columns = StatsField::ALL.map(|f| f.column()).join(", ");
    let mut builder = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO staff_statistics (staff_id, {columns}) VALUES ("
    ));
    let mut values = builder.separated(", ");
    values.push_bind(subject_id);
    for value in statistics.to_slots() {
        values.push_bind(value);
    }
    builder.push(")");
    builder
}

fn statistics_patch_query(
    subject_id: SubjectId,
    patch: &StatisticsPatch,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new("UPDATE staff_statistics SET ");
    push_assignments(&mut builder, patch);
    builder.push(" WHERE staff_id = ");
    builder.push_bind(subject_id);
    builder
}

fn stored_publication(row: &PgRow) -> Result<StoredPublication, sqlx::Error> {
    Ok(StoredPublication {
        id: row.try_get("publication_id")?,
        title: row.try_get("publication_title")?,
        year: row.try_get("publication_year")?,
        url: row.try_get("publication_url")?,
        citations: row.try_get("citations")?,
        scholar_publication_id: row.try_get("publication_scholar_id")?,
        authors: row.try_get("authors")?,
        journal: row.try_get("journal")?,
        publisher: row.try_get("publisher")?,
        publication_date: row.try_get("publication_date")?,
        author_order: row
            .try_get::<Option<i64>, _>("author_order")?
            .and_then(|v| i32::try_from(v).ok()),
    })
}

fn staff_statistics(row: &PgRow) -> Result<StaffStatistics, sqlx::Error> {
    let mut stats = StaffStatistics::default();
    for field in StatsField::ALL {
        stats.set(field, row.try_get(field.column())?);
    }
    Ok(stats)
}

/// Staff listing with stored statistics; `filter` is the WHERE clause.
fn staff_summary_sql(filter: &str) -> String {
    let statistics = StatsField::ALL
        .map(|f| format!("st.{0} AS {0}", f.column()))
        .join(",\n                   ");
    format!(
        r#"
            SELECT s.staff_id,
                   CONCAT(s.first_name, ' ', s.last_name) AS name,
                   s.scholar_id,
                   s.department_id,
                   s.role_id,
                   (SELECT COUNT(*) FROM publications_staff ps WHERE ps.staff_id = s.staff_id)
                       AS publication_count,
                   st.staff_id IS NOT NULL AS has_statistics,
                   {statistics}
              FROM staff s
              LEFT JOIN staff_statistics st ON st.staff_id = s.staff_id
             WHERE {filter}
             ORDER BY s.staff_id
            "#
    )
}

fn staff_summary(row: &PgRow) -> Result<StaffSummary, sqlx::Error> {
    let statistics = if row.try_get::<bool, _>("has_statistics")? {
        Some(staff_statistics(row)?)
    } else {
        None
    };
    Ok(StaffSummary {
        staff_id: row.try_get("staff_id")?,
        name: row.try_get("name")?,
        scholar_id: row.try_get("scholar_id")?,
        department_id: row.try_get("department_id")?,
        role_id: row.try_get("role_id")?,
        publication_count: row.try_get("publication_count")?,
        statistics,
    })
}

impl PgStore {
    async fn staff_summaries(
        &self,
        operation: &'static str,
        sql: &str,
        binds: &[&[i64]],
    ) -> Result<Vec<StaffSummary>, StoreError> {
        let mut query = sqlx::query(sql);
        for values in binds {
            query = query.bind(values.to_vec());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(operation, e))?;
        rows.iter()
            .map(staff_summary)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| classify(operation, e))
    }
}

#[async_trait]
impl ReadStore for PgStore {
    async fn departments(&self) -> Result<Vec<Department>, StoreError> {
        let rows = sqlx::query(
            "SELECT department_id, department_name FROM departments ORDER BY department_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify("load departments", e))?;
        rows.iter()
            .map(|row| -> Result<Department, sqlx::Error> {
                Ok(Department {
                    department_id: row.try_get("department_id")?,
                    department_name: row.try_get("department_name")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| classify("decode departments", e))
    }

    async fn roles(&self) -> Result<Vec<Role>, StoreError> {
        let rows = sqlx::query("SELECT role_id, role_name FROM roles ORDER BY role_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("load roles", e))?;
        rows.iter()
            .map(|row| -> Result<Role, sqlx::Error> {
                Ok(Role {
                    role_id: row.try_get("role_id")?,
                    role_name: row.try_get("role_name")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| classify("decode roles", e))
    }

    async fn staff_by_affiliation(
        &self,
        departments: &[i64],
        roles: &[i64],
    ) -> Result<Vec<StaffSummary>, StoreError> {
        let sql = staff_summary_sql("s.department_id = ANY($1) AND s.role_id = ANY($2)");
        self.staff_summaries("load staff by affiliation", &sql, &[departments, roles])
            .await
    }

    async fn staff_by_ids(&self, ids: &[SubjectId]) -> Result<Vec<StaffSummary>, StoreError> {
        let sql = staff_summary_sql("s.staff_id = ANY($1)");
        self.staff_summaries("load staff by id", &sql, &[ids]).await
    }

    async fn staff_citation_graph(
        &self,
        staff_id: SubjectId,
    ) -> Result<CitationGraph, StoreError> {
        self.load_graph(
            "load staff_citations_per_year",
            "SELECT year, citations FROM staff_citations_per_year WHERE staff_id = $1",
            staff_id,
        )
        .await
    }

    async fn staff_publications(
        &self,
        staff_id: SubjectId,
    ) -> Result<Vec<StoredPublication>, StoreError> {
        self.load_publications(staff_id).await
    }
}

#[async_trait]
impl Store for PgStore {
    async fn subjects(&self) -> Result<Vec<Subject>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT staff_id,
                   scholar_id,
                   CONCAT(first_name, ' ', last_name) AS name
              FROM staff
             WHERE scholar_id IS NOT NULL
               AND scholar_id <> ''
             ORDER BY staff_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify("load subjects", e))?;

        rows.iter()
            .map(|row| -> Result<Subject, sqlx::Error> {
                Ok(Subject {
                    id: row.try_get("staff_id")?,
                    scholar_id: row.try_get("scholar_id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| classify("load subjects", e))
    }

    async fn current_state(&self, subject_id: SubjectId) -> Result<StoredState, StoreError> {
        let columns = StatsField::ALL.map(|f| f.column()).join(", ");
        let statistics = sqlx::query(&format!(
            "SELECT {columns} FROM staff_statistics WHERE staff_id = $1"
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify("load staff_statistics", e))?
        .map(|row| staff_statistics(&row))
        .transpose()
        .map_err(|e| classify("decode staff_statistics", e))?;

        let citation_graph = self.staff_citation_graph(subject_id).await?;
        let publications = self.load_publications(subject_id).await?;

        Ok(StoredState {
            statistics,
            citation_graph,
            publications,
        })
    }

    async fn publication_graph(
        &self,
        publication_id: PublicationId,
    ) -> Result<CitationGraph, StoreError> {
        self.load_graph(
            "load publication_citations_per_year",
            "SELECT year, citations FROM publication_citations_per_year WHERE publication_id = $1",
            publication_id,
        )
        .await
    }

    async fn insert_publication(
        &self,
        subject_id: SubjectId,
        publication: &NewPublication,
    ) -> Result<PublicationId, StoreError> {
        let op = "insert publication";
        let mut tx = self.pool.begin().await.map_err(|e| classify(op, e))?;
        let publication_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO publications
                   (publication_title, citations, publication_url, publication_year, publication_scholar_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING publication_id
            "#,
        )
        .bind(&publication.title)
        .bind(publication.citations)
        .bind(&publication.url)
        .bind(publication.year)
        .bind(&publication.scholar_publication_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify(op, e))?;

        sqlx::query("INSERT INTO publications_staff (staff_id, publication_id) VALUES ($1, $2)")
            .bind(subject_id)
            .bind(publication_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(op, e))?;

        tx.commit().await.map_err(|e| classify(op, e))?;
        debug!(publication_id, staff_id = subject_id, "inserted publication");
        Ok(publication_id)
    }

    async fn patch_publication(
        &self,
        subject_id: SubjectId,
        publication_id: PublicationId,
        patch: &PublicationPatch,
    ) -> Result<(), StoreError> {
        let (publication, author_order) =
            publication_patch_queries(subject_id, publication_id, patch);

        if let Some(mut builder) = publication {
            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| classify("patch publication", e))?;
        }
        if let Some(mut builder) = author_order {
            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| classify("patch publication author_order", e))?;
        }
        Ok(())
    }

    async fn insert_statistics(
        &self,
        subject_id: SubjectId,
        statistics: &StaffStatistics,
    ) -> Result<(), StoreError> {
        statistics_insert_query(subject_id, statistics)
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| classify("insert staff_statistics", e))?;
        Ok(())
    }

    async fn patch_statistics(
        &self,
        subject_id: SubjectId,
        patch: &StatisticsPatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        statistics_patch_query(subject_id, patch)
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| classify("patch staff_statistics", e))?;
        Ok(())
    }

    async fn apply_time_series_ops(
        &self,
        owner: GraphOwner,
        ops: &[TimeSeriesOp],
    ) -> Result<usize, StoreError> {
        let mut applied = 0;
        for op in ops {
            match self.apply_one(owner, op).await {
                Ok(()) => applied += 1,
                Err(err) if err.is_unavailable() => return Err(err),
                Err(err) => error!(?owner, ?op, error = %err, "time series write skipped"),
            }
        }
        Ok(applied)
    }
}
