//! Read-only JSON API over the synced citation data.

mod stats;
mod token;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gsync_core::SubjectId;
use gsync_storage::{ReadStore, StoreError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub use stats::{
    department_statistics, publications_per_year, DepartmentStatistics, GroupStatistics,
    PublicationsPerYear,
};
pub use token::{decode_id_token, encode_id_token, TokenError, MAX_TOKEN_ID};

pub const CRATE_NAME: &str = "gsync-web";

pub const DEFAULT_PORT: u16 = 8000;

const AFFILIATION_REQUIRED: &str = "Missing or invalid 'departments' or 'roles'";
const IDS_REQUIRED: &str = "Missing or invalid 'ids' or 'token'";
const STAFF_ID_REQUIRED: &str = "Missing or invalid staff id";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ReadStore>) -> Self {
        Self { store }
    }
}

/// How the id lists of a request are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdEncoding {
    CommaList,
    Token,
}

#[derive(Debug, Default, Deserialize)]
struct AffiliationQuery {
    departments: Option<String>,
    roles: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OverallQuery {
    ids: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StaffQuery {
    id: Option<String>,
    token: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/departments/all", get(departments_handler))
        .route("/departments/statistics", get(department_stats_handler))
        .route("/departments/statistics/ids", get(department_stats_handler))
        .route("/departments/statistics/token", get(department_stats_token_handler))
        .route("/roles", get(roles_handler))
        .route("/staff/overall", get(staff_overall_handler))
        .route("/staff/publications", get(staff_publications_handler))
        .route("/staff/publications/per_year", get(publications_per_year_handler))
        .route("/staff/citations/per_year", get(citations_per_year_handler))
        .route("/staff/stats", get(staff_stats_handler))
        .route("/staff/stats/token", get(staff_stats_token_handler))
        .fallback(fallback_handler)
        .method_not_allowed_fallback(method_not_allowed_handler)
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("GSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn bad_request(message: &'static str) -> Response {
    json_error(StatusCode::BAD_REQUEST, message)
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "read api query failed");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err}"),
    )
}

async fn fallback_handler(method: Method) -> Response {
    if method == Method::GET || method == Method::HEAD {
        json_error(StatusCode::NOT_FOUND, "Endpoint not found")
    } else {
        method_not_allowed_handler().await
    }
}

async fn method_not_allowed_handler() -> Response {
    json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

/// Parses `1,2,3`. Blank or non-numeric entries make the whole list invalid.
fn parse_id_list(raw: &str) -> Option<Vec<i64>> {
    raw.split(',')
        .map(|part| part.trim().parse::<i64>().ok())
        .collect()
}

fn decode_ids(raw: &str, encoding: IdEncoding) -> Option<Vec<i64>> {
    let ids = match encoding {
        IdEncoding::CommaList => parse_id_list(raw)?,
        IdEncoding::Token => decode_id_token(raw).ok()?,
    };
    (!ids.is_empty()).then_some(ids)
}

fn affiliation(query: &AffiliationQuery, encoding: IdEncoding) -> Option<(Vec<i64>, Vec<i64>)> {
    let departments = decode_ids(query.departments.as_deref()?, encoding)?;
    let roles = decode_ids(query.roles.as_deref()?, encoding)?;
    Some((departments, roles))
}

/// A single positive staff id, from a numeric `id` or else from a token
/// holding exactly one id.
fn staff_id(query: &StaffQuery) -> Option<SubjectId> {
    let numeric = query
        .id
        .as_deref()
        .and_then(|raw| raw.trim().parse::<SubjectId>().ok());
    let id = match numeric {
        Some(id) => id,
        None => match decode_id_token(query.token.as_deref()?).ok()?.as_slice() {
            [only] => *only,
            _ => return None,
        },
    };
    (id > 0).then_some(id)
}

async fn departments_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.departments().await {
        Ok(departments) => Json(departments).into_response(),
        Err(err) => server_error(err),
    }
}

async fn roles_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.roles().await {
        Ok(roles) => Json(roles).into_response(),
        Err(err) => server_error(err),
    }
}

async fn department_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AffiliationQuery>,
) -> Response {
    department_stats(&state, &query, IdEncoding::CommaList).await
}

async fn department_stats_token_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AffiliationQuery>,
) -> Response {
    department_stats(&state, &query, IdEncoding::Token).await
}

async fn department_stats(
    state: &AppState,
    query: &AffiliationQuery,
    encoding: IdEncoding,
) -> Response {
    let Some((departments, roles)) = affiliation(query, encoding) else {
        return bad_request(AFFILIATION_REQUIRED);
    };
    let known = match state.store.departments().await {
        Ok(known) => known,
        Err(err) => return server_error(err),
    };
    match state.store.staff_by_affiliation(&departments, &roles).await {
        Ok(staff) => Json(department_statistics(&known, &departments, &staff)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn staff_overall_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OverallQuery>,
) -> Response {
    let ids = match (&query.ids, &query.token) {
        (Some(raw), _) => decode_ids(raw, IdEncoding::CommaList),
        (None, Some(token)) => decode_ids(token, IdEncoding::Token),
        (None, None) => None,
    };
    let Some(ids) = ids else {
        return bad_request(IDS_REQUIRED);
    };
    match state.store.staff_by_ids(&ids).await {
        Ok(staff) => Json(GroupStatistics::over(&staff)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn staff_publications_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StaffQuery>,
) -> Response {
    let Some(staff_id) = staff_id(&query) else {
        return bad_request(STAFF_ID_REQUIRED);
    };
    match state.store.staff_publications(staff_id).await {
        Ok(publications) => Json(publications).into_response(),
        Err(err) => server_error(err),
    }
}

async fn publications_per_year_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StaffQuery>,
) -> Response {
    let Some(staff_id) = staff_id(&query) else {
        return bad_request(STAFF_ID_REQUIRED);
    };
    match state.store.staff_publications(staff_id).await {
        Ok(publications) => Json(json!({
            "staff_id": staff_id,
            "publications_per_year": publications_per_year(&publications),
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn citations_per_year_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StaffQuery>,
) -> Response {
    let Some(staff_id) = staff_id(&query) else {
        return bad_request(STAFF_ID_REQUIRED);
    };
    match state.store.staff_citation_graph(staff_id).await {
        Ok(graph) => Json(json!({
            "staff_id": staff_id,
            "citations_per_year": graph.iter().collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn staff_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AffiliationQuery>,
) -> Response {
    staff_stats(&state, &query, IdEncoding::CommaList).await
}

async fn staff_stats_token_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AffiliationQuery>,
) -> Response {
    staff_stats(&state, &query, IdEncoding::Token).await
}

async fn staff_stats(
    state: &AppState,
    query: &AffiliationQuery,
    encoding: IdEncoding,
) -> Response {
    let Some((departments, roles)) = affiliation(query, encoding) else {
        return bad_request(AFFILIATION_REQUIRED);
    };
    match state.store.staff_by_affiliation(&departments, &roles).await {
        Ok(staff) => Json(staff).into_response(),
        Err(err) => server_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use gsync_core::{CitationGraph, GraphOwner, StaffStatistics, StoredPublication, Subject};
    use gsync_storage::MemoryStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.add_department(10, "Informatics");
        store.add_department(20, "Physics");
        store.add_role(1, "Professor");
        store.add_role(2, "Lecturer");
        for (id, scholar_id, name) in [
            (1, "mp", "Maria Papadopoulou"),
            (2, "js", "John Smith"),
            (3, "wz", "Wei Zhang"),
        ] {
            store.add_subject(Subject {
                id,
                scholar_id: scholar_id.into(),
                name: name.into(),
            });
        }
        store.set_affiliation(1, 10, 1);
        store.set_affiliation(2, 10, 2);
        store.set_affiliation(3, 20, 1);
        store.seed_statistics(
            1,
            StaffStatistics {
                total_citations: 412,
                last_5y_citations: 198,
                h_index: 11,
                i10_index: 12,
                ..StaffStatistics::default()
            },
        );
        store.seed_statistics(
            3,
            StaffStatistics {
                total_citations: 88,
                last_5y_citations: 40,
                h_index: 5,
                i10_index: 2,
                ..StaffStatistics::default()
            },
        );
        let graph: CitationGraph = [(2022, 40), (2023, 88)].into_iter().collect();
        store.seed_graph(GraphOwner::Staff(1), graph);
        for (id, year) in [(40, Some(2021)), (41, Some(2015)), (42, Some(2021))] {
            store.seed_publication(
                1,
                StoredPublication {
                    id,
                    title: format!("Work {id}"),
                    year,
                    url: format!("https://scholar.example/{id}"),
                    citations: 5,
                    scholar_publication_id: None,
                    authors: None,
                    journal: None,
                    publisher: None,
                    publication_date: None,
                    author_order: Some(1),
                },
            );
        }
        store
    }

    fn test_app() -> Router {
        app(AppState::new(seeded_store()))
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router is infallible");
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .expect("body collects")
            .to_bytes();
        let value = serde_json::from_slice(&body).expect("body is json");
        (status, value)
    }

    async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
        call(test_app(), Method::GET, uri).await
    }

    #[tokio::test]
    async fn lookup_lists_are_served() {
        let (status, body) = get_json("/departments/all").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["department_name"], "Informatics");
        assert_eq!(body.as_array().map(Vec::len), Some(2));

        let (status, body) = get_json("/roles").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[1]["role_id"], 2);
    }

    #[tokio::test]
    async fn department_statistics_accept_ids_and_tokens() {
        let (status, body) = get_json("/departments/statistics/ids?departments=10,20&roles=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["department_id"], 10);
        assert_eq!(body[0]["staff_count"], 1);
        assert_eq!(body[0]["total_citations"], 412);
        assert_eq!(body[1]["department_id"], 20);
        assert_eq!(body[1]["average_h_index"], 5.0);

        let departments = encode_id_token(&[10, 20]).expect("ids fit");
        let roles = encode_id_token(&[1]).expect("ids fit");
        let (status, token_body) = get_json(&format!(
            "/departments/statistics/token?departments={departments}&roles={roles}"
        ))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(token_body, body);
    }

    #[tokio::test]
    async fn missing_or_garbled_filters_are_bad_requests() {
        for uri in [
            "/departments/statistics?departments=10",
            "/departments/statistics?departments=10,x&roles=1",
            "/departments/statistics/token?departments=@@@&roles=AA",
            "/staff/stats?roles=1",
        ] {
            let (status, body) = get_json(uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["error"], AFFILIATION_REQUIRED, "{uri}");
        }
    }

    #[tokio::test]
    async fn overall_statistics_cover_the_requested_staff() {
        let (status, body) = get_json("/staff/overall?ids=1,3,99").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["staff_count"], 2);
        assert_eq!(body["total_citations"], 500);
        assert_eq!(body["max_h_index"], 11);
        assert_eq!(body["publication_count"], 3);

        let token = encode_id_token(&[1, 3]).expect("ids fit");
        let (_, by_token) = get_json(&format!("/staff/overall?token={token}")).await;
        assert_eq!(by_token["total_citations"], 500);

        let (status, body) = get_json("/staff/overall").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], IDS_REQUIRED);
    }

    #[tokio::test]
    async fn per_year_series_are_keyed_by_staff() {
        let (status, body) = get_json("/staff/publications/per_year?id=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["staff_id"], 1);
        assert_eq!(
            body["publications_per_year"],
            json!([{"year": 2015, "publications": 1}, {"year": 2021, "publications": 2}])
        );

        let token = encode_id_token(&[1]).expect("id fits");
        let (status, body) = get_json(&format!("/staff/citations/per_year?token={token}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["citations_per_year"],
            json!([{"year": 2022, "citations": 40}, {"year": 2023, "citations": 88}])
        );
    }

    #[tokio::test]
    async fn staff_id_must_be_single_and_positive() {
        let two = encode_id_token(&[1, 3]).expect("ids fit");
        for uri in [
            "/staff/publications".to_string(),
            "/staff/publications?id=0".to_string(),
            "/staff/publications?id=abc".to_string(),
            format!("/staff/citations/per_year?token={two}"),
        ] {
            let (status, body) = get_json(&uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["error"], STAFF_ID_REQUIRED, "{uri}");
        }

        let (status, body) = get_json("/staff/publications?id=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(3));
        assert_eq!(body[0]["author_order"], 1);
    }

    #[tokio::test]
    async fn staff_listing_filters_by_department_and_role() {
        let (status, body) = get_json("/staff/stats?departments=10&roles=1,2").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().expect("listing is an array");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "Maria Papadopoulou");
        assert_eq!(rows[0]["h_index"], 11);
        assert!(rows[1].get("h_index").is_none(), "unsynced staff carry no statistics");
    }

    #[tokio::test]
    async fn unknown_routes_and_other_methods_get_json_errors() {
        let (status, body) = get_json("/publications").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Endpoint not found");

        let (status, body) = call(test_app(), Method::POST, "/roles").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["error"], "Method not allowed");

        let (status, _) = call(test_app(), Method::DELETE, "/nowhere").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn store_outage_is_a_server_error() {
        let store = seeded_store();
        store.set_unavailable(true);
        let (status, body) = call(app(AppState::new(store)), Method::GET, "/roles").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"]
            .as_str()
            .is_some_and(|e| e.starts_with("Server error:")));
    }
}
