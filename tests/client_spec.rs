use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use featherbone::featherbone_core::{
    Catalog, Change, DataSource, DataSourceError, Model, ModelError, PushFeed, Request,
};
use featherbone::{open_session, ClientConfig, ClientError, HttpDataSource};
use serde_json::{json, Value};

const API_KEY: &str = "secret-key";

async fn read_contact(Path(id): Path<String>) -> Response {
    if id == "missing" {
        return (StatusCode::NOT_FOUND, "no such record").into_response();
    }
    Json(json!({"id": id, "name": "Ann", "etag": "v1"})).into_response()
}

async fn patch_contact(headers: HeaderMap, Json(ops): Json<Value>) -> Response {
    let if_match = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok());
    if if_match != Some("v1") {
        return (StatusCode::CONFLICT, "etag mismatch").into_response();
    }
    let mut response = ops.as_array().cloned().unwrap_or_default();
    response.push(json!({"op": "replace", "path": "/etag", "value": "v2"}));
    Json(Value::Array(response)).into_response()
}

async fn delete_contact() -> Json<Value> {
    Json(json!(true))
}

async fn post_contact(Json(mut body): Json<Value>) -> Json<Value> {
    body["etag"] = json!("v1");
    Json(body)
}

async fn catalog() -> Json<Value> {
    Json(json!({
        "etag": "c1",
        "data": {
            "Contact": {
                "plural": "Contacts",
                "properties": {"name": {"type": "string"}}
            }
        }
    }))
}

async fn secret(headers: HeaderMap) -> Response {
    let expected = format!("Bearer {API_KEY}");
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(auth) if auth == expected => Json(json!({"ok": true})).into_response(),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn events() -> Response {
    let envelope = json!({
        "message": {
            "subscription": {"subscriptionid": "s1", "change": "update", "deleted": false},
            "data": {"id": "c1", "name": "Bea", "etag": "v2"}
        }
    });
    let body = format!(
        "data: {{\"eventKey\":\"k1\",\"authorized\":true}}\n\n: ping\n\ndata:\n\ndata: {envelope}\n\n"
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

fn app() -> Router {
    Router::new()
        .route(
            "/data/contact/{id}",
            get(read_contact).patch(patch_contact).delete(delete_contact),
        )
        .route("/data/contact", axum::routing::post(post_contact))
        .route("/settings/catalog", get(catalog))
        .route("/secret", get(secret))
        .route("/sse", get(events))
}

async fn serve() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to read address");
    tokio::spawn(async move {
        axum::serve(listener, app()).await.expect("Server failed");
    });
    format!("http://{addr}")
}

async fn contact_catalog(client: &HttpDataSource) -> Catalog {
    let mut catalog = Catalog::new();
    catalog
        .load(client.fetch_catalog().await.expect("Failed to fetch catalog"))
        .expect("Failed to load catalog");
    catalog
}

mod requests {
    use super::*;

    #[tokio::test]
    async fn fetches_a_record() {
        let client = HttpDataSource::new(serve().await, None);
        let body = client
            .request(Request::get("/data/contact/c1"))
            .await
            .expect("Failed to fetch");
        assert_eq!(body["name"], json!("Ann"));
    }

    #[tokio::test]
    async fn maps_not_found() {
        let client = HttpDataSource::new(serve().await, None);
        let err = client
            .send(&Request::get("/data/contact/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));

        let err = DataSourceError::from(err);
        assert_eq!(err.status_code(), Some(DataSourceError::NOT_FOUND));
    }

    #[tokio::test]
    async fn maps_etag_mismatch_to_conflict() {
        let client = HttpDataSource::new(serve().await, None);
        let request = Request::patch("/data/contact/c1", json!([])).with_etag(Some("v0".to_string()));
        let err = client.request(request).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn sends_the_api_key_as_bearer_token() {
        let base = serve().await;
        let anonymous = HttpDataSource::new(base.clone(), None);
        let err = anonymous.send(&Request::get("/secret")).await.unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized));

        let authorized = HttpDataSource::new(base, Some(API_KEY.to_string()));
        let body = authorized.send(&Request::get("/secret")).await.expect("Failed to send");
        assert_eq!(body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn reports_an_unreachable_server_as_transport_failure() {
        let client = HttpDataSource::new("http://127.0.0.1:1", None);
        let err = client.request(Request::get("/data/contact/c1")).await.unwrap_err();
        assert!(matches!(err, DataSourceError::Transport(_)));
    }
}

mod models {
    use super::*;

    #[tokio::test]
    async fn unwraps_the_catalog_payload() {
        let client = HttpDataSource::new(serve().await, None);
        let catalog = contact_catalog(&client).await;
        assert!(catalog.get_feather("Contact").is_some());
    }

    #[tokio::test]
    async fn round_trips_a_record_through_the_server() {
        let client = HttpDataSource::new(serve().await, None);
        let catalog = contact_catalog(&client).await;
        let feather = catalog.get_feather("Contact").unwrap();

        let model = Model::from_fetched(feather, catalog.factories(), &json!({"id": "c1"}));
        model.fetch(&client).await.expect("Failed to fetch");
        assert_eq!(model.state(), "/ready/fetched/clean");
        assert_eq!(model.borrow().etag(), Some("v1"));

        model.borrow_mut().set_value("name", json!("Bea")).unwrap();
        model.save(&client).await.expect("Failed to save");
        assert_eq!(model.state(), "/ready/fetched/clean");
        assert_eq!(model.borrow().etag(), Some("v2"));
        assert_eq!(model.borrow().value("name"), Some(&json!("Bea")));

        model.borrow_mut().set_value("name", json!("Cy")).unwrap();
        let err = model.save(&client).await.unwrap_err();
        assert!(matches!(err, ModelError::Conflict(_)));
        assert_eq!(model.state(), "/ready/fetched/dirty");

        model.fetch(&client).await.expect("Failed to refetch");
        model.delete(&client).await.expect("Failed to delete");
        assert_eq!(model.state(), "/deleted");
    }

    #[tokio::test]
    async fn posts_a_new_record() {
        let client = HttpDataSource::new(serve().await, None);
        let catalog = contact_catalog(&client).await;

        let model = catalog.create("Contact").unwrap();
        model.borrow_mut().set_value("name", json!("Dee")).unwrap();
        model.save(&client).await.expect("Failed to save");
        assert_eq!(model.state(), "/ready/fetched/clean");
        assert_eq!(model.borrow().etag(), Some("v1"));
    }
}

mod events {
    use super::*;

    #[tokio::test]
    async fn opens_a_session_and_reads_envelopes() {
        let config = ClientConfig {
            base_url: serve().await,
            ..ClientConfig::default()
        };
        let client = HttpDataSource::from_config(&config);

        let mut session = open_session(&client, &config).await.expect("Failed to open");
        assert_eq!(session.event_key, "k1");

        let message = session
            .stream
            .next_message()
            .await
            .expect("Failed to read")
            .expect("one message");
        assert_eq!(message.subscription.subscription_id, "s1");
        assert_eq!(message.subscription.change, Change::Update);
        assert_eq!(message.data["name"], json!("Bea"));

        assert!(session.stream.next_message().await.expect("Failed to read").is_none());
    }
}
