// Read-only HTTP surface over the lock store for services that edit
// documents outside the WebSocket protocol.

use axum::{
    extract::{rejection::PathRejection, Path, State},
    routing::get,
    Json, Router,
};
use doclock_common::types::LockStatus;
use uuid::Uuid;

use crate::{
    error::{ErrorCode, RelayError},
    lock::LockService,
};

pub fn router(service: LockService) -> Router {
    Router::new()
        .route("/v1/documents/{document_id}/lock", get(get_document_lock))
        .with_state(service)
}

async fn get_document_lock(
    State(service): State<LockService>,
    document_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<LockStatus>, RelayError> {
    let Path(document_id) = document_id.map_err(|rejection| {
        RelayError::new(ErrorCode::ValidationFailed, rejection.body_text())
    })?;

    let status = service.coordinator().get_lock_status(document_id).await?;
    Ok(Json(status))
}

#[cfg(test)]
mod tests {
    use super::router;
    use crate::lock::{LockService, LockStore, StealTimings};
    use crate::bus::LockBus;
    use crate::ws::connections::ConnectionRegistry;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use doclock_common::types::{Actor, LockMode, LockStatus};
    use serde_json::Value;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn member(name: &str) -> Actor {
        Actor {
            account_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            display_name: name.to_string(),
            workspace_id: Uuid::new_v4(),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let body =
            to_bytes(response.into_body(), usize::MAX).await.expect("response body should read");
        serde_json::from_slice(&body).expect("response body should be valid json")
    }

    fn get(uri: String) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    #[tokio::test]
    async fn unlocked_document_reports_no_holder() {
        let service = LockService::in_memory(StealTimings::default());
        let document_id = Uuid::new_v4();

        let response = router(service)
            .oneshot(get(format!("/v1/documents/{document_id}/lock")))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let status: LockStatus = read_json(response).await;
        assert_eq!(status, LockStatus::unlocked(document_id));
    }

    #[tokio::test]
    async fn held_document_reports_holder_and_head_request() {
        let service = LockService::in_memory(StealTimings::default());
        let document_id = Uuid::new_v4();
        let holder = member("Holder");
        let requester = member("Requester");

        service
            .coordinator()
            .acquire_standard_lock(document_id, &holder)
            .await
            .expect("acquire should succeed");
        service
            .coordinator()
            .register_steal_request(document_id, &requester)
            .await
            .expect("steal request should register");

        let response = router(service)
            .oneshot(get(format!("/v1/documents/{document_id}/lock")))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let status: LockStatus = read_json(response).await;
        assert_eq!(status.mode, LockMode::Standard);
        assert_eq!(status.holder_account_id(), Some(holder.account_id));
        assert_eq!(
            status.steal_request.map(|request| request.requester_account_id),
            Some(requester.account_id)
        );
    }

    #[tokio::test]
    async fn malformed_document_id_is_a_validation_error() {
        let service = LockService::in_memory(StealTimings::default());

        let response = router(service)
            .oneshot(get("/v1/documents/not-a-uuid/lock".to_string()))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = read_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn offline_store_maps_to_service_unavailable() {
        let store = LockStore::memory();
        let LockStore::Memory(memory) = &store else {
            unreachable!("memory constructor returns the memory backend");
        };
        memory.set_offline(true);
        let service = LockService::new(
            store,
            LockBus::Local(ConnectionRegistry::default()),
            StealTimings::default(),
            None,
        );

        let response = router(service)
            .oneshot(get(format!("/v1/documents/{}/lock", Uuid::new_v4())))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = read_json(response).await;
        assert_eq!(body["error"]["code"], "STORE_UNAVAILABLE");
        assert_eq!(body["error"]["retryable"], true);
    }
}
