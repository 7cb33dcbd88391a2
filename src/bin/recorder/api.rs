use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use rpa_trace::observation::{resize_screenshot, strip_data_uri};
use rpa_trace::{ActionArgs, BBox, RobotAction, SessionRegistry, TraceError};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Session lifecycle notifications streamed over SSE.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Started { task_id: Uuid, name: String },
    ActionStored { task_id: Uuid, step_id: u64, action: String },
    TaskStored { task_id: Uuid, step_id: u64, name: String },
    Saved { task_id: Uuid, name: String },
}

impl SessionEvent {
    fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Started { .. } => "started",
            SessionEvent::ActionStored { .. } => "action_stored",
            SessionEvent::TaskStored { .. } => "task_stored",
            SessionEvent::Saved { .. } => "saved",
        }
    }

    fn to_sse_event(&self) -> Event {
        let data = match self {
            SessionEvent::Started { task_id, name } | SessionEvent::Saved { task_id, name } => {
                json!({ "task_id": task_id, "name": name })
            }
            SessionEvent::ActionStored {
                task_id,
                step_id,
                action,
            } => json!({ "task_id": task_id, "step_id": step_id, "action": action }),
            SessionEvent::TaskStored { task_id, step_id, name } => {
                json!({ "task_id": task_id, "step_id": step_id, "name": name })
            }
        };
        Event::default().event(self.kind()).data(data.to_string())
    }
}

pub struct AppState {
    pub sessions: Mutex<SessionRegistry>,
    pub event_tx: broadcast::Sender<SessionEvent>,
    pub output_dir: PathBuf,
    /// Screenshots are resized to this size, boxes rescaled along.
    pub resize_to: Option<(u32, u32)>,
    pub with_json: bool,
}

impl AppState {
    pub fn new(output_dir: PathBuf, resize_to: Option<(u32, u32)>, with_json: bool) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            sessions: Mutex::new(SessionRegistry::new()),
            event_tx,
            output_dir,
            resize_to,
            with_json,
        }
    }

    fn notify(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound,
    BadRequest(String),
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Task not found".to_string()),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::Internal(detail) => {
                error!(%detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, detail)
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

#[derive(Deserialize)]
struct NewTask {
    task_name: String,
}

#[derive(Deserialize)]
struct EndTask {
    screenshot: String,
}

/// Element box as the browser reports it (`getBoundingClientRect`).
#[derive(Deserialize)]
struct PageBox {
    left: f64,
    top: f64,
    width: f64,
    height: f64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct NewTaskAction {
    screenshot: String,
    action: String,
    task_instruction: String,
    selector_dom: String,
    bbox: Option<PageBox>,
    #[serde(rename = "keySequence")]
    key_sequence: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start_root_task", post(start_root_task))
        .route("/add_page_action/{task_id}", post(add_page_action))
        .route("/add_task/{task_id}", post(add_task))
        .route("/add_task_and_action/{task_id}", post(add_task_and_action))
        .route("/save_task/{task_id}", post(save_task))
        .route("/events", get(sse_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn session_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound)
}

fn bad_request(e: TraceError) -> ApiError {
    ApiError::BadRequest(e.to_string())
}

fn prepare_screenshot(state: &AppState, raw: &str) -> Result<(String, f64, f64), ApiError> {
    let screenshot = strip_data_uri(raw);
    if screenshot.is_empty() {
        return Err(ApiError::BadRequest("Screenshot is required".to_string()));
    }
    match state.resize_to {
        Some((width, height)) => resize_screenshot(screenshot, width, height).map_err(bad_request),
        None => Ok((screenshot.to_string(), 1.0, 1.0)),
    }
}

fn prepare_action(state: &AppState, payload: NewTaskAction) -> Result<(RobotAction, ActionArgs, String), ApiError> {
    let action: RobotAction = payload.action.parse().map_err(bad_request)?;
    let (screenshot, sx, sy) = prepare_screenshot(state, &payload.screenshot)?;

    let bbox = payload
        .bbox
        .map(|b| BBox::new(b.left as i32, b.top as i32, b.width as i32, b.height as i32));
    let selector = match (&bbox, payload.selector_dom.is_empty()) {
        (Some(bbox), true) => bbox.to_string(),
        _ => payload.selector_dom,
    };
    let args = ActionArgs::new(selector, payload.key_sequence, bbox.map(|b| b.scale(sx, sy)));
    Ok((action, args, screenshot))
}

async fn start_root_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> ApiResult {
    let Json(task) = payload?;
    let task_id = state
        .sessions
        .lock()
        .await
        .start(&task.task_name, &state.output_dir, state.with_json);
    info!(%task_id, task = %task.task_name, "session started");
    state.notify(SessionEvent::Started {
        task_id,
        name: task.task_name,
    });
    Ok(Json(json!({ "task_id": task_id })))
}

async fn add_page_action(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    payload: Result<Json<NewTaskAction>, JsonRejection>,
) -> ApiResult {
    let task_id = session_id(&task_id)?;
    let mut sessions = state.sessions.lock().await;
    let session = sessions.get_mut(&task_id).ok_or(ApiError::NotFound)?;

    let Json(payload) = payload?;
    let (action, args, screenshot) = prepare_action(&state, payload)?;
    let step_id = session.store_page_action(action, args, &screenshot);
    state.notify(SessionEvent::ActionStored {
        task_id,
        step_id,
        action: action.name().to_string(),
    });
    Ok(Json(json!({ "message": "Action added successfully" })))
}

async fn add_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> ApiResult {
    let task_id = session_id(&task_id)?;
    let mut sessions = state.sessions.lock().await;
    let session = sessions.get_mut(&task_id).ok_or(ApiError::NotFound)?;

    let Json(task) = payload?;
    if task.task_name.trim().is_empty() {
        return Err(ApiError::BadRequest("Task instruction is required".to_string()));
    }
    let step_id = session.store_task(&task.task_name).map_err(bad_request)?;
    state.notify(SessionEvent::TaskStored {
        task_id,
        step_id,
        name: task.task_name,
    });
    Ok(Json(json!({ "message": "Task added successfully" })))
}

async fn add_task_and_action(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    payload: Result<Json<NewTaskAction>, JsonRejection>,
) -> ApiResult {
    let task_id = session_id(&task_id)?;
    let mut sessions = state.sessions.lock().await;
    let session = sessions.get_mut(&task_id).ok_or(ApiError::NotFound)?;

    let Json(payload) = payload?;
    let instruction = payload.task_instruction.clone();
    if instruction.trim().is_empty() {
        return Err(ApiError::BadRequest("Task instruction is required".to_string()));
    }
    let (action, args, screenshot) = prepare_action(&state, payload)?;

    let action_id = session.store_page_action(action, args, &screenshot);
    let step_id = session.store_task(&instruction).map_err(bad_request)?;
    state.notify(SessionEvent::ActionStored {
        task_id,
        step_id: action_id,
        action: action.name().to_string(),
    });
    state.notify(SessionEvent::TaskStored {
        task_id,
        step_id,
        name: instruction,
    });
    Ok(Json(json!({ "message": "Action and task added successfully" })))
}

async fn save_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    payload: Result<Json<EndTask>, JsonRejection>,
) -> ApiResult {
    let task_id = session_id(&task_id)?;
    if state.sessions.lock().await.get_mut(&task_id).is_none() {
        return Err(ApiError::NotFound);
    }

    let Json(end) = payload?;
    let (screenshot, _, _) = prepare_screenshot(&state, &end.screenshot)?;
    let mut recorder = state
        .sessions
        .lock()
        .await
        .take(&task_id)
        .ok_or(ApiError::NotFound)?;

    // encoding and file writes stay off the async workers
    let (recorder, saved) = tokio::task::spawn_blocking(move || {
        let saved = recorder.save_task(&screenshot);
        (recorder, saved)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("saving task {task_id} panicked: {e}")))?;

    let name = match saved {
        Ok(name) => name,
        Err(e) => {
            state.sessions.lock().await.restore(task_id, recorder);
            return Err(match e {
                e @ TraceError::Protocol(_) => bad_request(e),
                e => {
                    warn!(%task_id, error = %e, "could not save task");
                    ApiError::Internal(e.to_string())
                }
            });
        }
    };
    info!(%task_id, task = %name, "session saved");
    state.notify(SessionEvent::Saved { task_id, name });
    Ok(Json(json!({ "message": "Task ended successfully" })))
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        Err(_) => None,
    });
    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use rpa_trace::dataset::find_traces;
    use rpa_trace::load_trace;
    use rpa_trace::observation::encode_screenshot;
    use std::io::Cursor;
    use tower::ServiceExt;

    fn state(dir: &std::path::Path, resize_to: Option<(u32, u32)>) -> Arc<AppState> {
        Arc::new(AppState::new(dir.to_path_buf(), resize_to, false))
    }

    async fn post(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    async fn start(app: &Router) -> String {
        let (status, body) = post(app, "/start_root_task", json!({ "task_name": "Buy milk" })).await;
        assert_eq!(status, StatusCode::OK);
        body["task_id"].as_str().unwrap().to_string()
    }

    fn png(width: u32, height: u32) -> String {
        let image = ImageBuffer::from_pixel(width, height, Rgb([200u8, 10, 10]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        format!("data:image/png;base64,{}", encode_screenshot(bytes.get_ref()))
    }

    #[tokio::test]
    async fn full_session_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path(), None));
        let id = start(&app).await;

        let click = json!({
            "screenshot": "data:image/png;base64,AAAA",
            "action": "click_at_bbox",
            "bbox": { "left": 10.5, "top": 20.0, "width": 30.0, "height": 40.0 },
        });
        let (status, _) = post(&app, &format!("/add_page_action/{id}"), click).await;
        assert_eq!(status, StatusCode::OK);

        let typing = json!({
            "screenshot": "BBBB",
            "action": "keyboard_input",
            "keySequence": "milk",
            "task_instruction": "Search milk",
        });
        let (status, _) = post(&app, &format!("/add_task_and_action/{id}"), typing).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post(&app, &format!("/save_task/{id}"), json!({ "screenshot": "CCCC" })).await;
        assert_eq!(status, StatusCode::OK);

        let traces = find_traces(dir.path());
        assert_eq!(traces.len(), 1);
        let root = load_trace(&traces[0]).unwrap();
        assert_eq!(root.name, "Buy milk");
        let task = &root.children()[0];
        assert_eq!(task.name, "Search milk");
        let args = task.children()[0].args().unwrap();
        assert_eq!(args.bbox, Some(BBox::new(10, 20, 30, 40)));
        assert_eq!(args.selector, "BBox(x=10, y=20, width=30, height=40)");
        assert_eq!(task.children()[1].args().unwrap().input_string, "milk");
        assert_eq!(&*task.children()[0].start_observation().unwrap().screenshot, "AAAA");

        // the session is gone once saved
        let (status, _) = post(&app, &format!("/save_task/{id}"), json!({ "screenshot": "CCCC" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path(), None));
        let uri = format!("/add_task/{}", Uuid::new_v4());
        let (status, body) = post(&app, &uri, json!({ "task_name": "x" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "Task not found");

        let (status, _) = post(&app, "/add_task/not-a-uuid", json!({ "task_name": "x" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_payloads_are_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path(), None));
        let id = start(&app).await;

        let unknown_action = json!({ "screenshot": "AAAA", "action": "double_click" });
        let (status, _) = post(&app, &format!("/add_page_action/{id}"), unknown_action).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let no_screenshot = json!({ "action": "scroll_down" });
        let (status, _) = post(&app, &format!("/add_page_action/{id}"), no_screenshot).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // nothing buffered to group
        let (status, _) = post(&app, &format!("/add_task/{id}"), json!({ "task_name": "Empty" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post(&app, "/start_root_task", json!({ "name": "wrong field" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn screenshots_are_resized_with_their_boxes() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path(), Some((64, 32))));
        let id = start(&app).await;

        let click = json!({
            "screenshot": png(128, 128),
            "action": "click_at_bbox",
            "bbox": { "left": 64.0, "top": 64.0, "width": 32.0, "height": 32.0 },
        });
        assert_eq!(post(&app, &format!("/add_page_action/{id}"), click).await.0, StatusCode::OK);
        assert_eq!(
            post(&app, &format!("/add_task/{id}"), json!({ "task_name": "Click" })).await.0,
            StatusCode::OK
        );
        assert_eq!(
            post(&app, &format!("/save_task/{id}"), json!({ "screenshot": png(128, 128) })).await.0,
            StatusCode::OK
        );

        let root = load_trace(&find_traces(dir.path())[0]).unwrap();
        let action = &root.children()[0].children()[0];
        assert_eq!(action.args().unwrap().bbox, Some(BBox::new(32, 16, 16, 8)));
        // the selector keeps the coordinates the page reported
        assert_eq!(action.args().unwrap().selector, "BBox(x=64, y=64, width=32, height=32)");
    }

    #[tokio::test]
    async fn failed_save_keeps_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path(), None));
        let id = start(&app).await;

        // nothing recorded yet
        let (status, _) = post(&app, &format!("/save_task/{id}"), json!({ "screenshot": "CCCC" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(find_traces(dir.path()).is_empty());

        let scroll = json!({ "screenshot": "AAAA", "action": "scroll_down", "task_instruction": "Read" });
        let (status, _) = post(&app, &format!("/add_task_and_action/{id}"), scroll).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post(&app, &format!("/save_task/{id}"), json!({ "screenshot": "CCCC" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(find_traces(dir.path()).len(), 1);
    }
}
