use super::*;
use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::error::TryRecvError};

#[derive(Clone, Default)]
struct Gateway {
    hits: Arc<Mutex<Vec<String>>>,
    reports: Arc<Mutex<Vec<(String, String)>>>,
}

async fn predict(State(gw): State<Gateway>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let url = body["image_url"].as_str().unwrap_or_default().to_string();
    gw.hits.lock().await.push(format!("predict {url}"));
    if url.contains("broken") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Failed to fetch image from URL: 404 Not Found" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "prediction": "NSFW", "confidence": 0.93, "sfw_confidence": 0.07, "nsfw_confidence": 0.93 })),
    )
}

async fn predict_upload(State(gw): State<Gateway>, mut multipart: Multipart) -> Json<Value> {
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        gw.hits.lock().await.push(format!("upload {name}"));
    }
    Json(json!({ "prediction": "SFW", "confidence": 0.88, "sfw_confidence": 0.88, "nsfw_confidence": 0.12 }))
}

async fn report(State(gw): State<Gateway>, mut multipart: Multipart) -> Json<Value> {
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let value = field.text().await.unwrap_or_default();
        gw.reports.lock().await.push((name, value));
    }
    gw.hits.lock().await.push("report".to_string());
    Json(json!({}))
}

async fn spawn_gateway() -> (String, Gateway) {
    let gateway = Gateway::default();
    let app = Router::new()
        .route("/predict", post(predict))
        .route("/predict-upload", post(predict_upload))
        .route("/report", post(report))
        .with_state(gateway.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), gateway)
}

async fn controller() -> (PageController, Gateway) {
    let (base, gateway) = spawn_gateway().await;
    (PageController::new(DetectorClient::new(base)), gateway)
}

fn drain(rx: &mut broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
}

#[tokio::test]
async fn empty_url_alerts_without_request() {
    let (page, gateway) = controller().await;
    let mut rx = page.subscribe_events();

    page.set_url_input("   ").await;
    let result = page.predict_url().await.expect("no request");
    assert!(result.is_none());
    assert_eq!(drain(&mut rx), [UiEvent::Alert(ENTER_URL_ALERT.to_string())]);
    assert!(gateway.hits.lock().await.is_empty());
    assert_eq!(page.view().await.result, ResultView::Empty);
}

#[tokio::test]
async fn url_prediction_shows_result_and_reveals_report_button() {
    let (page, gateway) = controller().await;
    let mut rx = page.subscribe_events();

    page.set_url_input("https://img.test/a.jpg").await;
    let last = page
        .predict_url()
        .await
        .expect("predict")
        .expect("prediction recorded");
    assert_eq!(last.source, SourceKind::Url);
    assert_eq!(last.image_url.as_deref(), Some("https://img.test/a.jpg"));
    assert_eq!(last.prediction, Verdict::Nsfw);

    let expected_result = ResultView::Prediction {
        prediction: Verdict::Nsfw,
        sfw_confidence: 0.07,
        nsfw_confidence: 0.93,
    };
    assert_eq!(
        drain(&mut rx),
        [
            UiEvent::ResultChanged(ResultView::Analyzing),
            UiEvent::ResultChanged(expected_result.clone()),
            UiEvent::ReportButtonChanged(true),
        ]
    );

    let view = page.view().await;
    assert!(view.report_button_visible);
    assert_eq!(
        view.result.to_string(),
        "Prediction: NSFW\nSFW Confidence: 0.07\nNSFW Confidence: 0.93"
    );
    assert_eq!(gateway.hits.lock().await.as_slice(), ["predict https://img.test/a.jpg"]);
}

#[tokio::test]
async fn server_error_is_shown_verbatim_and_keeps_previous_prediction() {
    let (page, _gateway) = controller().await;

    page.set_url_input("https://img.test/a.jpg").await;
    page.predict_url().await.expect("predict");
    page.set_url_input("https://img.test/broken.jpg").await;
    let result = page.predict_url().await.expect("rejected is not an error");
    assert!(result.is_none());

    let view = page.view().await;
    assert_eq!(
        view.result,
        ResultView::Error("Failed to fetch image from URL: 404 Not Found".to_string())
    );
    assert_eq!(
        view.result.to_string(),
        "Error: Failed to fetch image from URL: 404 Not Found"
    );
    assert!(!view.report_button_visible);
    let last = page.last_prediction().await.expect("earlier prediction kept");
    assert_eq!(last.image_url.as_deref(), Some("https://img.test/a.jpg"));
}

#[tokio::test]
async fn upload_requires_a_selected_file() {
    let (page, gateway) = controller().await;
    let mut rx = page.subscribe_events();

    assert!(page.predict_upload().await.expect("no request").is_none());
    assert_eq!(drain(&mut rx), [UiEvent::Alert(SELECT_FILE_ALERT.to_string())]);

    page.select_file(None).await;
    assert_eq!(page.view().await, PageView::default());
    assert!(gateway.hits.lock().await.is_empty());
}

#[tokio::test]
async fn upload_prediction_records_no_url() {
    let (page, gateway) = controller().await;
    let mut rx = page.subscribe_events();

    page.select_file(Some(ImageUpload::new("dog.jpg", vec![0xFF, 0xD8, 0xFF])))
        .await;
    let view = page.view().await;
    assert_eq!(view.selected_file.as_deref(), Some("dog.jpg"));
    assert!(view.preview_visible);

    let last = page
        .predict_upload()
        .await
        .expect("predict")
        .expect("prediction recorded");
    assert_eq!(last.source, SourceKind::Upload);
    assert!(last.image_url.is_none());
    assert_eq!(last.scores.confidence, 0.88);

    let events = drain(&mut rx);
    assert_eq!(events[0], UiEvent::PreviewChanged(Some("dog.jpg".to_string())));
    assert_eq!(events.last(), Some(&UiEvent::ReportButtonChanged(true)));
    assert_eq!(gateway.hits.lock().await.as_slice(), ["upload file"]);
}

#[tokio::test]
async fn changing_inputs_hides_report_button() {
    let (page, _gateway) = controller().await;

    page.set_url_input("https://img.test/a.jpg").await;
    page.predict_url().await.expect("predict");
    assert!(page.view().await.report_button_visible);

    page.set_url_input("https://img.test/b.jpg").await;
    assert!(!page.view().await.report_button_visible);

    page.predict_url().await.expect("predict");
    page.select_file(Some(ImageUpload::new("x.png", vec![1]))).await;
    assert!(!page.view().await.report_button_visible);
}

#[tokio::test]
async fn report_requires_a_prediction() {
    let (page, gateway) = controller().await;
    let mut rx = page.subscribe_events();

    assert!(page.report_prediction().await.expect("no request").is_none());
    assert_eq!(
        drain(&mut rx),
        [UiEvent::Alert(NOTHING_TO_REPORT_ALERT.to_string())]
    );
    assert!(gateway.hits.lock().await.is_empty());
}

#[tokio::test]
async fn url_report_includes_image_url_and_falls_back_to_default_alert() {
    let (page, gateway) = controller().await;

    page.set_url_input("https://img.test/a.jpg").await;
    page.predict_url().await.expect("predict");
    let alert = page
        .report_prediction()
        .await
        .expect("report")
        .expect("alert shown");
    assert_eq!(alert, REPORTED_FALLBACK_ALERT);
    assert!(!page.view().await.report_button_visible);

    let reports = gateway.reports.lock().await;
    let fields: Vec<(&str, &str)> = reports
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    assert_eq!(
        fields,
        [
            ("prediction", "NSFW"),
            ("source_type", "url"),
            ("confidence", "0.93"),
            ("sfw_confidence", "0.07"),
            ("nsfw_confidence", "0.93"),
            ("image_url", "https://img.test/a.jpg"),
        ]
    );
}

#[tokio::test]
async fn upload_report_omits_image_url() {
    let (page, gateway) = controller().await;

    page.select_file(Some(ImageUpload::new("dog.jpg", vec![1, 2])))
        .await;
    page.predict_upload().await.expect("predict");
    page.report_prediction().await.expect("report");

    let reports = gateway.reports.lock().await;
    assert!(reports.iter().all(|(name, _)| name != "image_url"));
    assert!(reports.contains(&("source_type".to_string(), "upload".to_string())));
}

#[tokio::test]
async fn upload_prediction_replaces_earlier_url_prediction() {
    let (page, gateway) = controller().await;

    page.set_url_input("https://img.test/a.jpg").await;
    page.predict_url().await.expect("predict url");
    page.select_file(Some(ImageUpload::new("dog.jpg", vec![1, 2])))
        .await;
    page.predict_upload().await.expect("predict upload");

    let last = page.last_prediction().await.expect("prediction recorded");
    assert_eq!(last.source, SourceKind::Upload);
    assert_eq!(last.prediction, Verdict::Sfw);
    assert!(last.image_url.is_none());
    assert_eq!(last.scores.nsfw_confidence, 0.12);

    page.report_prediction().await.expect("report");
    let reports = gateway.reports.lock().await;
    assert!(reports.contains(&("source_type".to_string(), "upload".to_string())));
    assert!(reports.contains(&("prediction".to_string(), "SFW".to_string())));
    assert!(reports.iter().all(|(name, _)| name != "image_url"));
}

#[tokio::test]
async fn transport_failure_is_returned_and_shown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let page = PageController::new(DetectorClient::new(format!("http://{addr}")));

    page.set_url_input("https://img.test/a.jpg").await;
    let err = page.predict_url().await.expect_err("transport failure");
    assert!(matches!(err, ClientError::Transport(_)));

    let view = page.view().await;
    assert!(matches!(view.result, ResultView::Error(_)));
    assert!(!view.report_button_visible);
    assert!(page.last_prediction().await.is_none());
}

#[test]
fn empty_result_renders_nothing() {
    assert_eq!(ResultView::Empty.to_string(), "");
    assert_eq!(ResultView::Analyzing.to_string(), "Analyzing image...");
}
