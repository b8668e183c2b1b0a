//! Integration tests for churnforge

use axum::body::Body;
use axum::http::{Request, StatusCode};
use churnforge::registry::{ModelRegistry, VersionSelector, DEFAULT_MODEL_URI};
use churnforge::service::{router, AppState, PredictResponse};
use churnforge::tracking::{RunStatus, Tracker};
use churnforge::{
    clean_file, train, ChurnError, FeatureFrame, FileRegistry, ForestParams, ModelUri, Stage,
    TrainConfig,
};
use http_body_util::BodyExt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, NamedTempFile};
use tower::ServiceExt;

/// Create a raw export resembling the customer churn dataset
///
/// Every seventh row has a blank `TotalCharges`, as new customers do in the
/// real export.
fn create_raw_csv(rows: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "customerID,gender,SeniorCitizen,tenure,Contract,PaymentMethod,MonthlyCharges,TotalCharges,Churn"
    )
    .unwrap();

    for i in 0..rows {
        let churn = i % 4 == 0;
        let gender = if i % 2 == 0 { "Female" } else { "Male" };
        let (tenure, contract) = if churn {
            (1 + i % 8, "Month-to-month")
        } else {
            (20 + i % 40, if i % 3 == 0 { "One year" } else { "Two year" })
        };
        let payment = if i % 5 == 0 { "Electronic check" } else { "Mailed check" };
        let monthly = 30.0 + (i % 60) as f64;
        let total = if i % 7 == 3 {
            " ".to_string()
        } else {
            format!("{:.2}", monthly * tenure as f64)
        };
        writeln!(
            file,
            "{:04}-ABCD,{},{},{},{},{},{:.2},{},{}",
            i,
            gender,
            u8::from(i % 6 == 0 && !churn),
            tenure,
            contract,
            payment,
            monthly,
            total,
            if churn { "Yes" } else { "No" }
        )
        .unwrap();
    }
    file
}

fn small_config() -> TrainConfig {
    TrainConfig {
        forest: ForestParams::new().n_trees(25),
        promote: Some(Stage::Production),
        ..TrainConfig::default()
    }
}

fn clean_and_train(store: &Path, rows: usize) -> (std::path::PathBuf, churnforge::TrainOutcome) {
    let raw = create_raw_csv(rows);
    let cleaned = store.join("data/processed/telco_clean.csv");
    clean_file(raw.path(), &cleaned).unwrap();

    let outcome = train(
        &cleaned,
        store.join("artifacts"),
        &small_config(),
        &Tracker::new(store),
        &FileRegistry::new(store),
    )
    .unwrap();
    (cleaned, outcome)
}

#[test]
fn test_clean_removes_blank_charges_and_binarizes() {
    let raw = create_raw_csv(70);
    let dir = tempdir().unwrap();
    let out = dir.path().join("clean.csv");

    let summary = clean_file(raw.path(), &out).unwrap();

    // Rows 3, 10, 17, ... have blank charges
    let blanks = (0..70).filter(|i| i % 7 == 3).count();
    assert_eq!(summary.dropped_rows, blanks);
    assert_eq!(summary.rows, 70 - blanks);
    assert_eq!(summary.columns, 8);

    let text = fs::read_to_string(&out).unwrap();
    let header = text.lines().next().unwrap();
    assert!(!header.contains("customerID"));
    assert!(header.ends_with("Churn"));
    for line in text.lines().skip(1) {
        assert!(line.ends_with(",0") || line.ends_with(",1"), "{}", line);
    }
}

#[test]
fn test_clean_twice_is_stable() {
    let raw = create_raw_csv(30);
    let dir = tempdir().unwrap();
    let first = dir.path().join("first.csv");
    let second = dir.path().join("second.csv");

    let summary = clean_file(raw.path(), &first).unwrap();
    let again = clean_file(&first, &second).unwrap();

    assert_eq!(again.dropped_rows, 0);
    assert_eq!(again.rows, summary.rows);
    assert_eq!(
        fs::read_to_string(&first).unwrap(),
        fs::read_to_string(&second).unwrap()
    );
}

#[test]
fn test_clean_unknown_label_fails() {
    let mut raw = NamedTempFile::new().unwrap();
    writeln!(raw, "customerID,tenure,Churn").unwrap();
    writeln!(raw, "1,3,Yes").unwrap();
    writeln!(raw, "2,5,Maybe").unwrap();
    let dir = tempdir().unwrap();

    let err = clean_file(raw.path(), dir.path().join("out.csv")).unwrap_err();
    assert!(matches!(err, ChurnError::UnknownLabel { .. }));
}

#[test]
fn test_end_to_end_train_and_resolve() {
    let store = tempdir().unwrap();
    let (cleaned, outcome) = clean_and_train(store.path(), 120);

    assert_eq!(outcome.model_version.stage, Stage::Production);
    assert!(outcome.metrics.accuracy > 0.8);
    let metrics: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&outcome.metrics_path).unwrap()).unwrap();
    for key in ["accuracy", "precision", "recall", "f1", "roc_auc"] {
        assert!(metrics.get(key).is_some(), "missing {}", key);
    }

    let runs = Tracker::new(store.path()).runs("telco-churn").unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Finished);
    assert_eq!(runs[0].params["random_state"], "42");

    let registry = FileRegistry::new(store.path());
    let uri: ModelUri = DEFAULT_MODEL_URI.parse().unwrap();
    let (version, pipeline) = registry.resolve(&uri).unwrap();
    assert_eq!(version.version, 1);
    assert_eq!(version.run_id.as_deref(), Some(outcome.run_id.as_str()));

    // The registered pipeline scores every cleaned row
    let df = churnforge::data::read_csv(&cleaned).unwrap();
    let frame = FeatureFrame::from_dataframe_with_schema(&df, pipeline.schema()).unwrap();
    let predicted = pipeline.predict(&frame).unwrap();
    assert_eq!(predicted.len(), frame.n_rows());
}

#[test]
fn test_fixed_seed_reproduces_metrics() {
    let first = tempdir().unwrap();
    let second = tempdir().unwrap();

    let (_, a) = clean_and_train(first.path(), 80);
    let (_, b) = clean_and_train(second.path(), 80);

    assert_eq!(a.metrics, b.metrics);
    assert_eq!((a.n_train, a.n_test), (b.n_train, b.n_test));
}

#[test]
fn test_second_training_archives_previous_production() {
    let store = tempdir().unwrap();
    clean_and_train(store.path(), 60);
    clean_and_train(store.path(), 60);

    let registry = FileRegistry::new(store.path());
    let versions = registry.versions("telco-churn").unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].stage, Stage::Archived);
    assert_eq!(versions[1].stage, Stage::Production);

    let latest = ModelUri::new("telco-churn", VersionSelector::Latest);
    assert_eq!(registry.resolve(&latest).unwrap().0.version, 2);
}

#[tokio::test]
async fn test_service_predicts_like_the_pipeline() {
    let store = tempdir().unwrap();
    let (cleaned, _) = clean_and_train(store.path(), 100);

    let registry: Arc<dyn ModelRegistry> = Arc::new(FileRegistry::new(store.path()));
    let state = AppState::load(registry, DEFAULT_MODEL_URI.parse().unwrap()).unwrap();
    let pipeline = state.model.current();

    let df = churnforge::data::read_csv(&cleaned).unwrap();
    let frame = FeatureFrame::from_dataframe_with_schema(&df, pipeline.pipeline.schema()).unwrap();
    let expected = pipeline.pipeline.predict(&frame.take(&[0, 1])).unwrap();

    // First two cleaned rows come from raw rows 0 and 1
    let body = serde_json::json!({"records": [
        {"gender": "Female", "SeniorCitizen": 0, "tenure": 1, "Contract": "Month-to-month",
         "PaymentMethod": "Electronic check", "MonthlyCharges": 30.0, "TotalCharges": 30.0},
        {"gender": "Male", "SeniorCitizen": 0, "tenure": 21, "Contract": "Two year",
         "PaymentMethod": "Mailed check", "MonthlyCharges": 31.0, "TotalCharges": 651.0}
    ]});
    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let response: PredictResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(response.predictions, expected);
    assert_eq!(response.model.version, 1);
}

#[test]
fn test_service_refuses_to_start_without_model() {
    let store = tempdir().unwrap();
    let registry: Arc<dyn ModelRegistry> = Arc::new(FileRegistry::new(store.path()));

    let result = AppState::load(registry, DEFAULT_MODEL_URI.parse().unwrap());
    assert!(matches!(result, Err(ChurnError::ModelNotFound { .. })));
}
