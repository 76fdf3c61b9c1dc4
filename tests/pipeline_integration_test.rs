use buffait::core::Pipeline;
use buffait::domain::model::Severity;
use buffait::domain::ports::Storage;
use buffait::utils::validation::Validate;
use buffait::{AnalysisPipeline, LocalStorage, ScanEngine, TomlConfig};
use std::io::Read;
use std::path::Path;
use tempfile::TempDir;

const FIXTURE: &str = include_str!("fixtures/paper-example.c");
const CLEAN: &str = "int sum(void) {\n  int a[4] = {1, 2, 3, 4};\n  int i, s = 0;\n  for (i = 0; i < 4; i++)\n    s += a[i];\n  return s;\n}\n";

async fn workspace() -> (TempDir, LocalStorage) {
    let dir = TempDir::new().unwrap();
    let storage = LocalStorage::new(dir.path().to_string_lossy().into_owned());
    storage.write_file("src/paper-example.c", FIXTURE.as_bytes()).await.unwrap();
    storage.write_file("src/util/sum.c", CLEAN.as_bytes()).await.unwrap();
    storage.write_file("src/README", b"not C").await.unwrap();
    (dir, storage)
}

fn config(extra: &str) -> TomlConfig {
    let toml = format!(
        r#"
[sources]
paths = ["src"]

[analysis]
jobs = 2

[report]
output_path = "report"
formats = ["text", "json", "csv"]
fail_on = "high"
{}
"#,
        extra
    );
    let config = TomlConfig::from_toml_str(&toml).unwrap();
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn test_end_to_end_reports_in_temp_dir() {
    let (dir, storage) = workspace().await;
    let engine = ScanEngine::new(AnalysisPipeline::new(storage, config("")));
    let outcome = engine.run().await.unwrap();

    assert_eq!(outcome.result.stats.files_scanned, 2);
    assert_eq!(outcome.result.stats.files_failed, 0);
    assert_eq!(outcome.result.stats.findings_total, 4);
    assert!(outcome.result.has_findings_at_or_above(Severity::High));
    assert_eq!(outcome.written.len(), 3);

    let report_dir = dir.path().join("report");
    let text = std::fs::read_to_string(report_dir.join("buffait-report.txt")).unwrap();
    assert!(text.contains("paper-example.c:17:"), "{}", text);
    assert!(text.contains("2 files, 2 functions analyzed: 4 findings"), "{}", text);

    let mut csv = csv::Reader::from_path(report_dir.join("buffait-report.csv")).unwrap();
    let headers = csv.headers().unwrap().clone();
    assert_eq!(&headers[0], "kind");
    let line_column = headers.iter().position(|h| h == "line").unwrap();
    let rows: Vec<csv::StringRecord> = csv.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 4);
    let report_lines: Vec<&str> = rows.iter().map(|r| &r[line_column]).collect();
    assert_eq!(report_lines, vec!["17", "20", "22", "26"]);

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(report_dir.join("buffait-report.json")).unwrap()).unwrap();
    assert_eq!(json["units"].as_array().unwrap().len(), 2);
    assert_eq!(json["units"][1]["findings"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_bundle_contains_every_format() {
    let (dir, storage) = workspace().await;
    let config = config("bundle = { enabled = true, filename = \"scan.zip\" }");
    let engine = ScanEngine::new(AnalysisPipeline::new(storage, config));
    let outcome = engine.run().await.unwrap();

    assert_eq!(outcome.written.len(), 4);
    let file = std::fs::File::open(dir.path().join("report").join("scan.zip")).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut names: Vec<String> = archive.file_names().map(String::from).collect();
    names.sort();
    assert_eq!(
        names,
        vec!["buffait-report.csv", "buffait-report.json", "buffait-report.txt"]
    );

    let mut text = String::new();
    archive
        .by_name("buffait-report.txt")
        .unwrap()
        .read_to_string(&mut text)
        .unwrap();
    assert!(text.contains("unchecked_allocation_size"));
}

#[tokio::test]
async fn test_unreadable_sources_do_not_abort_the_run() {
    let (dir, storage) = workspace().await;
    storage
        .write_file("src/broken.c", b"int f(void) { char *s = \"open; }")
        .await
        .unwrap();
    let toml = r#"
[sources]
paths = ["src", "missing-dir"]
"#;
    let config = TomlConfig::from_toml_str(toml).unwrap();
    let pipeline = AnalysisPipeline::new(storage, config);

    let batch = pipeline.scan().await.unwrap();
    assert_eq!(batch.units.len(), 3);
    assert_eq!(batch.failures.len(), 1);

    let result = pipeline.analyze(batch).await.unwrap();
    let failed: Vec<&str> = result.failures.iter().map(|f| f.path.as_str()).collect();
    let broken = Path::new("src").join("broken.c");
    assert_eq!(failed, vec!["missing-dir", broken.to_str().unwrap()]);
    assert_eq!(result.stats.files_scanned, 2);

    // 沒有輸出路徑時不寫檔
    assert!(pipeline.report(&result).await.unwrap().is_empty());
    assert!(!dir.path().join("report").exists());
}
