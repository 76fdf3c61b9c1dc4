use crate::analysis::analyze_unit;
use crate::core::report::{render_bundle, ReportFormat};
use crate::core::{ConfigProvider, Pipeline, Storage};
use crate::domain::model::{AnalysisResult, ScanBatch, SourceUnit, UnitFailure, UnitReport};
use crate::utils::error::{BuffaitError, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};

pub struct AnalysisPipeline<S: Storage, C: ConfigProvider> {
    storage: S,
    config: C,
}

impl<S: Storage, C: ConfigProvider> AnalysisPipeline<S, C> {
    pub fn new(storage: S, config: C) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    fn output_file(output: &str, name: &str) -> String {
        Path::new(output).join(name).to_string_lossy().into_owned()
    }
}

/// Waits for every analysis task. `paths` maps each task to the file it
/// analyses, so a task that panicked or was cancelled still becomes a
/// failure of that file.
async fn collect_units(
    mut tasks: JoinSet<Result<UnitReport>>,
    mut paths: HashMap<Id, String>,
    failures: &mut Vec<UnitFailure>,
) -> Vec<UnitReport> {
    let mut units = Vec::new();
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => (
                e.id(),
                Err(BuffaitError::TaskError {
                    message: format!("analysis task failed: {}", e),
                }),
            ),
        };
        let path = paths.remove(&id).unwrap_or_default();
        match outcome {
            Ok(report) => {
                tracing::debug!("✔️ {}: {} findings", report.path, report.findings.len());
                units.push(report);
            }
            Err(e) => {
                tracing::warn!("⚠️ {} not analyzed: {}", path, e);
                failures.push(UnitFailure {
                    path,
                    error: e.user_friendly_message(),
                });
            }
        }
    }
    units
}

#[async_trait::async_trait]
impl<S: Storage, C: ConfigProvider> Pipeline for AnalysisPipeline<S, C> {
    async fn scan(&self) -> Result<ScanBatch> {
        let mut batch = ScanBatch::default();
        let mut seen = BTreeSet::new();

        for root in self.config.source_paths() {
            let files = match self.storage.list_files(root, self.config.extensions()).await {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!("⚠️ Cannot list {}: {}", root, e);
                    batch.failures.push(UnitFailure {
                        path: root.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            for path in files {
                // 同一檔案只分析一次
                if !seen.insert(path.clone()) {
                    continue;
                }
                match self.storage.read_file(&path).await {
                    Ok(bytes) => batch.units.push(SourceUnit {
                        text: String::from_utf8_lossy(&bytes).into_owned(),
                        path,
                    }),
                    Err(e) => {
                        tracing::warn!("⚠️ Cannot read {}: {}", path, e);
                        batch.failures.push(UnitFailure {
                            path,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        tracing::debug!(
            "Scanned {} files ({} unreadable)",
            batch.units.len(),
            batch.failures.len()
        );
        Ok(batch)
    }

    async fn analyze(&self, batch: ScanBatch) -> Result<AnalysisResult> {
        let started = Instant::now();
        let options = Arc::new(self.config.analysis_options());
        let semaphore = Arc::new(Semaphore::new(self.config.jobs().max(1)));
        let mut tasks: JoinSet<Result<UnitReport>> = JoinSet::new();
        let mut paths = HashMap::new();

        for unit in batch.units {
            let options = Arc::clone(&options);
            let semaphore = Arc::clone(&semaphore);
            let path = unit.path.clone();
            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| BuffaitError::TaskError {
                    message: e.to_string(),
                })?;
                tokio::task::spawn_blocking(move || analyze_unit(&unit.path, &unit.text, &options))
                    .await
                    .map_err(|e| BuffaitError::TaskError {
                        message: format!("analysis aborted: {}", e),
                    })?
            });
            paths.insert(handle.id(), path);
        }

        let mut failures = batch.failures;
        let mut units = collect_units(tasks, paths, &mut failures).await;

        units.sort_by(|a, b| a.path.cmp(&b.path));
        failures.sort_by(|a, b| a.path.cmp(&b.path));

        let elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(AnalysisResult::new(units, failures, elapsed_ms))
    }

    async fn report(&self, result: &AnalysisResult) -> Result<Vec<String>> {
        let Some(output) = self.config.output_path() else {
            return Ok(Vec::new());
        };

        let mut written = Vec::new();
        let mut rendered = Vec::new();
        for name in self.config.report_formats() {
            let format: ReportFormat = name.parse()?;
            let data = format.render(result)?;
            let path = Self::output_file(output, &format.file_name());
            tracing::debug!("Writing {} ({} bytes)", path, data.len());
            self.storage.write_file(&path, &data).await?;
            written.push(path);
            rendered.push((format.file_name(), data));
        }

        if self.config.bundle_enabled() {
            let zip_data = render_bundle(&rendered)?;
            let path = Self::output_file(output, self.config.bundle_filename());
            tracing::debug!("Writing ZIP file ({} bytes) to {}", zip_data.len(), path);
            self.storage.write_file(&path, &zip_data).await?;
            written.push(path);
        }

        Ok(written)
    }
}
