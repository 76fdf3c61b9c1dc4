use crate::core::Pipeline;
use crate::domain::model::AnalysisResult;
use crate::utils::error::Result;
use crate::utils::monitor::SystemMonitor;

/// What one run produced: the findings and the report files written.
#[derive(Debug)]
pub struct RunOutcome {
    pub result: AnalysisResult,
    pub written: Vec<String>,
}

pub struct ScanEngine<P: Pipeline> {
    pipeline: P,
    monitor: SystemMonitor,
}

impl<P: Pipeline> ScanEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self::new_with_monitoring(pipeline, false)
    }

    pub fn new_with_monitoring(pipeline: P, monitor_enabled: bool) -> Self {
        if monitor_enabled {
            tracing::info!("🔍 System monitoring enabled");
        }
        Self {
            pipeline,
            monitor: SystemMonitor::new(monitor_enabled),
        }
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        tracing::info!("🚀 Starting buffer-overflow scan");

        // Scan
        let batch = self.pipeline.scan().await?;
        tracing::info!(
            "📂 Found {} source files ({} unreadable)",
            batch.units.len(),
            batch.failures.len()
        );
        self.monitor.log_stats("Scan");

        // Analyze
        let result = self.pipeline.analyze(batch).await?;
        let stats = &result.stats;
        tracing::info!(
            "🔬 Analyzed {} functions in {} files: {} findings ({} critical, {} high)",
            stats.functions_analyzed,
            stats.files_scanned,
            stats.findings_total,
            stats.critical,
            stats.high
        );
        if stats.files_failed > 0 {
            tracing::warn!("⚠️ {} files could not be analyzed", stats.files_failed);
        }
        self.monitor.log_stats("Analyze");
        self.monitor.log_throughput(stats.files_scanned);

        // Report
        let written = self.pipeline.report(&result).await?;
        for path in &written {
            tracing::info!("📁 Report saved to: {}", path);
        }
        self.monitor.log_final_stats();

        Ok(RunOutcome { result, written })
    }
}
