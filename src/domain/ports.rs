use crate::domain::model::{AnalysisOptions, AnalysisResult, ScanBatch, Severity};
use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
    /// Source files under `root` with one of `extensions`, sorted. A file
    /// root is returned as is.
    fn list_files(
        &self,
        root: &str,
        extensions: &[String],
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
}

pub trait ConfigProvider: Send + Sync {
    fn source_paths(&self) -> &[String];
    fn extensions(&self) -> &[String];
    /// Directory for report files; `None` prints the text report instead.
    fn output_path(&self) -> Option<&str>;
    fn report_formats(&self) -> &[String];
    fn jobs(&self) -> usize;
    fn bundle_enabled(&self) -> bool;
    fn bundle_filename(&self) -> &str;
    fn fail_on(&self) -> Option<Severity>;
    fn monitoring_enabled(&self) -> bool;
    fn analysis_options(&self) -> AnalysisOptions;
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn scan(&self) -> Result<ScanBatch>;
    async fn analyze(&self, batch: ScanBatch) -> Result<AnalysisResult>;
    /// Writes the reports and returns the paths written.
    async fn report(&self, result: &AnalysisResult) -> Result<Vec<String>>;
}
