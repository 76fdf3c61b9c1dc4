use anyhow::Context;
use buffait::core::report::render_text;
use buffait::domain::ports::ConfigProvider;
use buffait::utils::error::BuffaitError;
use buffait::utils::{logger, validation::Validate};
use buffait::{AnalysisPipeline, CliConfig, LocalStorage, ScanEngine, TomlConfig};
use clap::Parser;
use std::io::Write;

const EXIT_FINDINGS: i32 = 1;

fn exit_with(e: &BuffaitError) -> ! {
    tracing::error!(
        "❌ buffait failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());
    std::process::exit(e.exit_code());
}

async fn run<C: ConfigProvider + Validate + 'static>(config: C) -> anyhow::Result<i32> {
    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        exit_with(&e);
    }

    let fail_on = config.fail_on();
    let print_text = config.output_path().is_none();
    let monitor_enabled = config.monitoring_enabled();

    // 從目前目錄解析來源與輸出路徑
    let storage = LocalStorage::new(".".to_string());
    let pipeline = AnalysisPipeline::new(storage, config);
    let engine = ScanEngine::new_with_monitoring(pipeline, monitor_enabled);

    let outcome = match engine.run().await {
        Ok(outcome) => outcome,
        Err(e) => exit_with(&e),
    };
    let result = &outcome.result;

    if print_text {
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(render_text(result).as_bytes())
            .context("failed to print the report")?;
        stdout.flush().context("failed to print the report")?;
    } else {
        println!(
            "✅ {} findings in {} files",
            result.stats.findings_total, result.stats.files_scanned
        );
        for path in &outcome.written {
            println!("📁 {}", path);
        }
    }

    if result.units.is_empty() && !result.failures.is_empty() {
        tracing::error!("❌ No source file could be analyzed");
        return Ok(3);
    }
    if let Some(threshold) = fail_on {
        if result.has_findings_at_or_above(threshold) {
            tracing::info!("🚨 Findings at or above '{}' severity", threshold);
            return Ok(EXIT_FINDINGS);
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = CliConfig::parse();

    // 初始化日誌
    match cli.log_format.as_str() {
        "json" => logger::init_json_logger(cli.verbose),
        _ => logger::init_cli_logger(cli.verbose),
    }

    tracing::info!("Starting buffait");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    let code = match cli.config.clone() {
        Some(path) => {
            tracing::info!("📋 Loading configuration from {}", path);
            let mut config = match TomlConfig::from_file(&path) {
                Ok(config) => config,
                Err(BuffaitError::IoError(e)) => exit_with(&BuffaitError::ConfigError {
                    message: format!("cannot read {}: {}", path, e),
                }),
                Err(e) => exit_with(&e),
            };
            if let Err(e) = config.apply_cli_overrides(&cli) {
                exit_with(&e);
            }
            run(config).await?
        }
        None => {
            cli.apply_defaults();
            run(cli).await?
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
