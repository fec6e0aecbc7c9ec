use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use waitcause::cli::{Cli, OutputFormat};
use waitcause::config::AnalysisConfig;
use waitcause::replay::{Job, TraceBundle};
use waitcause::report::{JobReport, SeverityProfile};

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()))
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = match &args.config {
        Some(path) => AnalysisConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => AnalysisConfig::default(),
    };
    let config = args.apply_mode(config);

    let bundle = TraceBundle::load(&args.trace)
        .with_context(|| format!("Failed to read trace bundle {}", args.trace.display()))?;
    let job = Job::new(bundle, config).context("Invalid trace bundle")?;
    let outputs = job
        .run_with(|_| SeverityProfile::new())
        .context("Replay failed")?;
    let report = JobReport::build(&job, &outputs)?;

    let rendered = match args.format {
        OutputFormat::Text => report.render_text(),
        OutputFormat::Json => report.to_json()?,
    };
    match &args.output {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write report {}", path.display()))?,
        None => print!("{}", rendered),
    }

    if !report.errors.is_empty() {
        anyhow::bail!("{} callback error(s) were recorded during replay", report.errors.len());
    }
    Ok(())
}
