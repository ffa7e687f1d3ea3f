use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use clap::Parser;
use resume_intake::config::{EnginePreference, ExtractionSettings};
use resume_intake::extraction::EngineSelector;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(
    name = "resume-intake-extract",
    about = "Run the extraction engines locally against PDF files"
)]
struct Cli {
    /// Files or directories (walked for `*.pdf`).
    #[arg(required_unless_present = "check")]
    paths: Vec<PathBuf>,
    /// Only report whether the external tool is invocable.
    #[arg(long)]
    check: bool,
    /// Override `PDF_ENGINE` (`in-process` or `external`).
    #[arg(long)]
    engine: Option<String>,
    /// Override `PDFTOTEXT_PATH`.
    #[arg(long)]
    pdftotext: Option<PathBuf>,
    /// Override `EXTRACT_MAX_PAGES`.
    #[arg(long)]
    max_pages: Option<usize>,
    /// Print the extracted text after each summary line.
    #[arg(long)]
    show_text: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = ExtractionSettings::from_env().context("reading extraction settings")?;
    if let Some(engine) = &cli.engine {
        settings.preference = engine
            .parse::<EnginePreference>()
            .map_err(|()| anyhow!("unknown engine {engine:?}; use in-process or external"))?;
    }
    if let Some(path) = cli.pdftotext {
        settings.pdftotext_path = path;
    }
    if cli.max_pages.is_some() {
        settings.max_pages = cli.max_pages;
    }
    let selector = EngineSelector::from_settings(&settings);

    if cli.check {
        return match selector.check_external().await {
            Ok(()) => {
                println!("{}: invocable", settings.pdftotext_path.display());
                Ok(())
            }
            Err(reason) => bail!("{reason}"),
        };
    }

    let files = collect_pdfs(&cli.paths)?;
    if files.is_empty() {
        bail!("no PDF files found");
    }

    let cancel = CancellationToken::new();
    let mut failures = 0usize;
    for file in files {
        let document = Bytes::from(
            std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?,
        );
        let started = Instant::now();
        match selector.extract(&document, &cancel).await {
            Ok(extracted) => {
                println!(
                    "{}\tengine={}\tfell_back={}\tchars={}\tms={}",
                    file.display(),
                    extracted.engine,
                    extracted.fell_back,
                    extracted.text.chars().count(),
                    started.elapsed().as_millis()
                );
                if cli.show_text {
                    println!("{}\n", extracted.text);
                }
            }
            Err(error) => {
                failures += 1;
                println!("{}\terror={error}", file.display());
            }
        }
    }

    if failures > 0 {
        bail!("{failures} file(s) failed");
    }
    Ok(())
}

fn collect_pdfs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            bail!("{} does not exist", path.display());
        }
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking {}", path.display()))?;
            if entry.file_type().is_file() && is_pdf(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    Ok(files)
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}
