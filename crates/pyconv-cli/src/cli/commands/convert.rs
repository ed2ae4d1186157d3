use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use pyconv_core::Converter;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::cli::args::{ConvertArgs, GlobalArgs};
use crate::cli::settings;
use crate::exit_codes::{CONVERSION_FAILED, SUCCESS};

/// What happened to one input.
#[derive(Debug)]
enum FileOutcome {
    Converted { output: PathBuf, direction: &'static str },
    TooLarge { len: u64, limit: u64 },
    Failed,
    Error(String),
}

impl FileOutcome {
    fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Converted { .. })
    }

    fn describe(&self) -> String {
        match self {
            FileOutcome::Converted { output, direction } => {
                format!("{direction} -> {}", output.display())
            }
            FileOutcome::TooLarge { len, limit } => {
                format!("file too large ({len} bytes, limit {limit})")
            }
            FileOutcome::Failed => "conversion failed".to_string(),
            FileOutcome::Error(e) => format!("error: {e}"),
        }
    }
}

pub async fn run(args: ConvertArgs, global: &GlobalArgs) -> anyhow::Result<i32> {
    let config = settings::load(global)?;
    let setup = config.clone();
    let converter = tokio::task::spawn_blocking(move || Converter::from_config(&setup))
        .await?
        .context("failed to set up converter")?;

    if let Some(dir) = &args.out_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let semaphore = Arc::new(Semaphore::new(args.jobs.max(1)));
    let mut handles = Vec::with_capacity(args.files.len());
    for path in args.files {
        let converter = converter.clone();
        let semaphore = Arc::clone(&semaphore);
        let out_dir = args.out_dir.clone();
        let limit = config.max_input_bytes;
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let outcome = convert_file(&converter, &path, out_dir.as_deref(), limit).await;
            (path, outcome)
        }));
    }

    let mut code = SUCCESS;
    for handle in handles {
        let (path, outcome) = handle.await?;
        if !outcome.is_success() {
            code = CONVERSION_FAILED;
        }
        println!("{}: {}", path.display(), outcome.describe());
    }
    Ok(code)
}

async fn convert_file(
    converter: &Converter,
    path: &Path,
    out_dir: Option<&Path>,
    limit: u64,
) -> FileOutcome {
    let len = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) => return FileOutcome::Error(e.to_string()),
    };
    if len > limit {
        warn!(file = %path.display(), len, limit, "input exceeds size limit");
        return FileOutcome::TooLarge { len, limit };
    }
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => return FileOutcome::Error(e.to_string()),
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(conversion) = converter.convert_offloaded(data, name).await else {
        return FileOutcome::Failed;
    };

    let dir = out_dir
        .or_else(|| path.parent())
        .unwrap_or_else(|| Path::new("."));
    let output = dir.join(&conversion.name);
    if same_file(&output, path) {
        return FileOutcome::Error(format!(
            "output {} would overwrite the input",
            output.display()
        ));
    }
    if let Err(e) = tokio::fs::write(&output, &conversion.bytes).await {
        return FileOutcome::Error(format!("failed to write {}: {e}", output.display()));
    }
    FileOutcome::Converted {
        output,
        direction: conversion.direction.describe(),
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
