use anyhow::Context;
use pyconv_core::Converter;
use serde::Serialize;

use crate::cli::args::{GlobalArgs, InfoArgs, OutputFormat};
use crate::cli::settings;
use crate::exit_codes::SUCCESS;

#[derive(Debug, Serialize)]
struct HostInfo {
    interpreter: String,
    host_version: String,
    magic_version: String,
    magic: String,
    timeout_secs: u64,
    max_offset: usize,
    module_marker: String,
    max_input_bytes: u64,
}

pub async fn run(args: InfoArgs, global: &GlobalArgs) -> anyhow::Result<i32> {
    let config = settings::load(global)?;
    // Identifying the host spawns the interpreter.
    let setup = config.clone();
    let converter = tokio::task::spawn_blocking(move || Converter::from_config(&setup))
        .await?
        .context("failed to set up converter")?;

    let reframer = converter.reframer();
    let host_version = reframer.host_version()?;
    let entry = reframer.host_entry()?;
    let info = HostInfo {
        interpreter: config.interpreter.clone(),
        host_version,
        magic_version: entry.version_label.clone(),
        magic: entry.to_hex(),
        timeout_secs: config.sandbox.timeout_secs,
        max_offset: converter.extractor().settings().max_offset,
        module_marker: converter.extractor().settings().module_marker.clone(),
        max_input_bytes: config.max_input_bytes,
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Text => {
            println!("interpreter:     {}", info.interpreter);
            println!("host version:    {}", info.host_version);
            println!("magic:           {} ({})", info.magic, info.magic_version);
            println!("sandbox timeout: {}s", info.timeout_secs);
            println!("scan offsets:    1..={}", info.max_offset);
            println!("module marker:   {:?}", info.module_marker);
            println!("max input:       {} bytes", info.max_input_bytes);
        }
    }
    Ok(SUCCESS)
}
