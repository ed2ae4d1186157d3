use pyconv_core::{MagicTable, VersionMagicEntry};
use serde::Serialize;

use crate::cli::args::{GlobalArgs, MagicArgs, OutputFormat};
use crate::cli::settings;
use crate::exit_codes::SUCCESS;

#[derive(Debug, Serialize)]
struct EntryView<'a> {
    version: &'a str,
    magic: String,
    default: bool,
}

#[derive(Debug, Serialize)]
struct ResolvedView<'a> {
    requested: &'a str,
    version: &'a str,
    magic: String,
    fallback: bool,
}

fn entry_view<'a>(table: &MagicTable, entry: &'a VersionMagicEntry) -> EntryView<'a> {
    EntryView {
        version: &entry.version_label,
        magic: entry.to_hex(),
        default: entry.version_label == table.default_entry().version_label,
    }
}

pub fn run(args: MagicArgs, global: &GlobalArgs) -> anyhow::Result<i32> {
    let config = settings::load(global)?;
    let table = config.magic_table()?;

    match &args.version {
        Some(requested) => {
            let entry = table.resolve(requested);
            let view = ResolvedView {
                requested,
                version: &entry.version_label,
                magic: entry.to_hex(),
                fallback: entry.version_label != *requested,
            };
            match args.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
                OutputFormat::Text if view.fallback => println!(
                    "{} {} (fallback for {})",
                    view.version, view.magic, view.requested
                ),
                OutputFormat::Text => println!("{} {}", view.version, view.magic),
            }
        }
        None => {
            let views: Vec<EntryView<'_>> = table
                .entries()
                .iter()
                .map(|entry| entry_view(&table, entry))
                .collect();
            match args.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&views)?),
                OutputFormat::Text => {
                    for view in &views {
                        let marker = if view.default { " (default)" } else { "" };
                        println!("{:<6} {}{marker}", view.version, view.magic);
                    }
                }
            }
        }
    }
    Ok(SUCCESS)
}
