use std::path::Path;

use pyconv_core::detect::{detect_format, MIN_CONTAINER_LEN};
use pyconv_core::Format;
use tokio::io::AsyncReadExt;

use crate::cli::args::DetectArgs;
use crate::exit_codes::{CONVERSION_FAILED, SUCCESS};

pub async fn run(args: DetectArgs) -> anyhow::Result<i32> {
    let mut code = SUCCESS;
    for path in &args.files {
        match sniff(path).await {
            Ok(format) => println!("{}: {}", path.display(), format.as_str()),
            Err(e) => {
                println!("{}: error: {e}", path.display());
                code = CONVERSION_FAILED;
            }
        }
    }
    Ok(code)
}

/// Classify from the header alone.
async fn sniff(path: &Path) -> std::io::Result<Format> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(MIN_CONTAINER_LEN);
    file.take(MIN_CONTAINER_LEN as u64)
        .read_to_end(&mut head)
        .await?;
    Ok(detect_format(&head))
}
