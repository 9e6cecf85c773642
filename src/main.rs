//! CLI tool that embeds a file into a PDF as an attachment.
//!
//! `attachpdf <input.pdf> <attached_file> <output.pdf>`

use attachpdf::{AttachConfig, AttachError, Attachment, PdfAttacher, Result};
use std::{env, process};

/// Attachments above this size are refused.
const MAX_ATTACHMENT_SIZE: usize = 256 * 1024 * 1024;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("attachpdf");

    if args.len() != 4 {
        let usage =
            AttachError::Usage(format!("{program} <input.pdf> <attached_file> <output.pdf>"));
        eprintln!("{usage}");
        process::exit(2);
    }

    match run(&args[1], &args[2], &args[3]) {
        Ok(summary) => println!("{summary}"),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

fn run(input: &str, attached: &str, output: &str) -> Result<String> {
    let config = AttachConfig {
        max_attachment_size: Some(MAX_ATTACHMENT_SIZE),
        ..Default::default()
    };

    let mut attacher = PdfAttacher::with_config(input, config)?;
    let attachment = Attachment::from_path(attached)?;
    attacher.attach(&attachment)?;
    attacher.save(output)?;

    Ok(format!(
        "📎 Attached '{}' ({}) to {} -> {}",
        attachment.name,
        format_bytes(attachment.data.len()),
        input,
        output
    ))
}

fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
