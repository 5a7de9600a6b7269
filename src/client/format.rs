//! Output formatting for CLI client commands.
//!
//! Human-readable tables and status lines. When an entry's content is
//! requested, metadata goes to stderr and raw bytes to stdout so piping
//! works (`clipsyncd client get-entry main 0 | less`).

use std::io::{self, Write};

use crate::ipc::protocol::{ClipboardDescriptor, EndpointDescriptor, EntryDescriptor};

use super::daemon_client::FetchedEntry;

pub fn print_clipboards(clipboards: &[ClipboardDescriptor]) {
    if clipboards.is_empty() {
        println!("No clipboards");
        return;
    }

    println!("{:<24} {:>8} {:>8} {:>10}", "CLIPBOARD", "ENTRIES", "MAX", "ENDPOINTS");
    println!("{}", "-".repeat(54));
    for c in clipboards {
        println!(
            "{:<24} {:>8} {:>8} {:>10}",
            c.label, c.entries, c.max_entries, c.endpoints
        );
    }
}

pub fn print_endpoints(clipboard: &str, endpoints: &[EndpointDescriptor]) {
    if endpoints.is_empty() {
        println!("No endpoints attached to {clipboard}");
        return;
    }

    println!("{:<24} {:<10} SELECTION", "ENDPOINT", "TRANSPORT");
    println!("{}", "-".repeat(46));
    for e in endpoints {
        println!("{:<24} {:<10} {}", e.label, e.transport, e.selection);
    }
}

pub fn print_entries(entries: &[EntryDescriptor]) {
    if entries.is_empty() {
        println!("No entries in history");
        return;
    }

    println!(
        "{:<36} {:>6} {:>10} {:>14} {:<4} MIME_TYPES",
        "ENTRY_ID", "INDEX", "SIZE", "CREATED", "STAR"
    );
    println!("{}", "-".repeat(96));
    for e in entries {
        println!(
            "{:<36} {:>6} {:>10} {:>14} {:<4} {}",
            e.entry_id,
            e.index,
            e.byte_length,
            e.creation_time,
            if e.starred { "*" } else { "" },
            format_mime_types(&e.mime_types),
        );
    }
}

/// Print one entry.
///
/// With content, the metadata header goes to stderr and the raw bytes
/// to stdout. Without, the header goes to stdout.
pub fn print_entry(fetched: &FetchedEntry) -> Result<(), io::Error> {
    let e = &fetched.entry;
    let header = [
        format!("Entry:     {}", e.entry_id),
        format!("Clipboard: {}", e.clipboard),
        format!("Index:     {}", e.index),
        format!("Size:      {} bytes", e.byte_length),
        format!("Created:   {}", e.creation_time),
        format!("Last used: {}", e.last_used_time),
        format!("Starred:   {}", if e.starred { "yes" } else { "no" }),
        format!("Types:     {}", format_mime_types(&e.mime_types)),
    ];

    match &fetched.content {
        Some(content) => {
            for line in &header {
                eprintln!("{line}");
            }
            eprintln!("---");
            let mut stdout = io::stdout().lock();
            stdout.write_all(content)?;
            stdout.flush()?;
        }
        None => {
            for line in &header {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn format_mime_types(mime_types: &[String]) -> String {
    if mime_types.is_empty() {
        // A cleared selection.
        "(cleared)".to_string()
    } else {
        mime_types.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_joined() {
        assert_eq!(
            format_mime_types(&["text/html".into(), "text/plain".into()]),
            "text/html,text/plain"
        );
    }

    #[test]
    fn cleared_entry_has_marker() {
        assert_eq!(format_mime_types(&[]), "(cleared)");
    }
}
