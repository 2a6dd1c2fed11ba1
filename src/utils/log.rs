// src/utils/log.rs

//! Run-report helpers with server-style formatting.
//!
//! Everything goes through the `log` facade so CI output stays uniform
//! with the rest of the crate.

/// Log a header
pub fn header(title: &str) {
    let border = "═".repeat(60);
    log::info!("{border}");
    log::info!("  {title}");
    log::info!("{border}");
}

/// Log a sub-item (indented)
pub fn sub_item(message: &str) {
    log::info!("    {message}");
}

/// Log a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    log::info!("[SUMMARY] {title}");
    for (key, value) in items {
        log::info!("    {key}: {value}");
    }
}

/// Format an id list for logs and notifications, eliding the middle of long lists.
pub fn id_list(ids: &[u64], max: usize) -> String {
    if ids.len() <= max {
        return ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
    }
    let shown: Vec<String> = ids[..max].iter().map(u64::to_string).collect();
    format!("{} (+{} more)", shown.join(", "), ids.len() - max)
}
