use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::upload::{UploadCategory, UploadFile};

/// Check a file against its category's size and type rules.
///
/// Runs synchronously and performs no I/O, so a rejected file never
/// reaches the network.
pub fn validate_file(
    file: &UploadFile,
    category: UploadCategory,
    config: &UploaderConfig,
) -> Result<(), UploadError> {
    let rule = config.category_rule(category).ok_or_else(|| {
        UploadError::validation(format!("No upload rules configured for category '{}'", category))
    })?;

    if file.size == 0 {
        return Err(UploadError::validation(format!(
            "File '{}' is empty",
            file.name
        )));
    }

    if file.size > rule.max_file_size {
        return Err(UploadError::validation(format!(
            "File '{}' is {} but {} uploads are limited to {}",
            file.name,
            format_size(file.size),
            category,
            format_size(rule.max_file_size)
        )));
    }

    if !is_type_allowed(&file.mime_type, &rule.allowed_types) {
        return Err(UploadError::validation(format!(
            "File type '{}' is not allowed for {} uploads (allowed: {})",
            file.mime_type,
            category,
            rule.allowed_types.join(", ")
        )));
    }

    Ok(())
}

/// Exact match or `type/*` wildcard, ignoring case and MIME parameters
fn is_type_allowed(mime_type: &str, allowed: &[String]) -> bool {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    allowed.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        match pattern.strip_suffix("/*") {
            Some(top_level) => essence
                .split_once('/')
                .map(|(ty, _)| ty == top_level)
                .unwrap_or(false),
            None => pattern == essence,
        }
    })
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
