//! Number formatting for broadcast messages.

/// Quotes at or above this value are shown with two decimals, smaller ones with three.
const PRECISION_THRESHOLD: f64 = 1.5;

/// Round `quote` to 2 or 3 decimals depending on its magnitude and drop trailing zeros.
///
/// `91.2049` -> `"91.2"`, `0.18833` -> `"0.188"`, `64000.0` -> `"64000"`.
pub fn format_quote(quote: f64) -> String {
    let decimals = if quote >= PRECISION_THRESHOLD { 2 } else { 3 };
    let rounded = format!("{:.*}", decimals, quote);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-0" => "0".to_string(),
        other => other.to_string(),
    }
}
