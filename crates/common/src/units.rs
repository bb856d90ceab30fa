//! Byte-count formatting for log lines.

const IEC_UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// Renders `size` with a binary unit, e.g. `1.5MiB`; sizes below 1KiB stay in bytes.
#[must_use]
pub fn human_bytes(size: u64) -> String {
    if size < 1024 {
        return format!("{size}B");
    }
    let mut p = (63 - size.leading_zeros()) as usize / 10;
    p = p.min(IEC_UNITS.len());
    let converted = size as f64 / 1024_f64.powi(p as i32);
    format!("{converted:.1}{}", IEC_UNITS[p - 1])
}
