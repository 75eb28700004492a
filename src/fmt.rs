use crate::models::Scalar;

/// Format a number with thousands separators. Integral values get no
/// fraction, others two decimals: 1,234 / 1,234.50
pub fn number(val: f64) -> String {
    let negative = val < 0.0;
    let abs = val.abs();
    let text = if abs.fract() == 0.0 {
        format!("{abs:.0}")
    } else {
        format!("{abs:.2}")
    };
    let (int_part, dec_part) = match text.split_once('.') {
        Some((i, d)) => (i, Some(d)),
        None => (text.as_str(), None),
    };

    let mut with_commas = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_commas.push(',');
        }
        with_commas.push(c);
    }
    let mut out: String = with_commas.chars().rev().collect();
    if let Some(dec) = dec_part {
        out.push('.');
        out.push_str(dec);
    }
    if negative {
        format!("-{out}")
    } else {
        out
    }
}

/// Table cell text. Blank cells render empty, numbers through [`number`].
pub fn cell(value: &Scalar) -> String {
    match value {
        Scalar::Number(n) => number(*n),
        other => other.to_string(),
    }
}

/// Human readable byte count: 512 B, 1.5 KB, 2.0 MB
pub fn file_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}
