//! Binary-SI quantity strings (`64Mi`, `1Gi`) as rendered by Kubernetes.

const BINARY_SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

/// Render a byte count in binary-SI form.
///
/// The largest suffix that divides the value exactly is used. Values under
/// 1024 fall back to decimal-SI, so `1000` becomes `1k`.
pub fn binary_si(value: i64) -> String {
    if value.unsigned_abs() < 1024 {
        return decimal_small(value);
    }

    let mut mantissa = value;
    let mut suffix = "";
    for candidate in BINARY_SUFFIXES {
        if mantissa % 1024 != 0 {
            break;
        }
        mantissa /= 1024;
        suffix = candidate;
    }
    format!("{mantissa}{suffix}")
}

fn decimal_small(value: i64) -> String {
    if value != 0 && value % 1000 == 0 {
        format!("{}k", value / 1000)
    } else {
        value.to_string()
    }
}
