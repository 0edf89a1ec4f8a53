/// `[ 3/10]`: the index right-aligned to the width of the total.
pub fn output_iter(i: usize, n: usize) -> String {
    let width = n.to_string().len();
    format!("[{i:>width$}/{n}]")
}

/// Whole seconds rendered as `H:MM:SS`.
pub fn format_duration(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        secs as u64
    } else {
        0
    };
    let (h, rem) = (total / 3600, total % 3600);
    let (m, s) = (rem / 60, rem % 60);
    format!("{h}:{m:02}:{s:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iter_is_padded() {
        assert_eq!(output_iter(3, 10), "[ 3/10]");
        assert_eq!(output_iter(10, 10), "[10/10]");
        assert_eq!(output_iter(0, 5), "[0/5]");
    }

    #[test]
    fn duration_formats() {
        assert_eq!(format_duration(0.4), "0:00:00");
        assert_eq!(format_duration(3725.9), "1:02:05");
        assert_eq!(format_duration(f64::NAN), "0:00:00");
    }
}
