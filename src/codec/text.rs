//! Numeric text rendering helpers.
//!
//! Scaled register values are rendered in the C `printf` `%g` style: shortest
//! of fixed and exponential notation at a given significant-digit precision,
//! with trailing zeros removed. 32-bit floats use 7 significant digits,
//! everything else 15. Tests elsewhere lock these numerics, so the rendering
//! must stay bit-for-bit stable.

/// Round `value` to a multiple of `round_to`. A non-positive step means no
/// rounding.
pub fn round_value(value: f64, round_to: f64) -> f64 {
    if round_to > 0.0 {
        (value / round_to).round() * round_to
    } else {
        value
    }
}

/// Render `value` like `printf("%.{precision}g")`.
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let precision = precision.max(1);

    // Render in exponential form first to learn the decimal exponent after
    // rounding to `precision` significant digits.
    let exp_form = format!("{:.*e}", precision - 1, value);
    let (mantissa, exp) = match exp_form.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (exp_form.as_str(), 0),
    };

    if exp < -4 || exp >= precision as i32 {
        // Exponential notation, C style: trimmed mantissa, signed two-digit
        // exponent.
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        let fixed = format!("{:.*}", decimals, value);
        trim_fraction(&fixed).to_string()
    }
}

/// Strip trailing zeros of a decimal fraction, and the dot itself if the
/// fraction vanishes.
fn trim_fraction(s: &str) -> &str {
    if !s.contains('.') {
        return s;
    }
    let s = s.trim_end_matches('0');
    s.strip_suffix('.').unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_value() {
        assert!((round_value(1.26, 0.1) - 1.3).abs() < 1e-9);
        assert!((round_value(1.24, 0.1) - 1.2).abs() < 1e-9);
        assert_eq!(round_value(7.0, 0.0), 7.0);
        assert_eq!(round_value(15.0, 10.0), 20.0);
    }

    #[test]
    fn test_format_g_fixed() {
        assert_eq!(format_g(3.14159274101257, 7), "3.141593");
        assert_eq!(format_g(42.0, 7), "42");
        assert_eq!(format_g(-42.5, 15), "-42.5");
        assert_eq!(format_g(0.0001234, 7), "0.0001234");
        assert_eq!(format_g(0.0, 7), "0");
    }

    #[test]
    fn test_format_g_exponential() {
        assert_eq!(format_g(0.00001234, 7), "1.234e-05");
        assert_eq!(format_g(150000000.0, 7), "1.5e+08");
        assert_eq!(format_g(1234567890.0, 15), "1234567890");
    }

    #[test]
    fn test_format_g_rounding_bumps_exponent() {
        // 9.9999999 at 7 significant digits rounds up to 10.
        assert_eq!(format_g(9.9999999, 7), "10");
    }

    #[test]
    fn test_format_g_trailing_zeros_removed() {
        assert_eq!(format_g(2.5000000, 15), "2.5");
        assert_eq!(format_g(100.0, 7), "100");
    }
}
