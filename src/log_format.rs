use crate::packer::ArgValue;

/// printf-style format strings.
///
/// Log sites are checked at compile time (`validate_format`,
/// `count_specifiers`) and rendered only by the decompressor, which parses
/// each dictionary format once into a [`FormatTemplate`].

/// Largest width or precision accepted; `std::fmt` rejects anything above.
pub const MAX_FIELD: usize = u16::MAX as usize;

const fn is_flag(b: u8) -> bool {
    matches!(b, b'-' | b'+' | b' ' | b'0' | b'#')
}

const fn is_length_modifier(b: u8) -> bool {
    matches!(b, b'h' | b'l' | b'z' | b'j' | b't' | b'L' | b'q')
}

const fn is_conversion(b: u8) -> bool {
    matches!(
        b,
        b'd' | b'i' | b'u' | b'x' | b'X' | b'o' | b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b's'
            | b'c' | b'p'
    )
}

/// Skips a run of digits. None when its value exceeds [`MAX_FIELD`].
const fn scan_field(bytes: &[u8], mut i: usize) -> Option<usize> {
    let mut value = 0usize;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        value = value * 10 + (bytes[i] - b'0') as usize;
        if value > MAX_FIELD {
            return None;
        }
        i += 1;
    }
    Some(i)
}

/// Scans one conversion starting just after its `%`. Returns the index past
/// the conversion character and whether it consumes an argument.
const fn scan_spec(bytes: &[u8], start: usize) -> Option<(usize, bool)> {
    let mut i = start;
    if i < bytes.len() && bytes[i] == b'%' {
        return Some((i + 1, false));
    }
    while i < bytes.len() && is_flag(bytes[i]) {
        i += 1;
    }
    i = match scan_field(bytes, i) {
        Some(end) => end,
        None => return None,
    };
    if i < bytes.len() && bytes[i] == b'.' {
        i = match scan_field(bytes, i + 1) {
            Some(end) => end,
            None => return None,
        };
    }
    while i < bytes.len() && is_length_modifier(bytes[i]) {
        i += 1;
    }
    if i < bytes.len() && is_conversion(bytes[i]) {
        Some((i + 1, true))
    } else {
        None
    }
}

// Helper functions for compile-time format string analysis
#[doc(hidden)]
pub const fn validate_format(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            match scan_spec(bytes, i + 1) {
                Some((end, _)) => i = end,
                None => return false,
            }
        } else {
            i += 1;
        }
    }
    true
}

/// Number of arguments a valid format string consumes (`%%` excluded).
#[doc(hidden)]
pub const fn count_specifiers(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut count = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            match scan_spec(bytes, i + 1) {
                Some((end, consumes)) => {
                    if consumes {
                        count += 1;
                    }
                    i = end;
                }
                None => return count,
            }
        } else {
            i += 1;
        }
    }
    count
}

/// One parsed conversion specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Spec {
    pub left_align: bool,
    pub plus_sign: bool,
    pub space_sign: bool,
    pub zero_pad: bool,
    pub alternate: bool,
    pub width: usize,
    pub precision: Option<usize>,
    pub conversion: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Spec(Spec),
}

/// A format string split into literal text and conversions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatTemplate {
    segments: Vec<Segment>,
}

impl FormatTemplate {
    /// Parses a format string. Malformed conversions, including widths or
    /// precisions above [`MAX_FIELD`], are kept as literal text, since
    /// dictionary contents come from files we do not control.
    pub fn parse(fmt: &str) -> Self {
        let bytes = fmt.as_bytes();
        let mut segments = Vec::new();
        let mut literal_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'%' {
                i += 1;
                continue;
            }
            let Some((end, consumes)) = scan_spec(bytes, i + 1) else {
                i += 1;
                continue;
            };
            if consumes {
                if literal_start < i {
                    segments.push(Segment::Literal(fmt[literal_start..i].to_string()));
                }
                segments.push(Segment::Spec(parse_spec(&bytes[i + 1..end])));
                literal_start = end;
            } else {
                // "%%": keep the first '%' with the preceding text, drop the second.
                segments.push(Segment::Literal(fmt[literal_start..i + 1].to_string()));
                literal_start = end;
            }
            i = end;
        }
        if literal_start < bytes.len() {
            segments.push(Segment::Literal(fmt[literal_start..].to_string()));
        }

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn arg_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Spec(_)))
            .count()
    }

    /// Substitutes `args` positionally.
    ///
    /// ```
    /// # use nanolog::log_format::FormatTemplate;
    /// # use nanolog::packer::ArgValue;
    /// let template = FormatTemplate::parse("%s has %d items, avg %.1f");
    /// let args = [ArgValue::Str("cart".into()), ArgValue::I32(42), ArgValue::F64(3.14159)];
    /// assert_eq!(template.render(&args), "cart has 42 items, avg 3.1");
    /// ```
    pub fn render(&self, args: &[ArgValue]) -> String {
        let mut result = String::new();
        let mut params = args.iter();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => result.push_str(text),
                Segment::Spec(spec) => match params.next() {
                    Some(value) => result.push_str(&render_spec(spec, value)),
                    None => result.push_str("{MISSING}"),
                },
            }
        }
        result
    }
}

/// `body` has already passed `scan_spec`, so both fields fit in `MAX_FIELD`.
fn parse_spec(body: &[u8]) -> Spec {
    let mut spec = Spec::default();
    let mut i = 0;
    while i < body.len() && is_flag(body[i]) {
        match body[i] {
            b'-' => spec.left_align = true,
            b'+' => spec.plus_sign = true,
            b' ' => spec.space_sign = true,
            b'0' => spec.zero_pad = true,
            _ => spec.alternate = true,
        }
        i += 1;
    }
    while i < body.len() && body[i].is_ascii_digit() {
        spec.width = (spec.width * 10 + (body[i] - b'0') as usize).min(MAX_FIELD);
        i += 1;
    }
    if i < body.len() && body[i] == b'.' {
        i += 1;
        let mut precision = 0;
        while i < body.len() && body[i].is_ascii_digit() {
            precision = (precision * 10 + (body[i] - b'0') as usize).min(MAX_FIELD);
            i += 1;
        }
        spec.precision = Some(precision);
    }
    spec.conversion = body[body.len() - 1];
    spec
}

fn as_signed(value: &ArgValue) -> Option<i128> {
    Some(match *value {
        ArgValue::I8(v) => v as i128,
        ArgValue::I16(v) => v as i128,
        ArgValue::I32(v) => v as i128,
        ArgValue::I64(v) => v as i128,
        ArgValue::U8(v) => v as i128,
        ArgValue::U16(v) => v as i128,
        ArgValue::U32(v) => v as i128,
        ArgValue::U64(v) => v as i128,
        ArgValue::Pointer(v) => v as i128,
        ArgValue::Bool(v) => v as i128,
        ArgValue::Char(c) => c as i128,
        _ => return None,
    })
}

/// Integer bits reinterpreted as unsigned at the argument's own width.
fn as_unsigned(value: &ArgValue) -> Option<u128> {
    Some(match *value {
        ArgValue::I8(v) => v as u8 as u128,
        ArgValue::I16(v) => v as u16 as u128,
        ArgValue::I32(v) => v as u32 as u128,
        ArgValue::I64(v) => v as u64 as u128,
        _ => as_signed(value)? as u128,
    })
}

fn as_float(value: &ArgValue) -> Option<f64> {
    match *value {
        ArgValue::F32(v) => Some(v as f64),
        ArgValue::F64(v) => Some(v),
        _ => as_signed(value).map(|v| v as f64),
    }
}

fn render_spec(spec: &Spec, value: &ArgValue) -> String {
    match spec.conversion {
        b'd' | b'i' => match as_signed(value) {
            Some(v) => {
                let digits = int_digits(v.unsigned_abs().to_string(), spec.precision);
                pad_numeric(spec, sign_for(spec, v < 0), "", &digits, spec.precision.is_none())
            }
            None => pad_text(spec, &value.to_string()),
        },
        b'u' | b'x' | b'X' | b'o' => match as_unsigned(value) {
            Some(v) => {
                let (digits, prefix) = match spec.conversion {
                    b'x' => (format!("{:x}", v), if spec.alternate && v != 0 { "0x" } else { "" }),
                    b'X' => (format!("{:X}", v), if spec.alternate && v != 0 { "0X" } else { "" }),
                    b'o' => (format!("{:o}", v), if spec.alternate && v != 0 { "0" } else { "" }),
                    _ => (v.to_string(), ""),
                };
                let digits = int_digits(digits, spec.precision);
                pad_numeric(spec, "", prefix, &digits, spec.precision.is_none())
            }
            None => pad_text(spec, &value.to_string()),
        },
        b'f' | b'F' | b'e' | b'E' | b'g' | b'G' => match as_float(value) {
            Some(v) => render_float(spec, v),
            None => pad_text(spec, &value.to_string()),
        },
        b'c' => {
            let text = match *value {
                ArgValue::Char(c) => c.to_string(),
                _ => match as_unsigned(value).and_then(|v| char::from_u32(v as u32)) {
                    Some(c) => c.to_string(),
                    None => value.to_string(),
                },
            };
            pad_text(spec, &text)
        }
        b'p' => match as_unsigned(value) {
            Some(v) => pad_text(spec, &format!("{:#x}", v)),
            None => pad_text(spec, &value.to_string()),
        },
        _ => {
            let text = value.to_string();
            let text = match spec.precision {
                Some(p) => text.chars().take(p).collect(),
                None => text,
            };
            pad_text(spec, &text)
        }
    }
}

fn sign_for(spec: &Spec, negative: bool) -> &'static str {
    if negative {
        "-"
    } else if spec.plus_sign {
        "+"
    } else if spec.space_sign {
        " "
    } else {
        ""
    }
}

/// Applies integer precision (minimum digit count, ".0" prints zero as nothing).
fn int_digits(digits: String, precision: Option<usize>) -> String {
    match precision {
        Some(0) if digits == "0" => String::new(),
        Some(p) if digits.len() < p => format!("{}{}", "0".repeat(p - digits.len()), digits),
        _ => digits,
    }
}

fn pad_text(spec: &Spec, text: &str) -> String {
    let len = text.chars().count();
    if len >= spec.width {
        return text.to_string();
    }
    let fill = " ".repeat(spec.width - len);
    if spec.left_align {
        format!("{}{}", text, fill)
    } else {
        format!("{}{}", fill, text)
    }
}

fn pad_numeric(spec: &Spec, sign: &str, prefix: &str, digits: &str, zero_allowed: bool) -> String {
    let len = sign.len() + prefix.len() + digits.len();
    if len >= spec.width {
        return format!("{}{}{}", sign, prefix, digits);
    }
    let fill = spec.width - len;
    if spec.left_align {
        format!("{}{}{}{}", sign, prefix, digits, " ".repeat(fill))
    } else if spec.zero_pad && zero_allowed {
        format!("{}{}{}{}", sign, prefix, "0".repeat(fill), digits)
    } else {
        format!("{}{}{}{}", " ".repeat(fill), sign, prefix, digits)
    }
}

fn render_float(spec: &Spec, v: f64) -> String {
    let upper = spec.conversion.is_ascii_uppercase();
    let sign = sign_for(spec, v.is_sign_negative() && !v.is_nan());

    if !v.is_finite() {
        let text = match (v.is_nan(), upper) {
            (true, false) => "nan",
            (true, true) => "NAN",
            (false, false) => "inf",
            (false, true) => "INF",
        };
        return pad_numeric(spec, sign, "", text, false);
    }

    let abs = v.abs();
    let precision = spec.precision.unwrap_or(6);
    let body = match spec.conversion.to_ascii_lowercase() {
        b'f' => format!("{:.*}", precision, abs),
        b'e' => exp_notation(abs, precision, upper),
        _ => general_notation(abs, precision, spec.alternate, upper),
    };
    pad_numeric(spec, sign, "", &body, true)
}

/// C-style scientific notation: at least two exponent digits, explicit sign.
fn exp_notation(abs: f64, precision: usize, upper: bool) -> String {
    let (mantissa, exponent) = split_exponent(abs, precision);
    let e = if upper { 'E' } else { 'e' };
    let exp_sign = if exponent < 0 { '-' } else { '+' };
    format!("{}{}{}{:02}", mantissa, e, exp_sign, exponent.unsigned_abs())
}

fn split_exponent(abs: f64, precision: usize) -> (String, i32) {
    let formatted = format!("{:.*e}", precision, abs);
    match formatted.split_once('e') {
        Some((mantissa, exp)) => (mantissa.to_string(), exp.parse().unwrap_or(0)),
        None => (formatted, 0),
    }
}

fn general_notation(abs: f64, precision: usize, alternate: bool, upper: bool) -> String {
    let p = precision.max(1);
    let exponent = if abs == 0.0 {
        0
    } else {
        split_exponent(abs, p - 1).1
    };

    if exponent >= -4 && (exponent as i64) < p as i64 {
        let decimals = (p as i64 - 1 - exponent as i64).clamp(0, MAX_FIELD as i64) as usize;
        let text = format!("{:.*}", decimals, abs);
        if alternate {
            text
        } else {
            strip_trailing_zeros(&text)
        }
    } else {
        let text = exp_notation(abs, p - 1, upper);
        if alternate {
            return text;
        }
        let split_at = text.find(['e', 'E']).unwrap_or(text.len());
        let (mantissa, exp) = text.split_at(split_at);
        format!("{}{}", strip_trailing_zeros(mantissa), exp)
    }
}

fn strip_trailing_zeros(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}
