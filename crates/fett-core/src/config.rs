//! Spawn defaults

/// Stack size used when a clone request does not name one (1 MiB)
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Environment variable overriding [`DEFAULT_STACK_SIZE`]
pub const STACK_SIZE_ENV: &str = "FETT_STACK_SIZE";

/// Get default child stack size from `FETT_STACK_SIZE` or the built-in default
///
/// Accepts a byte count with an optional `K` or `M` suffix (powers of 1024).
/// Unparsable or zero values are ignored with a warning.
#[must_use]
pub fn default_stack_size() -> usize {
    match std::env::var(STACK_SIZE_ENV) {
        Ok(raw) => parse_size(&raw).unwrap_or_else(|| {
            tracing::warn!(value = %raw, "ignoring invalid {STACK_SIZE_ENV}");
            DEFAULT_STACK_SIZE
        }),
        Err(_) => DEFAULT_STACK_SIZE,
    }
}

fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, unit) = match raw.as_bytes().last()? {
        b'k' | b'K' => (&raw[..raw.len() - 1], 1024),
        b'm' | b'M' => (&raw[..raw.len() - 1], 1024 * 1024),
        _ => (raw, 1),
    };
    let size = digits.parse::<usize>().ok()?.checked_mul(unit)?;
    (size > 0).then_some(size)
}
