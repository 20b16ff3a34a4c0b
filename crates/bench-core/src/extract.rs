pub const PEAK_MEMORY_LABEL: &str = "Maximum resident set size";
pub const RESULT_LINE_LABEL: &str = "Total cost:";

/// Peak resident memory in KB as reported by a `time -v` style wrapper.
///
/// The last matching line wins. Returns 0 when no line carries a readable
/// value, which the persisted log cannot tell apart from a real reading.
pub fn peak_memory_kb(diagnostics: &str) -> u64 {
    let mut mem_kb = 0;
    for line in diagnostics.lines() {
        if !line.contains(PEAK_MEMORY_LABEL) {
            continue;
        }
        let Some(token) = line.split_whitespace().last() else {
            continue;
        };
        if token.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(value) = token.parse::<u64>() {
                mem_kb = value;
            }
        }
    }
    mem_kb
}

pub fn reported_value(stdout: &str) -> Option<f64> {
    let line = stdout
        .lines()
        .find(|line| line.starts_with(RESULT_LINE_LABEL))?;
    let (_, raw) = line.split_once(':')?;
    raw.trim().parse::<f64>().ok()
}
