//! Small byte and string helpers shared by the pipeline

/// Parse a number that can be hex (0x...) or decimal
pub fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("invalid hex: {}", e))
    } else {
        s.parse().map_err(|e| format!("invalid number: {}", e))
    }
}

/// Parse a size string like "16 MiB", "0x1000" or "4096"
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();

    if let Ok(n) = parse_number(s) {
        return Ok(n);
    }

    let s_lower = s.to_lowercase();
    let (num_str, multiplier) = if let Some(n) = s_lower.strip_suffix("gib") {
        (n.trim(), 1024 * 1024 * 1024)
    } else if let Some(n) = s_lower.strip_suffix("mib") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = s_lower.strip_suffix("mb") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = s_lower.strip_suffix("kib") {
        (n.trim(), 1024)
    } else if let Some(n) = s_lower.strip_suffix("kb") {
        (n.trim(), 1024)
    } else if let Some(n) = s_lower.strip_suffix('b') {
        (n.trim(), 1)
    } else {
        return Err(format!("invalid size: {}", s));
    };

    let num: u64 = num_str.parse().map_err(|_| format!("invalid size: {}", s))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {}", s))
}

/// Format a size as human-readable string
pub fn format_size(size: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    if size >= GIB && size % GIB == 0 {
        format!("{} GiB", size / GIB)
    } else if size >= MIB && size % MIB == 0 {
        format!("{} MiB", size / MIB)
    } else if size >= KIB && size % KIB == 0 {
        format!("{} KiB", size / KIB)
    } else {
        format!("{} bytes", size)
    }
}

/// Render bytes as printable ASCII, replacing anything else with `.`
pub fn ascii_safe(data: &[u8], maxlen: usize) -> String {
    data.iter()
        .take(maxlen)
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

/// Match `text` against a glob pattern supporting `*` and `?`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // backtrack: let the last star swallow one more character
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("0x1000").unwrap(), 4096);
        assert_eq!(parse_size("4 KiB").unwrap(), 4096);
        assert_eq!(parse_size("16MiB").unwrap(), 16 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(32 * 1024 * 1024), "32 MiB");
        assert_eq!(format_size(4096), "4 KiB");
        assert_eq!(format_size(5), "5 bytes");
    }

    #[test]
    fn test_ascii_safe() {
        assert_eq!(ascii_safe(b"hi\x00there\xff", 0x100), "hi.there.");
        assert_eq!(ascii_safe(b"abcdef", 3), "abc");
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("bios*", "bios2"));
        assert!(glob_match("*", ""));
        assert!(glob_match("r?_*", "ro_section"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("bios", "bios2"));
        assert!(!glob_match("a*b", "acd"));
    }
}
