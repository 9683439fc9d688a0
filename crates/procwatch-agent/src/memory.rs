//! Resident-memory sampling.
//!
//! Reads the proportional set size of a process from
//! `/proc/<pid>/smaps`. Memory inspection is Linux-only; on other
//! platforms sampling is a no-op that reports zero. All failures read as
//! zero so a vanished or unreadable process never trips a threshold.

/// Sample the resident memory of `pid` in kilobytes.
///
/// Returns the sum of the `Pss:` entries of the process's mappings, or `0`
/// when the process is gone, unreadable, or the platform does not expose
/// memory maps.
#[cfg(target_os = "linux")]
#[must_use]
pub fn sample_memory(pid: u32) -> u64 {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let Ok(file) = File::open(format!("/proc/{pid}/smaps")) else {
        return 0;
    };
    let mut total = 0u64;
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else {
            return 0;
        };
        if let Some(kb) = parse_pss_line(&line) {
            total += kb;
        }
    }
    total
}

/// Sample the resident memory of `pid` in kilobytes (non-Linux no-op).
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn sample_memory(_pid: u32) -> u64 {
    0
}

/// Extract the kilobyte value from a `Pss:` line of an smaps file.
fn parse_pss_line(line: &str) -> Option<u64> {
    let rest = line.strip_prefix("Pss:")?;
    rest.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pss_line() {
        assert_eq!(parse_pss_line("Pss:                 184 kB"), Some(184));
        assert_eq!(parse_pss_line("Pss:0 kB"), Some(0));
    }

    #[test]
    fn test_other_lines_ignored() {
        assert_eq!(parse_pss_line("Rss:                 184 kB"), None);
        assert_eq!(parse_pss_line("Size:               1024 kB"), None);
        assert_eq!(parse_pss_line(""), None);
        // Shared/private breakdowns must not be double counted.
        assert_eq!(parse_pss_line("Pss_Dirty:            12 kB"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_own_process() {
        let pss = sample_memory(std::process::id());
        assert!(pss > 0, "a running test process has resident memory");
    }

    #[test]
    fn test_sample_missing_process_is_zero() {
        assert_eq!(sample_memory(u32::MAX - 1), 0);
    }
}
