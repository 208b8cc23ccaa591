use std::fs;

const STATM_PATH: &str = "/proc/self/statm";
const STATUS_PATH: &str = "/proc/self/status";
const FD_DIR_PATH: &str = "/proc/self/fd";
const THREADS_LINE_PREFIX: &str = "Threads:";

pub fn resident_set_size() -> Option<u64> {
    let statm = fs::read_to_string(STATM_PATH).ok()?;
    parse_statm_rss_pages(&statm).map(|pages| pages * page_size())
}

pub fn open_fds() -> Option<u64> {
    // Reading the directory opens one descriptor of its own, which shows up in the listing.
    let entries = fs::read_dir(FD_DIR_PATH).ok()?;
    let count = entries.filter(|entry| entry.is_ok()).count() as u64;
    Some(count.saturating_sub(1))
}

pub fn thread_count() -> Option<u64> {
    let status = fs::read_to_string(STATUS_PATH).ok()?;
    parse_status_threads(&status)
}

fn page_size() -> u64 {
    // SAFETY: `sysconf` has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        4096
    } else {
        page_size as u64
    }
}

// Resident set size is the second space-delimited field, in pages.
fn parse_statm_rss_pages(statm: &str) -> Option<u64> {
    statm.split_ascii_whitespace().nth(1)?.parse().ok()
}

fn parse_status_threads(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(THREADS_LINE_PREFIX))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statm_second_field_is_rss() {
        assert_eq!(parse_statm_rss_pages("4312 1024 512 2 0 900 0\n"), Some(1024));
        assert_eq!(parse_statm_rss_pages("4312"), None);
        assert_eq!(parse_statm_rss_pages(""), None);
    }

    #[test]
    fn status_threads_line() {
        let status = "Name:\tdemo\nState:\tS (sleeping)\nThreads:\t7\nSigQ:\t0/1\n";
        assert_eq!(parse_status_threads(status), Some(7));
        assert_eq!(parse_status_threads("Name:\tdemo\n"), None);
    }

    #[test]
    fn live_process_counters() {
        assert!(resident_set_size().unwrap() > 0);
        assert!(thread_count().unwrap() >= 1);

        // stdin, stdout and stderr at the very least.
        assert!(open_fds().unwrap() >= 3);
    }
}
