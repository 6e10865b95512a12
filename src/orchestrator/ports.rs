use crate::error::{Result, SupervisorError};
use std::collections::HashSet;

/// Whether `port` can be bound on `host` right now
pub fn is_port_available(host: &str, port: u16) -> bool {
    std::net::TcpListener::bind((host, port)).is_ok()
}

/// First port in `range` that is neither claimed nor bound by someone else
pub fn find_free_port(host: &str, range: (u16, u16), claimed: &HashSet<u16>) -> Result<u16> {
    let (start, end) = range;
    (start..=end)
        .find(|port| !claimed.contains(port) && is_port_available(host, *port))
        .ok_or_else(|| {
            SupervisorError::Conflict(format!("no free port in range {}-{}", start, end))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_port_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available("127.0.0.1", port));

        drop(listener);
        assert!(is_port_available("127.0.0.1", port));
    }

    #[test]
    fn test_find_free_port_skips_claimed_and_bound() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let bound = listener.local_addr().unwrap().port();

        let claimed: HashSet<u16> = [bound.wrapping_add(1)].into_iter().collect();
        let port = find_free_port("127.0.0.1", (bound, bound.saturating_add(50)), &claimed).unwrap();
        assert_ne!(port, bound);
        assert!(!claimed.contains(&port));
    }

    #[test]
    fn test_exhausted_range() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let bound = listener.local_addr().unwrap().port();

        let result = find_free_port("127.0.0.1", (bound, bound), &HashSet::new());
        assert!(matches!(result, Err(SupervisorError::Conflict(_))));
    }
}
