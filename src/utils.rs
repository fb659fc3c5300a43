use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

pub fn get_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 40 lowercase hex characters, fresh for every primary instance.
pub fn generate_replication_id() -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(40);
    for _ in 0..20 {
        let _ = write!(id, "{:02x}", rng.gen::<u8>());
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_id_is_forty_hex_chars() {
        let id = generate_replication_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_replication_id());
    }
}
