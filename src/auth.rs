use ahash::AHashMap;
use parking_lot::RwLock;
use stun_server_core::Authenticator;

/// Static long-term-credential table: a fixed realm plus an in-memory
/// username -> password map, read concurrently by every dispatch loop.
/// `update` lets an operator hot-swap the table (e.g. on SIGHUP) without
/// restarting the server.
pub struct StaticCredentials {
    realm: String,
    table: RwLock<AHashMap<String, String>>,
}

impl StaticCredentials {
    pub fn new(realm: String, table: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            realm,
            table: RwLock::new(table.into_iter().collect()),
        }
    }

    pub fn update(&self, table: impl IntoIterator<Item = (String, String)>) {
        *self.table.write() = table.into_iter().collect();
    }
}

impl Authenticator for StaticCredentials {
    fn get_password(&self, username: &str) -> Option<String> {
        self.table.read().get(username).cloned()
    }

    fn realm(&self) -> &str {
        &self.realm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_known_user() {
        let creds = StaticCredentials::new("example.org".into(), [("alice".to_string(), "hunter2".to_string())]);
        assert_eq!(creds.get_password("alice"), Some("hunter2".to_string()));
        assert_eq!(creds.get_password("bob"), None);
    }

    #[test]
    fn update_replaces_table() {
        let creds = StaticCredentials::new("example.org".into(), []);
        assert_eq!(creds.get_password("alice"), None);

        creds.update([("alice".to_string(), "hunter2".to_string())]);
        assert_eq!(creds.get_password("alice"), Some("hunter2".to_string()));
    }
}
