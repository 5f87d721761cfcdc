use crate::{Credential, EngineError};
use std::sync::Mutex;

const SERVICE_NAME: &str = "whodb";

/// Persistence for profile credentials outside the process (desktop mode).
///
/// Implementations own the storage format: a credential is written as its
/// JSON serialization under an entry derived from its id, and comes back
/// flagged as a profile-sourced credential on read.
pub trait SecretStore: Send + Sync {
    fn is_available(&self) -> bool;
    fn get_credential(&self, id: &str) -> Result<Option<Credential>, EngineError>;
    fn store_credential(&self, id: &str, credential: &Credential) -> Result<(), EngineError>;
    fn delete_credential(&self, id: &str) -> Result<(), EngineError>;
}

/// Store used when no keyring is reachable: lookups miss and writes are
/// dropped, so headless servers run without a credential store.
pub struct NoopSecretStore;

impl SecretStore for NoopSecretStore {
    fn is_available(&self) -> bool {
        false
    }

    fn get_credential(&self, _id: &str) -> Result<Option<Credential>, EngineError> {
        Ok(None)
    }

    fn store_credential(&self, _id: &str, _credential: &Credential) -> Result<(), EngineError> {
        Ok(())
    }

    fn delete_credential(&self, _id: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Keyring entry name under the `whodb` service for a credential id.
pub fn credential_secret_ref(id: &str) -> String {
    format!("whodb:credential:{id}")
}

/// OS keyring store.
///
/// Platform secret services dislike concurrent access to the same entry,
/// so every operation runs under the store lock.
pub struct KeyringSecretStore {
    available: bool,
    guard: Mutex<()>,
}

impl KeyringSecretStore {
    pub fn new() -> Self {
        // One probe decides availability for the process lifetime: if a
        // scratch entry cannot even be opened, no secret service is
        // reachable and every call short-circuits.
        let available = keyring::Entry::new(SERVICE_NAME, "__whodb_probe__")
            .map(|entry| {
                let _ = entry.get_password();
                true
            })
            .unwrap_or(false);

        Self {
            available,
            guard: Mutex::new(()),
        }
    }

    fn entry(&self, id: &str) -> Result<keyring::Entry, EngineError> {
        keyring::Entry::new(SERVICE_NAME, &credential_secret_ref(id))
            .map_err(|e| EngineError::internal(format!("keyring entry for {id:?}: {e}")))
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringSecretStore {
    fn is_available(&self) -> bool {
        self.available
    }

    fn get_credential(&self, id: &str) -> Result<Option<Credential>, EngineError> {
        if !self.available {
            return Ok(None);
        }
        let _serialized = self.guard.lock().unwrap_or_else(|e| e.into_inner());

        let json = match self.entry(id)?.get_password() {
            Ok(json) => json,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => {
                return Err(EngineError::internal(format!(
                    "keyring read for {id:?}: {e}"
                )));
            }
        };

        let mut credential: Credential = serde_json::from_str(&json).map_err(|e| {
            EngineError::internal(format!("corrupt keyring entry for {id:?}: {e}"))
        })?;
        credential.id = Some(id.to_string());
        credential.is_profile = true;
        Ok(Some(credential))
    }

    fn store_credential(&self, id: &str, credential: &Credential) -> Result<(), EngineError> {
        if !self.available {
            return Err(EngineError::unsupported(
                "no keyring is available on this host",
            ));
        }
        let _serialized = self.guard.lock().unwrap_or_else(|e| e.into_inner());

        let json = serde_json::to_string(credential)
            .map_err(|e| EngineError::internal(format!("unserializable credential: {e}")))?;
        self.entry(id)?
            .set_password(&json)
            .map_err(|e| EngineError::internal(format!("keyring write for {id:?}: {e}")))
    }

    fn delete_credential(&self, id: &str) -> Result<(), EngineError> {
        if !self.available {
            return Ok(());
        }
        let _serialized = self.guard.lock().unwrap_or_else(|e| e.into_inner());

        match self.entry(id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(EngineError::internal(format!(
                "keyring delete for {id:?}: {e}"
            ))),
        }
    }
}

/// Keyring when the desktop flag is set and the platform has one,
/// otherwise the no-op store.
pub fn create_secret_store(desktop_mode: bool) -> Box<dyn SecretStore> {
    if desktop_mode {
        let store = KeyringSecretStore::new();
        if store.is_available() {
            return Box::new(store);
        }
        log::warn!("desktop mode requested but no keyring is available");
    }
    Box::new(NoopSecretStore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DatabaseKind;

    #[test]
    fn refs_are_scoped_to_the_service() {
        assert_eq!(credential_secret_ref("prod"), "whodb:credential:prod");
    }

    #[test]
    fn noop_store_misses_and_swallows() {
        let store = NoopSecretStore;
        assert!(!store.is_available());
        assert!(store.get_credential("prod").unwrap().is_none());

        let credential = Credential::new(DatabaseKind::Postgres);
        store.store_credential("prod", &credential).unwrap();
        store.delete_credential("prod").unwrap();
    }
}
