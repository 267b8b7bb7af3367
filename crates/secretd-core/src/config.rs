//! Configuration file loading.
//!
//! Two inputs: the secrets catalog (a JSON array of plan nodes) and the
//! permissions document (roles plus claims). Both are loaded once at
//! startup and immutable afterwards; parse failures are fatal.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::auth::{Claims, Roles};
use crate::error::{Error, Result};
use crate::secrets::Secrets;

/// The permissions document: role definitions and the claims that attribute
/// them to local users and groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    /// Role definitions by name.
    #[serde(default)]
    pub roles: Roles,
    /// User and group claims.
    #[serde(default)]
    pub claims: Claims,
}

/// Loads the secrets catalog.
///
/// # Errors
///
/// [`Error::BadConfig`] on unreadable or unparseable input, empty ids, or
/// duplicate sibling ids.
pub fn load_secrets(path: &Path) -> Result<Secrets> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::BadConfig(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::BadConfig(format!("failed to parse {}: {e}", path.display())))
}

/// Loads the permissions document.
///
/// # Errors
///
/// [`Error::BadConfig`] on unreadable or unparseable input.
pub fn load_permissions(path: &Path) -> Result<Permissions> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::BadConfig(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::BadConfig(format!("failed to parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_a_catalog() {
        let file = write_temp(r#"[{"id":"friend","create":"echo hi"}]"#);
        let secrets = load_secrets(file.path()).unwrap();
        assert_eq!(secrets.len(), 1);
        assert!(secrets.get("friend").is_some());
    }

    #[test]
    fn duplicate_ids_are_bad_config() {
        let file = write_temp(r#"[{"id":"x"},{"id":"x"}]"#);
        let err = load_secrets(file.path()).unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)), "{err:?}");
    }

    #[test]
    fn loads_permissions_with_claims() {
        let file = write_temp(
            r#"{
                "roles": {
                    "reader": {"permissions": {"secrets": "read"}},
                    "admin": {"permissions": {"all": "any"}}
                },
                "claims": {
                    "users": {"0/root": "admin"},
                    "groups": {"wheel": ["admin"]}
                }
            }"#,
        );
        let permissions = load_permissions(file.path()).unwrap();
        assert_eq!(permissions.roles.0.len(), 2);
        assert_eq!(permissions.claims.users.len(), 1);
        let roles = permissions
            .claims
            .roles_for(("0", "root"), &[("0".into(), "root".into())]);
        assert_eq!(roles, ["admin"]);
    }

    #[test]
    fn missing_file_is_bad_config() {
        let err = load_secrets(Path::new("/nonexistent/secrets.json")).unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)));
    }
}
