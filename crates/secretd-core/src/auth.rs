//! Role-based authorization and the claims document.
//!
//! Roles grant actions on subjects. The claims document attributes roles to
//! local users and groups; the daemon resolves a connection's peer
//! credentials against it to produce an [`Identity`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Subjects which can be acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    /// Every subject.
    All,
    /// The secrets catalog.
    Secrets,
    /// Secret instances and their operations.
    Instances,
}

/// Actions which can be performed upon subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Every action.
    Any,
    /// Enumerate.
    List,
    /// Inspect.
    Read,
    /// Mutate.
    Write,
}

/// A set of required or granted (subject, action) pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(
    /// Required or granted action per subject.
    pub HashMap<Subject, Action>,
);

impl Permissions {
    /// Builds a permission set from pairs.
    #[must_use]
    pub fn of<const N: usize>(pairs: [(Subject, Action); N]) -> Self {
        Self(pairs.into_iter().collect())
    }
}

/// A role and its granted permissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Granted permissions by subject.
    #[serde(default)]
    pub permissions: Permissions,
}

impl Role {
    /// Whether this role grants `action` on `subject` directly.
    ///
    /// `any` satisfies every action; otherwise the granted action must
    /// equal the required one.
    #[must_use]
    pub fn permits(&self, subject: Subject, action: Action) -> bool {
        match self.permissions.0.get(&subject) {
            Some(granted) => *granted == action || *granted == Action::Any,
            None => false,
        }
    }
}

/// Roles keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roles(
    /// Role definitions by name.
    pub HashMap<String, Role>,
);

impl Roles {
    /// Whether some claimed role satisfies every required pair, through
    /// either the subject's own entry or the `all` entry.
    #[must_use]
    pub fn check_permission(&self, claims: &[String], required: &Permissions) -> bool {
        claims.iter().any(|name| {
            let Some(role) = self.0.get(name) else {
                return false;
            };
            required
                .0
                .iter()
                .all(|(subject, action)| {
                    role.permits(*subject, *action) || role.permits(Subject::All, *action)
                })
        })
    }

    /// As [`Roles::check_permission`], failing with [`Error::Forbidden`].
    pub fn assert_permission(&self, claims: &[String], required: &Permissions) -> Result<()> {
        if self.check_permission(claims, required) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "operation not permitted with claimed roles {claims:?}"
            )))
        }
    }
}

/// A user or group key in the claims document.
///
/// Keys are written `"ID"`, `"NAME"`, or `"ID/NAME"`; an empty field is a
/// wildcard. A key matches when both fields match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Entity {
    /// Numeric uid or gid as a string; empty matches any id.
    pub id: String,
    /// User or group name; empty matches any name.
    pub name: String,
}

impl Entity {
    /// Whether this key matches the given id and name.
    #[must_use]
    pub fn matches(&self, id: &str, name: &str) -> bool {
        (self.id.is_empty() || self.id == id) && (self.name.is_empty() || self.name == name)
    }
}

impl TryFrom<String> for Entity {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        let (first, rest) = match s.split_once('/') {
            Some((first, rest)) => (first, Some(rest)),
            None => (s.as_str(), None),
        };
        if first.parse::<u32>().is_ok() {
            Ok(Self {
                id: first.to_string(),
                name: rest.unwrap_or_default().to_string(),
            })
        } else if rest.is_none() {
            Ok(Self {
                id: String::new(),
                name: first.to_string(),
            })
        } else {
            Err(format!("invalid entity string: {s}"))
        }
    }
}

impl From<Entity> for String {
    fn from(entity: Entity) -> Self {
        match (entity.id.is_empty(), entity.name.is_empty()) {
            (true, _) => entity.name,
            (_, true) => entity.id,
            (false, false) => format!("{}/{}", entity.id, entity.name),
        }
    }
}

/// Role names claimed by an entity. Deserializes from a single role-name
/// string or an array of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ClaimedRolesRepr")]
pub struct ClaimedRoles(
    /// The claimable role names.
    pub Vec<String>,
);

#[derive(Deserialize)]
#[serde(untagged)]
enum ClaimedRolesRepr {
    One(String),
    Many(Vec<String>),
}

impl From<ClaimedRolesRepr> for ClaimedRoles {
    fn from(repr: ClaimedRolesRepr) -> Self {
        match repr {
            ClaimedRolesRepr::One(role) => Self(vec![role]),
            ClaimedRolesRepr::Many(roles) => Self(roles),
        }
    }
}

/// The claims document: which users and groups may claim which roles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Claims matched against the caller's uid and username.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub users: HashMap<Entity, ClaimedRoles>,
    /// Claims matched against any of the caller's gids and group names.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub groups: HashMap<Entity, ClaimedRoles>,
}

impl Claims {
    /// The union of roles claimable by a caller with the given user and
    /// group identities, each given as an `(id, name)` pair. Sorted for
    /// deterministic output.
    #[must_use]
    pub fn roles_for(&self, user: (&str, &str), groups: &[(String, String)]) -> Vec<String> {
        let mut roles: Vec<String> = Vec::new();
        let mut add = |claims: &HashMap<Entity, ClaimedRoles>, id: &str, name: &str| {
            for (entity, claimed) in claims {
                if entity.matches(id, name) {
                    roles.extend(claimed.0.iter().cloned());
                }
            }
        };
        add(&self.users, user.0, user.1);
        for (gid, group_name) in groups {
            add(&self.groups, gid, group_name);
        }
        roles.sort();
        roles.dedup();
        roles
    }
}

/// A resolved caller: the principal string and the roles it may claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// Caller identity of the shape `linux:<username>/<uid>`.
    pub principal: String,
    /// Claimed roles, as resolved from the claims document.
    pub roles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(json: &str) -> Roles {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn entity_key_forms() {
        let id_only = Entity::try_from("1000".to_string()).unwrap();
        assert_eq!((id_only.id.as_str(), id_only.name.as_str()), ("1000", ""));

        let name_only = Entity::try_from("alice".to_string()).unwrap();
        assert_eq!((name_only.id.as_str(), name_only.name.as_str()), ("", "alice"));

        let both = Entity::try_from("1000/alice".to_string()).unwrap();
        assert_eq!((both.id.as_str(), both.name.as_str()), ("1000", "alice"));

        assert!(Entity::try_from("alice/1000".to_string()).is_err());
    }

    #[test]
    fn entity_matching_treats_empty_as_wildcard() {
        let id_only = Entity::try_from("1000".to_string()).unwrap();
        assert!(id_only.matches("1000", "whoever"));
        assert!(!id_only.matches("1001", "whoever"));

        let both = Entity::try_from("1000/alice".to_string()).unwrap();
        assert!(both.matches("1000", "alice"));
        assert!(!both.matches("1000", "bob"));
    }

    #[test]
    fn claimed_roles_string_or_array() {
        let one: ClaimedRoles = serde_json::from_str(r#""admin""#).unwrap();
        assert_eq!(one.0, ["admin"]);
        let many: ClaimedRoles = serde_json::from_str(r#"["admin","reader"]"#).unwrap();
        assert_eq!(many.0, ["admin", "reader"]);
    }

    #[test]
    fn role_check_requires_every_pair() {
        let roles = roles(
            r#"{"reader":{"permissions":{"secrets":"read"}},
                "admin":{"permissions":{"all":"any"}}}"#,
        );
        let read = Permissions::of([(Subject::Secrets, Action::Read)]);
        let list = Permissions::of([(Subject::Secrets, Action::List)]);
        let write_both = Permissions::of([
            (Subject::Secrets, Action::Write),
            (Subject::Instances, Action::Write),
        ]);

        assert!(roles.check_permission(&["reader".into()], &read));
        assert!(!roles.check_permission(&["reader".into()], &list));
        assert!(!roles.check_permission(&["reader".into()], &write_both));
        assert!(roles.check_permission(&["admin".into()], &write_both));
        assert!(roles.check_permission(&["reader".into(), "admin".into()], &list));
        assert!(!roles.check_permission(&["unknown".into()], &read));
        assert!(!roles.check_permission(&[], &read));
    }

    #[test]
    fn all_entry_satisfies_specific_subjects() {
        let roles = roles(r#"{"auditor":{"permissions":{"all":"read"}}}"#);
        assert!(roles.check_permission(
            &["auditor".into()],
            &Permissions::of([(Subject::Instances, Action::Read)])
        ));
        assert!(!roles.check_permission(
            &["auditor".into()],
            &Permissions::of([(Subject::Instances, Action::Write)])
        ));
    }

    #[test]
    fn claims_union_over_users_and_groups() {
        let claims: Claims = serde_json::from_str(
            r#"{"users":{"1000":"operator"},"groups":{"wheel":["admin","operator"]}}"#,
        )
        .unwrap();
        let roles = claims.roles_for(
            ("1000", "alice"),
            &[("10".into(), "wheel".into()), ("1000".into(), "alice".into())],
        );
        assert_eq!(roles, ["admin", "operator"]);

        let none = claims.roles_for(("1001", "bob"), &[("20".into(), "users".into())]);
        assert!(none.is_empty());
    }
}
