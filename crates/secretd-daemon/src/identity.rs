//! Caller identity from Unix socket peer credentials.
//!
//! Authentication establishes the peer's user and groups from `SO_PEERCRED`
//! and the system user database; authorization then resolves the claimed
//! roles from the configured claims document. The principal has the shape
//! `linux:<username>/<uid>`.

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use nix::unistd::{getgrouplist, Gid, Group, Uid, User};
use secretd_core::auth::{Claims, Identity};
use secretd_core::error::{Error, Result};
use tokio::net::UnixListener;

/// Peer credentials extracted from the Unix socket at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCreds {
    /// User id of the peer process.
    pub uid: u32,
    /// Group id of the peer process.
    pub gid: u32,
}

impl PeerCreds {
    /// A sentinel that fails user lookup, used when the socket yields no
    /// credentials. Requests authenticate per-request, so the connection is
    /// accepted and the failure surfaces as `Unauthenticated`.
    const UNKNOWN: Self = Self {
        uid: u32::MAX,
        gid: u32::MAX,
    };
}

impl Connected<IncomingStream<'_, UnixListener>> for PeerCreds {
    fn connect_info(stream: IncomingStream<'_, UnixListener>) -> Self {
        match stream.io().peer_cred() {
            Ok(cred) => Self {
                uid: cred.uid(),
                gid: cred.gid(),
            },
            Err(_) => Self::UNKNOWN,
        }
    }
}

/// Resolves the peer to a principal and its claimed roles.
///
/// # Errors
///
/// [`Error::Unauthenticated`] when the peer's user, primary group, or any
/// of its supplementary groups cannot be resolved.
pub fn resolve_identity(peer: &PeerCreds, claims: &Claims) -> Result<Identity> {
    let user = User::from_uid(Uid::from_raw(peer.uid))
        .map_err(|e| unauthenticated("failed to lookup credential user", &e))?
        .ok_or_else(|| Error::Unauthenticated("failed to lookup credential user".to_string()))?;

    let mut groups: Vec<(String, String)> = Vec::new();
    let primary = Group::from_gid(Gid::from_raw(peer.gid))
        .map_err(|e| unauthenticated("failed to lookup credential group", &e))?
        .ok_or_else(|| Error::Unauthenticated("failed to lookup credential group".to_string()))?;
    push_group(&mut groups, &primary);

    let username = std::ffi::CString::new(user.name.clone())
        .map_err(|e| unauthenticated("invalid username", &e))?;
    let gids = getgrouplist(&username, user.gid)
        .map_err(|e| unauthenticated("failed to find user groups", &e))?;
    for gid in gids {
        let group = Group::from_gid(gid)
            .map_err(|e| unauthenticated("failed to lookup user group", &e))?
            .ok_or_else(|| Error::Unauthenticated("failed to lookup user group".to_string()))?;
        push_group(&mut groups, &group);
    }

    let uid = peer.uid.to_string();
    let roles = claims.roles_for((&uid, &user.name), &groups);
    Ok(Identity {
        principal: format!("linux:{}/{uid}", user.name),
        roles,
    })
}

/// The principal for the process's own user, used by front-ends operating
/// on a local journal without a socket in between.
pub fn local_principal() -> Result<String> {
    let uid = nix::unistd::getuid();
    let user = User::from_uid(uid)
        .map_err(|e| unauthenticated("failed to lookup current user", &e))?
        .ok_or_else(|| Error::Unauthenticated("failed to lookup current user".to_string()))?;
    Ok(format!("linux:{}/{}", user.name, uid.as_raw()))
}

fn push_group(groups: &mut Vec<(String, String)>, group: &Group) {
    let entry = (group.gid.as_raw().to_string(), group.name.clone());
    if !groups.contains(&entry) {
        groups.push(entry);
    }
}

fn unauthenticated(context: &str, err: &dyn std::fmt::Display) -> Error {
    Error::Unauthenticated(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use secretd_core::auth::{ClaimedRoles, Entity};

    use super::*;

    fn current_peer() -> PeerCreds {
        PeerCreds {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    #[test]
    fn resolves_the_current_user() {
        let mut claims = Claims::default();
        claims.users.insert(
            Entity {
                id: nix::unistd::getuid().as_raw().to_string(),
                name: String::new(),
            },
            ClaimedRoles(vec!["admin".to_string()]),
        );

        let identity = resolve_identity(&current_peer(), &claims).unwrap();
        assert!(identity.principal.starts_with("linux:"));
        assert!(identity
            .principal
            .ends_with(&format!("/{}", nix::unistd::getuid().as_raw())));
        assert_eq!(identity.roles, ["admin"]);
    }

    #[test]
    fn unmatched_claims_resolve_to_no_roles() {
        let identity = resolve_identity(&current_peer(), &Claims::default()).unwrap();
        assert!(identity.roles.is_empty());
    }

    #[test]
    fn unknown_peer_is_unauthenticated() {
        let err = resolve_identity(&PeerCreds::UNKNOWN, &Claims::default()).unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)), "{err:?}");
    }

    #[test]
    fn local_principal_has_the_expected_shape() {
        let principal = local_principal().unwrap();
        let uid = nix::unistd::getuid().as_raw();
        assert!(principal.starts_with("linux:"));
        assert!(principal.ends_with(&format!("/{uid}")));
    }
}
