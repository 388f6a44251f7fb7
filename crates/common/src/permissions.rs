//! Permission screens and the store that owns them.
//!
//! A screen is the ACL object for one administrative scope: the global
//! `root` scope, a pool (`host.pool`), or a server (`host.pool.server`).
//! Screen existence is the control plane's source of truth for whether a
//! pool/server exists, independent of whatever files exist on disk:
//! pool and server screens are created as the side effect of a successful
//! create-class command and destroyed by the matching delete.
//!
//! The store is explicitly constructed and explicitly shared; the root
//! screen is created exactly once, by the constructor.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ControlError;

/// Sentinel permission: holding `all` authorizes every named permission on
/// the screen.
pub const ALL_PERMISSION: &str = "all";

/// Identifies one permission screen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScreenKey {
    Root,
    Pool { host: String, pool: String },
    Server { host: String, pool: String, server: String },
}

impl ScreenKey {
    /// Parse a canonical dotted key: `root`, `host.pool`, or
    /// `host.pool.server`. Segments normalize to lowercase.
    pub fn parse(raw: &str) -> Result<Self, ControlError> {
        let lowered = raw.trim().to_ascii_lowercase();
        let segments: Vec<&str> = lowered.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ControlError::Validation(format!("malformed scope '{raw}'")));
        }
        match segments.as_slice() {
            ["root"] => Ok(ScreenKey::Root),
            [host, pool] => Ok(ScreenKey::Pool {
                host: host.to_string(),
                pool: pool.to_string(),
            }),
            [host, pool, server] => Ok(ScreenKey::Server {
                host: host.to_string(),
                pool: pool.to_string(),
                server: server.to_string(),
            }),
            _ => Err(ControlError::Validation(format!("malformed scope '{raw}'"))),
        }
    }

    pub fn pool(host: &str, pool: &str) -> Self {
        ScreenKey::Pool {
            host: host.to_ascii_lowercase(),
            pool: pool.to_ascii_lowercase(),
        }
    }

    pub fn server(host: &str, pool: &str, server: &str) -> Self {
        ScreenKey::Server {
            host: host.to_ascii_lowercase(),
            pool: pool.to_ascii_lowercase(),
            server: server.to_ascii_lowercase(),
        }
    }

    /// The pool this key lives under, if any.
    pub fn parent_pool(&self) -> Option<(&str, &str)> {
        match self {
            ScreenKey::Root => None,
            ScreenKey::Pool { host, pool } => Some((host, pool)),
            ScreenKey::Server { host, pool, .. } => Some((host, pool)),
        }
    }
}

impl fmt::Display for ScreenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScreenKey::Root => f.write_str("root"),
            ScreenKey::Pool { host, pool } => write!(f, "{host}.{pool}"),
            ScreenKey::Server { host, pool, server } => write!(f, "{host}.{pool}.{server}"),
        }
    }
}

/// One scope's ACL: immutable owner, grantor set, permission grants.
#[derive(Debug, Clone)]
pub struct Screen {
    owner: String,
    grantors: BTreeSet<String>,
    grants: BTreeMap<String, BTreeSet<String>>,
}

impl Screen {
    fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            grantors: BTreeSet::new(),
            grants: BTreeMap::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn grantors(&self) -> &BTreeSet<String> {
        &self.grantors
    }

    /// The owner is an implicit grantor.
    pub fn is_grantor(&self, user: &str) -> bool {
        user == self.owner || self.grantors.contains(user)
    }

    pub fn holds(&self, user: &str, perm: &str) -> bool {
        let held = |name: &str| {
            self.grants
                .get(name)
                .map(|ids| ids.contains(user))
                .unwrap_or(false)
        };
        held(ALL_PERMISSION) || held(perm)
    }
}

pub struct PermissionStore {
    screens: HashMap<ScreenKey, Screen>,
}

impl PermissionStore {
    /// Construct the store, creating the `root` screen. This is the one
    /// place the root screen comes into existence for the store's lifetime.
    pub fn new(root_owner: &str) -> Self {
        let mut screens = HashMap::new();
        screens.insert(ScreenKey::Root, Screen::new(root_owner));
        Self { screens }
    }

    pub fn contains(&self, key: &ScreenKey) -> bool {
        self.screens.contains_key(key)
    }

    pub fn screen(&self, key: &ScreenKey) -> Result<&Screen, ControlError> {
        self.screens
            .get(key)
            .ok_or_else(|| ControlError::NotFound(format!("screen {key}")))
    }

    /// Create a screen owned by `owner` with `all` granted to the owner.
    pub fn create_screen(&mut self, key: ScreenKey, owner: &str) -> Result<(), ControlError> {
        if self.screens.contains_key(&key) {
            return Err(ControlError::Validation(format!("screen {key} exists")));
        }
        let mut screen = Screen::new(owner);
        screen
            .grants
            .entry(ALL_PERMISSION.to_string())
            .or_default()
            .insert(owner.to_string());
        debug!(screen = %key, owner, "screen created");
        self.screens.insert(key, screen);
        Ok(())
    }

    /// Remove a screen. Removing a pool screen cascades to the server
    /// screens beneath it.
    pub fn remove_screen(&mut self, key: &ScreenKey) -> Result<(), ControlError> {
        if matches!(key, ScreenKey::Root) {
            return Err(ControlError::Validation("root screen is permanent".into()));
        }
        if self.screens.remove(key).is_none() {
            return Err(ControlError::NotFound(format!("screen {key}")));
        }
        if let ScreenKey::Pool { host, pool } = key {
            self.screens.retain(|k, _| match k {
                ScreenKey::Server { host: h, pool: p, .. } => !(h == host && p == pool),
                _ => true,
            });
        }
        debug!(screen = %key, "screen removed");
        Ok(())
    }

    pub fn is_grantor(&self, key: &ScreenKey, user: &str) -> Result<bool, ControlError> {
        Ok(self.screen(key)?.is_grantor(user))
    }

    pub fn test_permission(
        &self,
        key: &ScreenKey,
        user: &str,
        perm: &str,
    ) -> Result<bool, ControlError> {
        Ok(self.screen(key)?.holds(user, perm))
    }

    /// Append `user` to the screen's holders of `perm`.
    ///
    /// Returns whether the mutation was applied: an actor failing the
    /// grantor check is a no-op that only logs, by design.
    pub fn grant(
        &mut self,
        key: &ScreenKey,
        actor: &str,
        user: &str,
        perm: &str,
    ) -> Result<bool, ControlError> {
        self.grantor_checked(key, actor, "grant", |screen| {
            screen
                .grants
                .entry(perm.to_string())
                .or_default()
                .insert(user.to_string());
        })
    }

    /// Remove `user` from the holders of `perm`; no-op when not held.
    pub fn revoke(
        &mut self,
        key: &ScreenKey,
        actor: &str,
        user: &str,
        perm: &str,
    ) -> Result<bool, ControlError> {
        self.grantor_checked(key, actor, "revoke", |screen| {
            if let Some(ids) = screen.grants.get_mut(perm) {
                ids.remove(user);
                if ids.is_empty() {
                    screen.grants.remove(perm);
                }
            }
        })
    }

    pub fn make_grantor(
        &mut self,
        key: &ScreenKey,
        actor: &str,
        user: &str,
    ) -> Result<bool, ControlError> {
        self.grantor_checked(key, actor, "make_grantor", |screen| {
            screen.grantors.insert(user.to_string());
        })
    }

    pub fn unmake_grantor(
        &mut self,
        key: &ScreenKey,
        actor: &str,
        user: &str,
    ) -> Result<bool, ControlError> {
        self.grantor_checked(key, actor, "unmake_grantor", |screen| {
            screen.grantors.remove(user);
        })
    }

    fn grantor_checked(
        &mut self,
        key: &ScreenKey,
        actor: &str,
        op: &str,
        mutate: impl FnOnce(&mut Screen),
    ) -> Result<bool, ControlError> {
        let screen = self
            .screens
            .get_mut(key)
            .ok_or_else(|| ControlError::NotFound(format!("screen {key}")))?;
        if !screen.is_grantor(actor) {
            warn!(screen = %key, actor, op, "refused: actor is not a grantor");
            return Ok(false);
        }
        mutate(screen);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.screens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.screens.is_empty()
    }

    // --- snapshot ---------------------------------------------------------

    /// Serialize every screen as `{properties, permissions}` keyed by the
    /// canonical scope string.
    pub fn save_snapshot(&self, path: &Path) -> io::Result<()> {
        let mut doc: BTreeMap<String, ScreenSnapshot> = BTreeMap::new();
        for (key, screen) in &self.screens {
            doc.insert(
                key.to_string(),
                ScreenSnapshot {
                    properties: ScreenProperties {
                        owner: screen.owner.clone(),
                        grantors: screen.grantors.clone(),
                        scope: key.to_string(),
                    },
                    permissions: screen.grants.clone(),
                },
            );
        }

        // Atomic: write a sibling temp file, sync, rename over the target.
        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        serde_json::to_writer_pretty(&mut file, &doc)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)
    }

    /// Rebuild a store from a snapshot, normalizing keys to canonical form.
    /// The root screen is created if the snapshot lacks one.
    pub fn load_snapshot(path: &Path, root_owner: &str) -> io::Result<Self> {
        let file = File::open(path)?;
        let doc: BTreeMap<String, ScreenSnapshot> = serde_json::from_reader(file)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("failed to parse snapshot {}: {e}", path.display()),
                )
            })?;

        let mut store = Self::new(root_owner);
        for (raw_key, snapshot) in doc {
            let key = ScreenKey::parse(&raw_key).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("snapshot key: {e}"))
            })?;
            let screen = Screen {
                owner: snapshot.properties.owner,
                grantors: snapshot.properties.grantors,
                grants: snapshot.permissions,
            };
            store.screens.insert(key, screen);
        }
        Ok(store)
    }
}

#[derive(Serialize, Deserialize)]
struct ScreenSnapshot {
    properties: ScreenProperties,
    permissions: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Serialize, Deserialize)]
struct ScreenProperties {
    owner: String,
    #[serde(default)]
    grantors: BTreeSet<String>,
    scope: String,
}
