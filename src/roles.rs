use tracing::{debug, info, warn};

use crate::domain::{RemoteResource, Role, RoleMap};

/// Maps the three storage roles onto folders: exact label first, then the
/// first folder in listing order whose name contains one of the role's keywords.
#[derive(Debug, Default)]
pub struct RoleResolver;

impl RoleResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, folders: &[RemoteResource]) -> RoleMap {
        let mut slots: [Option<RemoteResource>; 3] = [None, None, None];

        for (slot, role) in slots.iter_mut().zip(Role::ALL) {
            *slot = folders
                .iter()
                .find(|folder| folder.name == role.canonical_label())
                .cloned();
            if let Some(folder) = slot {
                info!(%role, folder = %folder.name, "role resolved by exact name");
            }
        }

        for (slot, role) in slots.iter_mut().zip(Role::ALL) {
            if slot.is_some() {
                continue;
            }
            *slot = folders
                .iter()
                .find(|folder| matches_keyword(&folder.name, role))
                .cloned();
            match slot {
                Some(folder) => info!(%role, folder = %folder.name, "role resolved by keyword"),
                None => warn!(%role, "no folder found for role"),
            }
        }

        let [observations, references, results] = slots;
        debug!(folders = folders.len(), "role resolution finished");
        RoleMap::from_slots(observations, references, results)
    }
}

fn matches_keyword(name: &str, role: Role) -> bool {
    let folded = name.to_lowercase();
    role.keywords()
        .iter()
        .any(|keyword| folded.contains(keyword))
}
