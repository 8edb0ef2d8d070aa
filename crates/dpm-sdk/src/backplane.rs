//! Crate-wide backplane roles.
//!
//! A handful of backplane lines have a single master at any time: the
//! trigger director, the wait-sync leader, and the bus pullup owner. The
//! backplane tracks which slot currently holds each role; mutation happens
//! only under the crate lock, and modules consult it when variable writes
//! touch backplane-coupled bits.

use parking_lot::Mutex;

use crate::module::Module;
use crate::param::{ModuleVar, Value};

/// ModCSRB bits that claim backplane roles.
pub mod csrb {
    /// Module drives the trigger lines (director).
    pub const DIRECTOR: u32 = 1 << 0;
    /// Module sources the wait-sync signal.
    pub const WAIT_SYNC_LEADER: u32 = 1 << 4;
    /// Module terminates the bus with pullups.
    pub const PULLUP: u32 = 1 << 13;
}

#[derive(Debug, Default, Clone)]
struct Roles {
    /// Number of slots the backplane was sized for.
    slots: usize,
    /// Slot of the trigger director, if any.
    director: Option<usize>,
    /// Slot sourcing wait-sync, if any.
    wait_sync_leader: Option<usize>,
    /// Slot owning the pullups, if any.
    pullup: Option<usize>,
}

/// Shared backplane state for one crate.
#[derive(Debug, Default)]
pub struct Backplane {
    roles: Mutex<Roles>,
}

impl Backplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the backplane for a freshly enumerated crate and drop all role
    /// assignments.
    pub fn init(&self, slots: usize) {
        let mut roles = self.roles.lock();
        *roles = Roles { slots, ..Roles::default() };
        tracing::debug!("backplane: init: slots={slots}");
    }

    /// Recompute role ownership after boot or assignment. The director is
    /// the lowest-slot online module with the director bit raised; roles
    /// held by offline modules are released.
    ///
    /// Module state is gathered before the roles lock is taken; the lock
    /// order is always module then backplane.
    pub fn reinit(&self, online: &[std::sync::Arc<Module>], offline: &[std::sync::Arc<Module>]) {
        let mut claims: Vec<(usize, u32)> = online
            .iter()
            .filter(|m| m.online())
            .map(|m| (m.slot(), m.cached_var(ModuleVar::ModCsrB)))
            .collect();
        claims.sort_by_key(|&(slot, _)| slot);

        let mut roles = self.roles.lock();
        roles.slots = online.len() + offline.len();
        roles.director = None;
        roles.wait_sync_leader = None;
        roles.pullup = None;

        for (slot, csrb) in claims {
            if roles.director.is_none() && csrb & csrb::DIRECTOR != 0 {
                roles.director = Some(slot);
            }
            if roles.wait_sync_leader.is_none() && csrb & csrb::WAIT_SYNC_LEADER != 0 {
                roles.wait_sync_leader = Some(slot);
            }
            if roles.pullup.is_none() && csrb & csrb::PULLUP != 0 {
                roles.pullup = Some(slot);
            }
        }
        tracing::debug!(
            "backplane: reinit: director={:?} wait-sync={:?} pullup={:?}",
            roles.director,
            roles.wait_sync_leader,
            roles.pullup
        );
    }

    /// Release any roles held by a module going offline.
    pub fn offline(&self, slot: usize) {
        let mut roles = self.roles.lock();
        if roles.director == Some(slot) {
            roles.director = None;
        }
        if roles.wait_sync_leader == Some(slot) {
            roles.wait_sync_leader = None;
        }
        if roles.pullup == Some(slot) {
            roles.pullup = None;
        }
    }

    /// Claim the roles a ModCSRB value asks for. Returns the bits that had
    /// to be dropped because another slot already holds the role.
    pub fn claim(&self, slot: usize, csrb: Value) -> Value {
        let mut roles = self.roles.lock();
        let Roles { director, wait_sync_leader, pullup, .. } = &mut *roles;
        let mut denied = 0;
        for (bit, role) in [
            (csrb::DIRECTOR, director),
            (csrb::WAIT_SYNC_LEADER, wait_sync_leader),
            (csrb::PULLUP, pullup),
        ] {
            if csrb & bit != 0 {
                match role {
                    Some(owner) if *owner != slot => denied |= bit,
                    _ => *role = Some(slot),
                }
            } else if *role == Some(slot) {
                *role = None;
            }
        }
        if denied != 0 {
            tracing::warn!("backplane: slot {slot}: roles denied: {denied:#x}");
        }
        denied
    }

    /// Slot of the current trigger director.
    pub fn director(&self) -> Option<usize> {
        self.roles.lock().director
    }

    /// Slot of the current wait-sync leader.
    pub fn wait_sync_leader(&self) -> Option<usize> {
        self.roles.lock().wait_sync_leader
    }

    /// Slot of the current pullup owner.
    pub fn pullup(&self) -> Option<usize> {
        self.roles.lock().pullup
    }

    /// Number of slots the backplane was last sized for.
    pub fn size(&self) -> usize {
        self.roles.lock().slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_per_role() {
        let bp = Backplane::new();
        bp.init(4);
        assert_eq!(bp.claim(2, csrb::DIRECTOR | csrb::PULLUP), 0);
        assert_eq!(bp.claim(5, csrb::DIRECTOR), csrb::DIRECTOR);
        assert_eq!(bp.director(), Some(2));
        // Releasing by writing the bit low frees the role.
        assert_eq!(bp.claim(2, 0), 0);
        assert_eq!(bp.director(), None);
        assert_eq!(bp.claim(5, csrb::DIRECTOR), 0);
        assert_eq!(bp.director(), Some(5));
    }

    #[test]
    fn offline_releases_roles() {
        let bp = Backplane::new();
        bp.init(2);
        bp.claim(3, csrb::WAIT_SYNC_LEADER);
        bp.offline(3);
        assert_eq!(bp.wait_sync_leader(), None);
    }
}
