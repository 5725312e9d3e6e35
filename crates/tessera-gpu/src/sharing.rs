//! Queue family sharing for buffers and textures.
//!
//! A resource registered with fewer than two distinct families is exclusive:
//! the first family that records a command against it becomes its owner, and
//! moving it to another family needs a release barrier on the owner and a
//! matching acquire barrier on the receiver. A resource registered with two
//! or more families is concurrent and may be used by any of them.

use crate::error::ProtocolViolation;
use ash::vk;
use parking_lot::Mutex;

/// How a resource is shared between queue families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharingMode {
    Exclusive,
    Concurrent(Vec<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// No family has used the resource yet.
    Unclaimed,
    Owned(u32),
    /// A release barrier has been recorded on `from`, the acquire on `to`
    /// has not.
    Transferring { from: u32, to: u32 },
}

#[derive(Debug)]
pub(crate) struct Sharing {
    mode: SharingMode,
    ownership: Mutex<Ownership>,
}

impl Sharing {
    /// Build from the registered families, ignoring duplicates.
    pub fn from_families(families: &[u32]) -> Self {
        let mut unique: Vec<u32> = Vec::with_capacity(families.len());
        for &family in families {
            if !unique.contains(&family) {
                unique.push(family);
            }
        }
        match unique.len() {
            0 => Self {
                mode: SharingMode::Exclusive,
                ownership: Mutex::new(Ownership::Unclaimed),
            },
            1 => Self {
                mode: SharingMode::Exclusive,
                ownership: Mutex::new(Ownership::Owned(unique[0])),
            },
            _ => Self {
                mode: SharingMode::Concurrent(unique),
                ownership: Mutex::new(Ownership::Unclaimed),
            },
        }
    }

    pub fn mode(&self) -> &SharingMode {
        &self.mode
    }

    /// Vulkan sharing mode and the family list to pass along with it.
    pub fn vk_mode(&self) -> (vk::SharingMode, &[u32]) {
        match &self.mode {
            SharingMode::Exclusive => (vk::SharingMode::EXCLUSIVE, &[]),
            SharingMode::Concurrent(families) => (vk::SharingMode::CONCURRENT, families),
        }
    }

    pub fn ownership(&self) -> Ownership {
        *self.ownership.lock()
    }

    /// Check that `family` may record a command using the resource without
    /// claiming it.
    pub fn check(&self, family: u32) -> Result<(), ProtocolViolation> {
        if let SharingMode::Concurrent(families) = &self.mode {
            if families.contains(&family) {
                return Ok(());
            }
            return Err(ProtocolViolation::ExclusiveOwnership {
                owner: families[0],
                family,
            });
        }
        Self::check_ownership(*self.ownership.lock(), family)
    }

    /// Check that `family` may record a command using the resource, claiming
    /// unowned exclusive resources.
    pub fn access(&self, family: u32) -> Result<(), ProtocolViolation> {
        if matches!(self.mode, SharingMode::Concurrent(_)) {
            return self.check(family);
        }
        let mut ownership = self.ownership.lock();
        Self::check_ownership(*ownership, family)?;
        *ownership = Ownership::Owned(family);
        Ok(())
    }

    fn check_ownership(ownership: Ownership, family: u32) -> Result<(), ProtocolViolation> {
        match ownership {
            Ownership::Unclaimed => Ok(()),
            Ownership::Owned(owner) if owner == family => Ok(()),
            Ownership::Owned(owner) => Err(ProtocolViolation::ExclusiveOwnership { owner, family }),
            Ownership::Transferring { from, to } => {
                Err(ProtocolViolation::OwnershipTransferPending { from, to })
            }
        }
    }

    /// Record a release from `from` to `to`.
    pub fn release(&self, from: u32, to: u32) -> Result<(), ProtocolViolation> {
        if matches!(self.mode, SharingMode::Concurrent(_)) {
            return Err(ProtocolViolation::ConcurrentOwnershipTransfer);
        }
        self.access(from)?;
        *self.ownership.lock() = Ownership::Transferring { from, to };
        Ok(())
    }

    /// Record the acquire completing a release to `family`. Returns the
    /// releasing family.
    pub fn acquire(&self, family: u32) -> Result<u32, ProtocolViolation> {
        if matches!(self.mode, SharingMode::Concurrent(_)) {
            return Err(ProtocolViolation::ConcurrentOwnershipTransfer);
        }
        let mut ownership = self.ownership.lock();
        match *ownership {
            Ownership::Transferring { from, to } if to == family => {
                *ownership = Ownership::Owned(family);
                Ok(from)
            }
            _ => Err(ProtocolViolation::NoOwnershipRelease { family }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fewer_than_two_families_is_exclusive() {
        assert_eq!(Sharing::from_families(&[]).vk_mode().0, vk::SharingMode::EXCLUSIVE);
        let single = Sharing::from_families(&[2, 2]);
        assert_eq!(single.vk_mode().0, vk::SharingMode::EXCLUSIVE);
        assert_eq!(single.ownership(), Ownership::Owned(2));
    }

    #[test]
    fn concurrent_lists_each_family_once() {
        let sharing = Sharing::from_families(&[0, 2, 0]);
        let (mode, families) = sharing.vk_mode();
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(families, &[0, 2]);
        assert!(sharing.access(2).is_ok());
        assert!(sharing.access(1).is_err());
    }

    #[test]
    fn first_use_claims_exclusive_resource() {
        let sharing = Sharing::from_families(&[]);
        sharing.access(1).unwrap();
        assert_eq!(
            sharing.access(0),
            Err(ProtocolViolation::ExclusiveOwnership { owner: 1, family: 0 })
        );
    }

    #[test]
    fn checking_leaves_ownership_alone() {
        let sharing = Sharing::from_families(&[]);
        sharing.check(1).unwrap();
        assert_eq!(sharing.ownership(), Ownership::Unclaimed);
        sharing.access(1).unwrap();
        assert_eq!(
            sharing.check(0),
            Err(ProtocolViolation::ExclusiveOwnership { owner: 1, family: 0 })
        );
        assert_eq!(sharing.ownership(), Ownership::Owned(1));
    }

    #[test]
    fn transfer_needs_release_then_acquire() {
        let sharing = Sharing::from_families(&[0]);
        assert_eq!(
            sharing.acquire(1),
            Err(ProtocolViolation::NoOwnershipRelease { family: 1 })
        );
        sharing.release(0, 1).unwrap();
        assert!(sharing.access(0).is_err());
        assert!(sharing.access(1).is_err());
        assert_eq!(sharing.acquire(1), Ok(0));
        assert!(sharing.access(1).is_ok());
    }
}
