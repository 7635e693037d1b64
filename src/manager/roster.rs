//! Candidate networks and the failover cursor

use crate::config::{DescriptorProfile, NetworkDescriptor};

/// Ordered candidate list with a circular cursor
#[derive(Debug, Clone)]
pub struct NetworkRoster {
    descriptors: Vec<NetworkDescriptor>,
    index: usize,
    profile: DescriptorProfile,
    hopping: bool,
}

impl NetworkRoster {
    /// `start_index` must be in range and `descriptors` non-empty
    pub(crate) fn new(descriptors: Vec<NetworkDescriptor>, start_index: usize, hopping: bool) -> Self {
        let profile = descriptors[start_index].profile();
        Self {
            descriptors,
            index: start_index,
            profile,
            hopping,
        }
    }

    pub fn current(&self) -> &NetworkDescriptor {
        &self.descriptors[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Presence flags of the selected descriptor
    pub fn profile(&self) -> DescriptorProfile {
        self.profile
    }

    pub fn hopping_enabled(&self) -> bool {
        self.hopping
    }

    pub fn set_hopping(&mut self, hopping: bool) {
        self.hopping = hopping;
    }

    /// Move to the next descriptor, wrapping at the end
    ///
    /// Returns `None` without moving when hopping is disabled.
    pub fn advance(&mut self) -> Option<&NetworkDescriptor> {
        if !self.hopping {
            return None;
        }
        self.index = (self.index + 1) % self.descriptors.len();
        self.profile = self.descriptors[self.index].profile();
        Some(&self.descriptors[self.index])
    }
}
