//! Versionbits soft-fork deployments and their threshold states.

pub type Hash256 = [u8; 32];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum DeploymentId {
    TestDummy = 0,
    Csv = 1,
    Segwit = 2,
}

pub const MAX_DEPLOYMENTS: usize = 3;

pub const ALL_DEPLOYMENTS: [DeploymentId; MAX_DEPLOYMENTS] = [
    DeploymentId::TestDummy,
    DeploymentId::Csv,
    DeploymentId::Segwit,
];

impl DeploymentId {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::TestDummy => "testdummy",
            Self::Csv => "csv",
            Self::Segwit => "segwit",
        }
    }
}

/// Versionbits signalling window for one deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deployment {
    pub bit: u8,
    /// Median-time-past at which signalling may begin.
    pub start_time: i64,
    /// Median-time-past after which an unfinished deployment fails.
    pub timeout: i64,
}

impl Deployment {
    pub const fn mask(&self) -> i32 {
        1i32 << self.bit
    }

    /// Whether a block version counts as a vote for this deployment.
    pub fn signals(&self, version: i32) -> bool {
        (version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS && (version & self.mask()) != 0
    }
}

pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;
pub const VERSIONBITS_TOP_MASK: i32 = 0xE000_0000u32 as i32;
pub const VERSIONBITS_NUM_BITS: u8 = 29;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Defined => "defined",
            Self::Started => "started",
            Self::LockedIn => "locked_in",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }
}

/// Threshold state of every deployment for the block following some tip.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeploymentStates([ThresholdState; MAX_DEPLOYMENTS]);

impl DeploymentStates {
    pub const fn all_defined() -> Self {
        Self([ThresholdState::Defined; MAX_DEPLOYMENTS])
    }

    pub fn get(&self, id: DeploymentId) -> ThresholdState {
        self.0[id.as_usize()]
    }

    pub fn set(&mut self, id: DeploymentId, state: ThresholdState) {
        self.0[id.as_usize()] = state;
    }

    pub fn is_active(&self, id: DeploymentId) -> bool {
        self.get(id) == ThresholdState::Active
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeploymentId, ThresholdState)> + '_ {
        ALL_DEPLOYMENTS.iter().map(move |id| (*id, self.get(*id)))
    }
}

impl Default for DeploymentStates {
    fn default() -> Self {
        Self::all_defined()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signalling_requires_top_bits() {
        let csv = Deployment {
            bit: 0,
            start_time: 0,
            timeout: i64::MAX,
        };
        assert!(csv.signals(VERSIONBITS_TOP_BITS | 1));
        assert!(!csv.signals(VERSIONBITS_TOP_BITS | 2));
        assert!(!csv.signals(1));
        assert!(!csv.signals(0x6000_0001));
    }

    #[test]
    fn states_index_by_deployment() {
        let mut states = DeploymentStates::all_defined();
        states.set(DeploymentId::Csv, ThresholdState::Active);
        assert!(states.is_active(DeploymentId::Csv));
        assert!(!states.is_active(DeploymentId::Segwit));
        let active: Vec<_> = states
            .iter()
            .filter(|(_, state)| *state == ThresholdState::Active)
            .map(|(id, _)| id.name())
            .collect();
        assert_eq!(active, vec!["csv"]);
    }
}
